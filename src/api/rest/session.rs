use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::reconcile::ReconcileOutcome;
use crate::session::SessionState;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/session", get(get_session))
        .route("/session/gps", patch(set_gps))
        .route("/tracking/toggle", post(toggle_tracking))
        .route("/reconcile", post(reconcile))
}

#[derive(Deserialize)]
pub struct GpsRequest {
    pub enabled: bool,
}

#[derive(Serialize)]
pub struct TrackingResponse {
    pub tracking_enabled: bool,
}

async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionState> {
    Json(state.session.snapshot())
}

async fn set_gps(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GpsRequest>,
) -> Json<SessionState> {
    state.controller.set_gps_enabled(payload.enabled);
    Json(state.session.snapshot())
}

async fn toggle_tracking(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TrackingResponse>, AppError> {
    let tracking_enabled = state.controller.toggle_tracking().await?;
    Ok(Json(TrackingResponse { tracking_enabled }))
}

async fn reconcile(State(state): State<Arc<AppState>>) -> Result<Json<ReconcileOutcome>, AppError> {
    let outcome = state.controller.reconcile(Utc::now()).await?;
    Ok(Json(outcome))
}

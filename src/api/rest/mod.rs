pub mod routes;
pub mod sensor;
pub mod session;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::router())
        .merge(session::router())
        .merge(sensor::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    routes: usize,
    pending_writes: usize,
    active_route: Option<String>,
    tracking: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let session = state.session.snapshot();
    Json(HealthResponse {
        status: "ok",
        routes: state.engine.len(),
        pending_writes: state.outbox.len(),
        active_route: session.active_route_id().map(str::to_string),
        tracking: state.sampler.is_active().await,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}

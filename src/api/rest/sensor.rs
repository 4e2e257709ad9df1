use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tracing::debug;

use crate::error::AppError;
use crate::sensor::{RawFix, SensorError};
use crate::state::AppState;

/// Device-side ingestion: the on-board GPS pushes its fixes and errors here.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sensor/fixes", post(push_fix))
        .route("/sensor/errors", post(push_error))
}

#[derive(Serialize)]
pub struct DeliveryResponse {
    pub watchers: usize,
}

async fn push_fix(
    State(state): State<Arc<AppState>>,
    Json(fix): Json<RawFix>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let valid = fix.latitude.is_finite()
        && fix.longitude.is_finite()
        && (-90.0..=90.0).contains(&fix.latitude)
        && (-180.0..=180.0).contains(&fix.longitude);
    if !valid {
        return Err(AppError::BadRequest("coordinates out of range".to_string()));
    }

    let watchers = state.sensor.publish(fix);
    debug!(watchers, "device fix ingested");
    Ok(Json(DeliveryResponse { watchers }))
}

async fn push_error(
    State(state): State<Arc<AppState>>,
    Json(err): Json<SensorError>,
) -> Json<DeliveryResponse> {
    let watchers = state.sensor.publish_error(err);
    Json(DeliveryResponse { watchers })
}

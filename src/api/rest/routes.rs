use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, patch, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::route::{DeliveryProof, Route};
use crate::state::AppState;
use crate::tracking::track_log::{self, TrackPlayback};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/routes", post(create_route).get(list_routes))
        .route("/routes/:id", delete(delete_route))
        .route("/routes/:id/start", post(start_route))
        .route("/routes/:id/request-finish", post(request_finish))
        .route("/routes/:id/finish", post(finish_route))
        .route("/routes/:id/rating", patch(rate_route))
        .route("/routes/:id/track", get(route_track))
}

#[derive(Deserialize)]
pub struct CreateRouteRequest {
    pub id: Option<String>,
    pub origin: String,
    pub destination: String,
    #[serde(default)]
    pub distance_km: f64,
    #[serde(default)]
    pub price: f64,
    pub driver_id: Option<String>,
    pub vehicle_id: Option<String>,
}

#[derive(Deserialize)]
pub struct FinishRouteRequest {
    pub signature: String,
    pub client_name: Option<String>,
    pub client_id: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct RateRouteRequest {
    pub rating: u8,
}

fn valid_route_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn create_route(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRouteRequest>,
) -> Result<Json<Route>, AppError> {
    if payload.origin.trim().is_empty() || payload.destination.trim().is_empty() {
        return Err(AppError::BadRequest(
            "origin and destination cannot be empty".to_string(),
        ));
    }
    if !payload.distance_km.is_finite() || payload.distance_km < 0.0 {
        return Err(AppError::BadRequest("distance_km must be >= 0".to_string()));
    }
    if !payload.price.is_finite() || payload.price < 0.0 {
        return Err(AppError::BadRequest("price must be >= 0".to_string()));
    }

    let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    if !valid_route_id(&id) {
        return Err(AppError::BadRequest(format!("invalid route id: {id}")));
    }

    let mut route = Route::new(id, payload.origin, payload.destination);
    route.distance_km = payload.distance_km;
    route.price = payload.price;
    route.driver_id = payload.driver_id;
    route.vehicle_id = payload.vehicle_id;

    let created = state.engine.create(route).await?;
    Ok(Json(created))
}

async fn list_routes(State(state): State<Arc<AppState>>) -> Json<Vec<Route>> {
    Json(state.engine.routes())
}

async fn delete_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    // Durable once the remote delete lands; until then it sits in the outbox.
    let _write = state.controller.delete(&id).await?;
    if let Err(err) = track_log::clear(state.cache.as_ref(), &id) {
        tracing::warn!(route_id = %id, error = %err, "failed to clear local track buffer");
    }
    Ok(StatusCode::ACCEPTED)
}

async fn start_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Route>, AppError> {
    let transition = state.controller.start(&id).await?;
    Ok(Json(transition.route))
}

async fn request_finish(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Route>, AppError> {
    Ok(Json(state.controller.request_finish(&id)?))
}

async fn finish_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<FinishRouteRequest>,
) -> Result<Json<Route>, AppError> {
    let proof = DeliveryProof {
        signature: payload.signature,
        client_name: payload.client_name,
        client_id: payload.client_id,
        delivered_at: payload.delivered_at.unwrap_or_else(Utc::now),
        notes: payload.notes,
    };

    let transition = state.controller.finish(&id, proof).await?;
    Ok(Json(transition.route))
}

async fn rate_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<RateRouteRequest>,
) -> Result<Json<Route>, AppError> {
    let transition = state.controller.rate(&id, payload.rating)?;
    Ok(Json(transition.route))
}

async fn route_track(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TrackPlayback>, AppError> {
    if state.engine.route(&id).is_none() {
        return Err(AppError::NotFound(format!("route {id} not found")));
    }

    let playback = track_log::playback(state.remote.as_ref(), state.cache.as_ref(), &id).await;
    Ok(Json(playback))
}

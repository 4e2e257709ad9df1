use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::cache::CacheError;
use crate::models::route::RouteStatus;
use crate::remote::RemoteError;
use crate::sensor::SensorError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("route {route_id} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        route_id: String,
        from: RouteStatus,
        to: RouteStatus,
    },

    #[error("remote store: {0}")]
    Remote(#[from] RemoteError),

    #[error("sensor: {0}")]
    Sensor(#[from] SensorError),

    #[error("local cache: {0}")]
    Cache(#[from] CacheError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::Remote(_) => StatusCode::BAD_GATEWAY,
            AppError::Sensor(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Cache(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

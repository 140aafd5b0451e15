//! API route definitions
//!
//! REST endpoints for instance management and torrent operations. Real-time
//! change signals go over the WebSocket at /ws; the REST surface is where
//! clients fetch the actual data.

pub mod health;
pub mod instances;
pub mod torrents;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::qbit::QbError;

/// Error surface shared by all REST handlers. Remote failures keep their
/// upstream detail so the dashboard can show why an action failed.
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Remote(QbError),
    Internal(anyhow::Error),
}

impl From<QbError> for ApiError {
    fn from(err: QbError) -> Self {
        Self::Remote(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Remote(err) => {
                let status = match &err {
                    // The remote rejected our credentials or session; that is
                    // an upstream problem, not a caller problem.
                    QbError::Auth(_) | QbError::SessionExpired => StatusCode::BAD_GATEWAY,
                    QbError::Remote { .. } => StatusCode::BAD_GATEWAY,
                    QbError::Http(_) => StatusCode::BAD_GATEWAY,
                };
                (status, err.to_string())
            }
            Self::Internal(err) => {
                error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

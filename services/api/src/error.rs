//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use circulation_core::CirculationError;
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::ConfigError;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A rejection or failure reported by the circulation engine.
    #[error("{0}")]
    Circulation(#[from] CirculationError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents an error while applying the schema migrations.
    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller's identity headers were missing or malformed.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// The caller is known but may not perform this action.
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

/// JSON body sent with every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

// Extractor rejections are malformed input like any other.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        CirculationError::InvalidRequest(rejection.body_text()).into()
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        CirculationError::InvalidRequest(rejection.body_text()).into()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        CirculationError::InvalidRequest(rejection.body_text()).into()
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Circulation(err) => {
                let status = match err {
                    CirculationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    CirculationError::NotFound(_) => StatusCode::NOT_FOUND,
                    CirculationError::LimitExceeded(_)
                    | CirculationError::AlreadyHeld
                    | CirculationError::OutOfStock
                    | CirculationError::NoActiveRecord => StatusCode::CONFLICT,
                    CirculationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code())
            }
            ApiError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::Config(_)
            | ApiError::Database(_)
            | ApiError::Migration(_)
            | ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(
                error.cause_chain = ?self,
                error.message = %self,
                "Unexpected error happened"
            );
            "An unexpected internal error occurred".to_string()
        } else {
            self.to_string()
        };
        let body = ErrorBody {
            error: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_rejections_map_to_conflict() {
        for err in [
            CirculationError::LimitExceeded(3),
            CirculationError::AlreadyHeld,
            CirculationError::OutOfStock,
            CirculationError::NoActiveRecord,
        ] {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), StatusCode::CONFLICT);
        }
    }

    #[test]
    fn internal_failures_hide_their_details() {
        let (status, code) =
            ApiError::from(CirculationError::Internal("connection reset".into())).status_and_code();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "INTERNAL_ERROR");
        assert_eq!(
            ApiError::from(CirculationError::InvalidRequest("bad".into()))
                .status_and_code()
                .0,
            StatusCode::BAD_REQUEST
        );
    }
}

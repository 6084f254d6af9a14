use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use tavern_types::TavernError;

/// HTTP face of `TavernError`: same status, same `{message, status, data}` body.
#[derive(Debug)]
pub struct ApiError(pub TavernError);

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.is_intern() {
            error!("Internal error: {}", self.0);
        }
        let status = StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_payload())).into_response()
    }
}

impl From<TavernError> for ApiError {
    fn from(err: TavernError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(TavernError::validation_with(
            "Malformed request body",
            json!({ "reason": rejection.body_text() }),
        ))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(TavernError::validation_with(
            "Malformed path parameter",
            json!({ "reason": rejection.body_text() }),
        ))
    }
}

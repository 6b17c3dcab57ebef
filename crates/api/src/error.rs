//! Maps `CoreError`'s four-way taxonomy onto the wire error body shape
//! (§7): `{ code, description }` with `code` one of the `harmony.*`
//! constants `CoreError::code()` already returns.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tessera_core::CoreError;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub code: String,
    pub description: String,
}

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if matches!(self.0, CoreError::Service(_)) {
            tracing::error!(error = %self.0, "internal service error");
        }
        let body = ApiErrorBody {
            code: self.0.code().to_string(),
            description: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn not_found(msg: impl Into<String>) -> ApiError {
    ApiError(CoreError::not_found(msg))
}

pub fn validation(msg: impl Into<String>) -> ApiError {
    ApiError(CoreError::validation(msg))
}

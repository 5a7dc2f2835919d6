use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use conclave_core::ConclaveError;
use tracing::error;

/// A [`ConclaveError`] rendered as an HTTP response.
///
/// `Config` maps to 400, `NotFound` to 404 and everything else to 500. The
/// body is always `{"error": "<message>"}`.
#[derive(Debug)]
pub struct ApiError(pub ConclaveError);

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self.0 {
            ConclaveError::Config(_) => StatusCode::BAD_REQUEST,
            ConclaveError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ConclaveError> for ApiError {
    fn from(err: ConclaveError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

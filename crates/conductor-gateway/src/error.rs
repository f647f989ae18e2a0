use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use conductor_core::{ConductorError, ErrorKind};
use tracing::warn;

/// A [`ConductorError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ConductorError);

impl ApiError {
    /// Shorthand for a 400 with `message`.
    pub fn validation(message: impl Into<String>) -> Self {
        Self(ConductorError::Validation(message.into()))
    }

    /// HTTP status for the wrapped error's kind.
    pub fn status(&self) -> StatusCode {
        status_for(self.0.kind())
    }
}

impl From<ConductorError> for ApiError {
    fn from(err: ConductorError) -> Self {
        Self(err)
    }
}

/// HTTP status for each error class.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Provider => StatusCode::BAD_GATEWAY,
        ErrorKind::Fatal | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "Request failed");
        }
        (
            status,
            Json(serde_json::json!({
                "success": false,
                "error": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

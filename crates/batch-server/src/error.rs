//! Maps [`batch_core::Error`] onto the HTTP error contract: status code plus
//! a `{error:{message,type,code}}` JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub struct ApiError(pub batch_core::Error);

impl From<batch_core::Error> for ApiError {
    fn from(err: batch_core::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            batch_core::Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            batch_core::Error::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            batch_core::Error::NotFound(_) => StatusCode::NOT_FOUND,
            batch_core::Error::StateConflict(_) => StatusCode::CONFLICT,
            batch_core::Error::ProcessingError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            batch_core::Error::Database(_)
            | batch_core::Error::Io(_)
            | batch_core::Error::Json(_)
            | batch_core::Error::Http(_)
            | batch_core::Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error");
        }

        let body = serde_json::json!({
            "error": {
                "message": self.0.to_string(),
                "type": self.0.error_type(),
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

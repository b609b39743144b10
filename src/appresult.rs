use axum::{http::StatusCode, response::{IntoResponse, Response}};
use tracing::error;

use crate::error::{ChatError, StoreError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        if self.0.is::<StoreError>() {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        match self.0.downcast_ref::<ChatError>() {
            Some(ChatError::NotAuthorized { .. }) => StatusCode::FORBIDDEN,
            Some(ChatError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(ChatError::PayloadTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            Some(ChatError::AlreadyAttached { .. }) => StatusCode::CONFLICT,
            Some(ChatError::PersistenceFailure(_) | ChatError::Store(_)) => StatusCode::SERVICE_UNAVAILABLE,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }

        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

//! Service-specific error types

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors from admin operations that map onto an HTTP response.
///
/// Proxy failures are answered directly from [`dispatcher::DispatchError`];
/// they never pass through here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Config(#[from] common::Error),

    #[error("invalid reactivation settings: {0}")]
    Policy(#[from] key_pool::PolicyError),

    #[error("failed to save state: {0}")]
    State(#[from] key_pool::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidSettings(_) | Error::Policy(_) => StatusCode::BAD_REQUEST,
            Error::Config(common::Error::Config(_)) => StatusCode::BAD_REQUEST,
            Error::Config(_) | Error::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            [(header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": self.to_string() }).to_string(),
        )
            .into_response()
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

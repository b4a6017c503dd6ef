//! Bearer token guards
//!
//! Tokens are read from the settings store on every request. An empty token
//! disables its guard.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common::Secret;
use tracing::warn;

use crate::settings::SettingsStore;

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Malformed,
    Invalid,
}

impl AuthFailure {
    fn message(self) -> &'static str {
        match self {
            AuthFailure::Missing => "Authorization header is required",
            AuthFailure::Malformed => "Authorization header format must be Bearer {token}",
            AuthFailure::Invalid => "Invalid token",
        }
    }
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [(header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": self.message() }).to_string(),
        )
            .into_response()
    }
}

/// Compare a presented token against the expected one.
pub fn check_token(presented: &str, expected: &Secret<String>) -> Result<(), AuthFailure> {
    if expected.is_empty() || presented == expected.expose().as_str() {
        Ok(())
    } else {
        Err(AuthFailure::Invalid)
    }
}

/// Validate `Authorization: Bearer <token>` against `expected`.
pub fn check_bearer(headers: &HeaderMap, expected: &Secret<String>) -> Result<(), AuthFailure> {
    if expected.is_empty() {
        return Ok(());
    }

    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthFailure::Missing)?
        .to_str()
        .map_err(|_| AuthFailure::Malformed)?;

    let mut parts = value.split_whitespace();
    let (Some(scheme), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(AuthFailure::Malformed);
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthFailure::Malformed);
    }

    check_token(token, expected)
}

/// Guard for the `/v1` proxy routes.
pub async fn require_api_token(
    State(settings): State<Arc<SettingsStore>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let expected = settings.api_token().await;
    match check_bearer(request.headers(), &expected) {
        Ok(()) => next.run(request).await,
        Err(failure) => {
            warn!(path = %request.uri().path(), ?failure, "rejected proxy request");
            failure.into_response()
        }
    }
}

/// Guard for the `/admin/api` routes.
pub async fn require_admin_token(
    State(settings): State<Arc<SettingsStore>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let expected = settings.admin_token().await;
    match check_bearer(request.headers(), &expected) {
        Ok(()) => next.run(request).await,
        Err(failure) => {
            warn!(path = %request.uri().path(), ?failure, "rejected admin request");
            failure.into_response()
        }
    }
}

//! Dispatch failures surfaced to the caller

use reqwest::StatusCode;

/// Aggregate outcome of a dispatch that produced no upstream success.
///
/// Per-attempt failures never surface individually; they are recorded on the
/// offending key and folded into `Exhausted`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no API keys configured")]
    PoolEmpty,

    #[error("no active API key available")]
    NoActiveKey,

    #[error("all API keys failed after {attempts} attempt(s): {last_failure}")]
    Exhausted { attempts: usize, last_failure: String },

    #[error("invalid upstream request: {0}")]
    Request(String),
}

impl DispatchError {
    /// Gateway status the caller should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::PoolEmpty | DispatchError::NoActiveKey => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::Exhausted { .. } | DispatchError::Request(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

//! Retrying upstream dispatcher
//!
//! Executes one logical upstream call with failover across a [`key_pool::KeyPool`]:
//! each attempt takes the next active key, injects it as the bearer credential,
//! and disables the key if the upstream rejects it. The first 2xx response is
//! handed back unread so the caller can stream it.

pub mod dispatch;
pub mod error;
pub mod probe;

pub use dispatch::{Dispatched, Dispatcher, OutboundRequest};
pub use error::DispatchError;
pub use probe::{ProbeResult, ProbeStatus, probe_key};

/// Maximum number of characters of an upstream error body kept in a failure reason.
pub const REASON_BODY_LIMIT: usize = 200;

/// Truncate an upstream body for use in a failure reason.
pub fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(REASON_BODY_LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

//! Single-key health probe
//!
//! Sends a one-token chat completion with a specific key. The probe never
//! touches the pool; callers decide what to do with the result.

use std::time::Duration;

use key_pool::key::mask;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use tracing::debug;

use crate::truncate_body;

/// Probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Success,
    Failed,
}

/// Result of probing one key, streamed to the admin client as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// Masked key value
    #[serde(rename = "key_value")]
    pub key: String,
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ProbeResult {
    fn success(key: &str) -> Self {
        Self {
            key: mask(key),
            status: ProbeStatus::Success,
            message: "Key is working correctly".to_string(),
            error: String::new(),
        }
    }

    fn failed(key: &str, error: String) -> Self {
        Self {
            key: mask(key),
            status: ProbeStatus::Failed,
            message: String::new(),
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }
}

/// Probe `key` against `{upstream_url}/v1/chat/completions` using `model`.
pub async fn probe_key(
    client: &reqwest::Client,
    upstream_url: &str,
    key: &str,
    model: &str,
    timeout: Duration,
) -> ProbeResult {
    let url = format!(
        "{}/v1/chat/completions",
        upstream_url.trim_end_matches('/')
    );
    let payload = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hi"}],
        "max_tokens": 1,
        "stream": false,
    });
    let body = match serde_json::to_vec(&payload) {
        Ok(b) => b,
        Err(e) => return ProbeResult::failed(key, format!("failed to encode probe request: {e}")),
    };

    let sent = client
        .post(&url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {key}"))
        .timeout(timeout)
        .body(body)
        .send()
        .await;

    let response = match sent {
        Ok(r) => r,
        Err(e) => return ProbeResult::failed(key, format!("network error: {e}")),
    };

    let status = response.status();
    debug!(key = %mask(key), status = status.as_u16(), "probe finished");
    if status.is_success() {
        return ProbeResult::success(key);
    }

    let text = response.text().await.unwrap_or_default();
    ProbeResult::failed(
        key,
        format!("HTTP {}: {}", status.as_u16(), truncate_body(&text)),
    )
}

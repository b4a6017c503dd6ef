//! Retry loop over the key pool

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use key_pool::{Key, KeyPool};
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::{debug, info, instrument, warn};

use crate::error::DispatchError;
use crate::truncate_body;

/// Request template replayed on every attempt.
///
/// Only the `Authorization` header differs between attempts; any value the
/// caller leaves in `headers` is replaced with the selected key.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path and query appended to the upstream base URL, e.g. `/v1/models?x=1`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A successful upstream response, body not yet read.
#[derive(Debug)]
pub struct Dispatched {
    pub response: reqwest::Response,
    /// Attempts made, including the successful one.
    pub attempts: usize,
}

/// Sends requests upstream with failover across the pool.
pub struct Dispatcher {
    pool: Arc<KeyPool>,
    client: reqwest::Client,
    upstream_url: String,
    timeout: Duration,
}

enum Attempt {
    Success(reqwest::Response),
    Failed { reason: String, cause: &'static str },
}

impl Dispatcher {
    pub fn new(
        pool: Arc<KeyPool>,
        client: reqwest::Client,
        upstream_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            client,
            upstream_url: upstream_url.into(),
            timeout,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn upstream_url(&self) -> &str {
        &self.upstream_url
    }

    /// Run the retry loop for one logical call.
    ///
    /// The attempt budget is the pool size at the start of the call. A key that
    /// fails is disabled once and not retried within the same call, even if
    /// it is reactivated concurrently. No delay is applied between attempts.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path_and_query))]
    pub async fn dispatch(&self, request: &OutboundRequest) -> Result<Dispatched, DispatchError> {
        let budget = self.pool.len().await;
        if budget == 0 {
            warn!("no API keys configured");
            return Err(DispatchError::PoolEmpty);
        }

        let url = format!(
            "{}{}",
            self.upstream_url.trim_end_matches('/'),
            request.path_and_query
        );
        let mut last_failure: Option<String> = None;
        let mut tried: Vec<String> = Vec::with_capacity(budget);

        for attempt in 1..=budget {
            let key = match self.select_untried(&tried).await {
                Ok(Some(key)) => key,
                Ok(None) => {
                    warn!(attempt, "only keys already tried in this call are active");
                    return Err(DispatchError::Exhausted {
                        attempts: attempt - 1,
                        last_failure: last_failure.unwrap_or_default(),
                    });
                }
                Err(e) => {
                    return Err(match last_failure {
                        Some(last_failure) => {
                            warn!(attempt, "no active key left after failures");
                            DispatchError::Exhausted {
                                attempts: attempt - 1,
                                last_failure,
                            }
                        }
                        None if matches!(e, key_pool::Error::Empty) => DispatchError::PoolEmpty,
                        None => {
                            warn!("every key is disabled");
                            DispatchError::NoActiveKey
                        }
                    });
                }
            };

            debug!(attempt, budget, key = %key.masked(), "attempting upstream request");

            match self.attempt(&url, request, &key).await? {
                Attempt::Success(response) => {
                    info!(
                        attempt,
                        key = %key.masked(),
                        status = response.status().as_u16(),
                        "upstream request succeeded"
                    );
                    return Ok(Dispatched {
                        response,
                        attempts: attempt,
                    });
                }
                Attempt::Failed { reason, cause } => {
                    warn!(attempt, key = %key.masked(), reason = %reason, "upstream rejected key, disabling");
                    self.pool.disable(&key.value, &reason).await;
                    tried.push(key.value);
                    metrics::counter!("balancer_key_disabled_total", "cause" => cause).increment(1);
                    last_failure = Some(reason);
                }
            }
        }

        let last_failure = last_failure.unwrap_or_default();
        warn!(attempts = budget, last_failure = %last_failure, "all attempts failed");
        Err(DispatchError::Exhausted {
            attempts: budget,
            last_failure,
        })
    }

    /// Next active key that has not failed earlier in this call.
    ///
    /// A key reactivated concurrently after failing here is skipped. `None`
    /// when every active key has already been tried.
    async fn select_untried(&self, tried: &[String]) -> key_pool::Result<Option<Key>> {
        let probes = self.pool.len().await.max(1);
        for _ in 0..probes {
            let key = self.pool.select_next().await?;
            if !tried.contains(&key.value) {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    async fn attempt(
        &self,
        url: &str,
        request: &OutboundRequest,
        key: &Key,
    ) -> Result<Attempt, DispatchError> {
        let mut headers = request.headers.clone();
        let credential = match HeaderValue::from_str(&format!("Bearer {}", key.value)) {
            Ok(v) => v,
            Err(_) => {
                return Ok(Attempt::Failed {
                    reason: "key is not a valid header value".to_string(),
                    cause: "invalid_key",
                });
            }
        };
        headers.insert(AUTHORIZATION, credential);

        let sent = self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .timeout(self.timeout)
            .body(request.body.clone())
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) if e.is_builder() => return Err(DispatchError::Request(e.to_string())),
            Err(e) => {
                return Ok(Attempt::Failed {
                    reason: format!("network error: {e}"),
                    cause: "network",
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(Attempt::Success(response));
        }

        let body = response.text().await.unwrap_or_default();
        Ok(Attempt::Failed {
            reason: format!("HTTP {}: {}", status.as_u16(), truncate_body(&body)),
            cause: "http",
        })
    }
}

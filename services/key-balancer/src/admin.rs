//! Admin API for key management
//!
//! Endpoints (admin-token guarded):
//! - GET    /admin/api/keys             list keys with status
//! - POST   /admin/api/keys             add a key `{value}`
//! - DELETE /admin/api/keys             remove a key `{value}`
//! - POST   /admin/api/keys/reactivate  `{value}`
//! - POST   /admin/api/keys/disable     `{value, reason?}`
//! - POST   /admin/api/keys/batch-add   `{keys: [...]}`
//! - GET    /admin/api/proxied-models   upstream model list via the dispatcher
//! - GET    /admin/api/settings         current settings, tokens redacted
//! - POST   /admin/api/settings         deep-merge patch
//!
//! `GET|POST /admin/api/keys/test` streams probe results as Server-Sent Events
//! and checks the token itself: EventSource clients cannot set headers, so the
//! GET form takes it as a `token` query parameter.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use dispatcher::{Dispatcher, OutboundRequest, probe_key};
use futures_util::stream;
use key_pool::{KeyPool, Scheduler};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::auth::{self, require_admin_token};
use crate::error::{Error, Result};
use crate::proxy::{error_response, new_request_id, stream_response};
use crate::settings::SettingsStore;

/// Reason recorded when an operator disables a key without giving one.
const DEFAULT_DISABLE_REASON: &str = "Manually disabled by user";

/// Delay between probes in a batch key test.
const PROBE_PACING: Duration = Duration::from_millis(100);

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pub pool: Arc<KeyPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub settings: Arc<SettingsStore>,
    pub scheduler: Arc<Scheduler>,
    pub client: reqwest::Client,
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    let guarded = Router::new()
        .route(
            "/admin/api/keys",
            get(list_keys).post(add_key).delete(delete_key),
        )
        .route("/admin/api/keys/reactivate", post(reactivate_key))
        .route("/admin/api/keys/disable", post(disable_key))
        .route("/admin/api/keys/batch-add", post(batch_add_keys))
        .route("/admin/api/proxied-models", get(proxied_models))
        .route("/admin/api/settings", get(get_settings).post(update_settings))
        .route_layer(middleware::from_fn_with_state(
            state.settings.clone(),
            require_admin_token,
        ));

    Router::new()
        .route(
            "/admin/api/keys/test",
            get(test_keys_query).post(test_keys_json),
        )
        .merge(guarded)
        .with_state(state)
}

fn error_json(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "error": message.to_string() }).to_string(),
    )
        .into_response()
}

/// Persist after a mutation; a failure is reported to the caller.
async fn persist(pool: &KeyPool) -> Result<()> {
    pool.save_state().await.map_err(|e| {
        error!(error = %e, "failed to save key state");
        Error::State(e)
    })
}

#[derive(Deserialize)]
struct KeyRequest {
    value: String,
}

#[derive(Deserialize)]
struct DisableRequest {
    value: String,
    #[serde(default)]
    reason: Option<String>,
}

/// GET /admin/api/keys
async fn list_keys(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.pool.list().await)
}

/// POST /admin/api/keys: 201 with the new key, 409 if the value is already pooled.
async fn add_key(
    State(state): State<AdminState>,
    Json(body): Json<KeyRequest>,
) -> Result<Response> {
    let value = body.value.trim();
    if value.is_empty() {
        return Ok(error_json(
            StatusCode::BAD_REQUEST,
            "Key value cannot be empty",
        ));
    }
    let Some(key) = state.pool.add_if_absent(value.to_string()).await else {
        return Ok(error_json(StatusCode::CONFLICT, "Key already exists"));
    };
    persist(&state.pool).await?;
    info!(key = %key.masked(), "key added via admin API");
    Ok((StatusCode::CREATED, Json(key)).into_response())
}

/// DELETE /admin/api/keys: 204, or 404 if no key matched.
async fn delete_key(
    State(state): State<AdminState>,
    Json(body): Json<KeyRequest>,
) -> Result<Response> {
    if body.value.is_empty() {
        return Ok(error_json(StatusCode::BAD_REQUEST, "Key value is required"));
    }
    if !state.pool.delete(&body.value).await {
        return Ok(error_json(StatusCode::NOT_FOUND, "Key not found"));
    }
    persist(&state.pool).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// POST /admin/api/keys/reactivate
async fn reactivate_key(
    State(state): State<AdminState>,
    Json(body): Json<KeyRequest>,
) -> Result<Response> {
    if body.value.is_empty() {
        return Ok(error_json(StatusCode::BAD_REQUEST, "Key value is required"));
    }
    if !state.pool.reactivate(&body.value).await {
        return Ok(error_json(StatusCode::NOT_FOUND, "Key not found"));
    }
    persist(&state.pool).await?;
    Ok(Json(state.pool.find(&body.value).await).into_response())
}

/// POST /admin/api/keys/disable
async fn disable_key(
    State(state): State<AdminState>,
    Json(body): Json<DisableRequest>,
) -> Result<Response> {
    if body.value.is_empty() {
        return Ok(error_json(StatusCode::BAD_REQUEST, "Key value is required"));
    }
    let reason = body
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_DISABLE_REASON);

    if !state.pool.disable(&body.value, reason).await {
        return Ok(error_json(StatusCode::NOT_FOUND, "Key not found"));
    }
    metrics::counter!("balancer_key_disabled_total", "cause" => "manual").increment(1);
    persist(&state.pool).await?;
    Ok(Json(state.pool.find(&body.value).await).into_response())
}

#[derive(Deserialize)]
struct BatchAddRequest {
    keys: Vec<String>,
}

/// POST /admin/api/keys/batch-add: trims input, skips blanks and duplicates, saves once.
async fn batch_add_keys(
    State(state): State<AdminState>,
    Json(body): Json<BatchAddRequest>,
) -> Result<Response> {
    if body.keys.is_empty() {
        return Ok(error_json(StatusCode::BAD_REQUEST, "No keys provided"));
    }

    let mut added = 0usize;
    let mut skipped = 0usize;
    for raw in &body.keys {
        let value = raw.trim();
        if !value.is_empty() && state.pool.add_if_absent(value.to_string()).await.is_some() {
            added += 1;
        } else {
            skipped += 1;
        }
    }

    if added > 0 {
        persist(&state.pool).await?;
    }
    info!(added, skipped, "batch add completed");

    Ok(Json(serde_json::json!({
        "message": format!(
            "Successfully processed {} keys. Added: {added}, Skipped: {skipped}",
            body.keys.len()
        ),
        "added_count": added,
        "skipped_count": skipped,
    }))
    .into_response())
}

/// GET /admin/api/proxied-models: upstream `/v1/models` with key failover.
async fn proxied_models(State(state): State<AdminState>) -> Response {
    let request_id = new_request_id();
    let request = OutboundRequest {
        method: Method::GET,
        path_and_query: "/v1/models".to_string(),
        headers: HeaderMap::new(),
        body: Bytes::new(),
    };
    match state.dispatcher.dispatch(&request).await {
        Ok(dispatched) => stream_response(dispatched, &request_id),
        Err(e) => {
            warn!(error = %e, "proxied models request failed");
            error_response(e.status_code(), &e.to_string(), &request_id)
        }
    }
}

/// GET /admin/api/settings
async fn get_settings(State(state): State<AdminState>) -> Result<Response> {
    Ok(Json(state.settings.redacted().await?).into_response())
}

/// POST /admin/api/settings: restarts the scheduler when `auto_reactivation` is patched.
async fn update_settings(
    State(state): State<AdminState>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Response> {
    let updated = state.settings.update(&patch).await?;

    if patch.get("auto_reactivation").is_some() {
        info!("auto reactivation settings changed, restarting scheduler");
        // Already validated by the store
        if let Err(e) = state.scheduler.start(&updated.auto_reactivation) {
            warn!(error = %e, "scheduler restart failed");
        }
    }

    Ok(Json(serde_json::json!({ "message": "Settings updated successfully." })).into_response())
}

#[derive(Debug, Deserialize)]
struct TestKeysQuery {
    source: Option<String>,
    model: Option<String>,
    keys: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TestKeysRequest {
    source: String,
    model: String,
    #[serde(default)]
    keys: Vec<String>,
}

/// GET /admin/api/keys/test: EventSource form, token in the query string.
async fn test_keys_query(
    State(state): State<AdminState>,
    Query(query): Query<TestKeysQuery>,
) -> Response {
    let expected = state.settings.admin_token().await;
    if let Err(failure) = auth::check_token(query.token.as_deref().unwrap_or_default(), &expected) {
        warn!(?failure, "rejected key test request");
        return failure.into_response();
    }

    let request = TestKeysRequest {
        source: query.source.unwrap_or_default(),
        model: query.model.unwrap_or_default(),
        keys: query
            .keys
            .map(|k| k.split(',').map(|s| s.to_string()).collect())
            .unwrap_or_default(),
    };
    start_key_test(state, request).await
}

/// POST /admin/api/keys/test: JSON body, Bearer header.
async fn test_keys_json(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(request): Json<TestKeysRequest>,
) -> Response {
    let expected = state.settings.admin_token().await;
    if let Err(failure) = auth::check_bearer(&headers, &expected) {
        warn!(?failure, "rejected key test request");
        return failure.into_response();
    }
    start_key_test(state, request).await
}

/// Validate a key test request and stream one event per probed key.
///
/// `system` probes pool keys and updates their state: failures are disabled,
/// disabled keys that pass are reactivated, and the state file is saved once
/// at the end if anything changed. `custom` probes the supplied keys only.
async fn start_key_test(state: AdminState, request: TestKeysRequest) -> Response {
    let model = request.model.trim().to_string();
    if model.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "Model ID is required");
    }

    let manage_pool = match request.source.as_str() {
        "system" => true,
        "custom" => false,
        _ => {
            return error_json(
                StatusCode::BAD_REQUEST,
                "Source must be 'system' or 'custom'",
            );
        }
    };

    let keys: Vec<String> = if manage_pool {
        state.pool.list().await.into_iter().map(|k| k.value).collect()
    } else {
        request
            .keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_owned)
            .collect()
    };
    if keys.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "No keys to test");
    }

    info!(model = %model, source = %request.source, keys = keys.len(), "starting key health test");

    let (tx, mut rx) = mpsc::channel::<Event>(16);
    tokio::spawn(run_key_test(state, keys, model, manage_pool, tx));

    let events = stream::poll_fn(move |cx| rx.poll_recv(cx).map(|ev| ev.map(Ok::<_, Infallible>)));
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

async fn run_key_test(
    state: AdminState,
    keys: Vec<String>,
    model: String,
    manage_pool: bool,
    tx: mpsc::Sender<Event>,
) {
    let upstream_url = state.dispatcher.upstream_url().to_string();
    let timeout = state.settings.snapshot().await.proxy.probe_timeout();
    let total = keys.len();
    let mut changed = false;

    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(PROBE_PACING).await;
        }

        let result = probe_key(&state.client, &upstream_url, key, &model, timeout).await;

        if manage_pool {
            if !result.is_success() {
                if state.pool.disable(key, &result.error).await {
                    metrics::counter!("balancer_key_disabled_total", "cause" => "probe")
                        .increment(1);
                    changed = true;
                }
            } else if state.pool.is_disabled(key).await && state.pool.reactivate(key).await {
                info!(key = %result.key, "probe passed, key reactivated");
                changed = true;
            }
        }

        let data = match serde_json::to_string(&result) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to encode probe result");
                continue;
            }
        };
        if tx.send(Event::default().data(data)).await.is_err() {
            info!(tested = i + 1, total, "key test client went away, stopping");
            break;
        }
    }

    if changed {
        if let Err(e) = state.pool.save_state().await {
            error!(error = %e, "failed to save state after key test");
        }
    }

    let complete = serde_json::json!({
        "type": "complete",
        "message": "All keys tested",
        "total": total,
    });
    let _ = tx.send(Event::default().data(complete.to_string())).await;
    info!(total, "key health test completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use common::Secret;
    use tower::ServiceExt;

    struct Harness {
        _dir: tempfile::TempDir,
        state: AdminState,
    }

    impl Harness {
        fn app(&self) -> Router {
            build_admin_router(self.state.clone())
        }
    }

    fn harness(keys: &[&str], upstream_url: &str, admin_token: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(KeyPool::new(
            keys.iter().map(|k| k.to_string()).collect(),
            dir.path().join("state.json"),
        ));
        let client = reqwest::Client::new();
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            client.clone(),
            upstream_url,
            Duration::from_secs(5),
        ));
        let config = Config {
            admin_token: Secret::new(admin_token.to_string()),
            ..Config::default()
        };
        let settings = Arc::new(SettingsStore::new(
            config,
            dir.path().join("key-balancer.toml"),
        ));
        let scheduler = Arc::new(Scheduler::new(pool.clone()));
        Harness {
            _dir: dir,
            state: AdminState {
                pool,
                dispatcher,
                settings,
                scheduler,
                client,
            },
        }
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Upstream where keys starting with `good` pass the probe.
    async fn probe_upstream() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(
                "/v1/chat/completions",
                post(|headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    if auth.starts_with("Bearer good") {
                        (StatusCode::OK, "{}".to_string())
                    } else {
                        (StatusCode::UNAUTHORIZED, "bad key".to_string())
                    }
                }),
            )
            .route(
                "/v1/models",
                get(|| async { Json(serde_json::json!({"data": [{"id": "Qwen/Qwen3-8B"}]})) }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Parse the `data:` payloads of an SSE body.
    async fn sse_events(response: Response) -> Vec<serde_json::Value> {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(body.to_vec())
            .unwrap()
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn list_keys_returns_pool_snapshot() {
        let h = harness(&["k1", "k2"], "http://unused", "");
        h.state.pool.disable("k2", "HTTP 401: nope").await;

        let response = h
            .app()
            .oneshot(
                Request::builder()
                    .uri("/admin/api/keys")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let keys = json.as_array().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0]["status"], "active");
        assert_eq!(keys[0]["source"], "config");
        assert_eq!(keys[1]["status"], "disabled");
        assert_eq!(keys[1]["last_failure_reason"], "HTTP 401: nope");
    }

    #[tokio::test]
    async fn admin_routes_require_token() {
        let h = harness(&["k1"], "http://unused", "admin-secret");

        let denied = h
            .app()
            .oneshot(
                Request::builder()
                    .uri("/admin/api/keys")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = h
            .app()
            .oneshot(
                Request::builder()
                    .uri("/admin/api/keys")
                    .header("authorization", "Bearer admin-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn add_key_persists_and_returns_201() {
        let h = harness(&[], "http://unused", "");

        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/admin/api/keys",
                serde_json::json!({"value": "  ms-new-key  "}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["value"], "ms-new-key");
        assert_eq!(json["source"], "user");

        let saved = std::fs::read_to_string(h.state.pool.state_path()).unwrap();
        assert!(saved.contains("ms-new-key"));
    }

    #[tokio::test]
    async fn add_key_rejects_blank_and_duplicate() {
        let h = harness(&["k1"], "http://unused", "");

        let blank = h
            .app()
            .oneshot(json_request(
                "POST",
                "/admin/api/keys",
                serde_json::json!({"value": "   "}),
            ))
            .await
            .unwrap();
        assert_eq!(blank.status(), StatusCode::BAD_REQUEST);

        let dup = h
            .app()
            .oneshot(json_request(
                "POST",
                "/admin/api/keys",
                serde_json::json!({"value": "k1"}),
            ))
            .await
            .unwrap();
        assert_eq!(dup.status(), StatusCode::CONFLICT);
        assert_eq!(h.state.pool.len().await, 1);
    }

    #[tokio::test]
    async fn add_key_reports_save_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(&[], "http://unused", "");
        // State file inside a directory that does not exist
        h.state.pool = Arc::new(KeyPool::new(
            vec![],
            dir.path().join("missing").join("state.json"),
        ));

        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/admin/api/keys",
                serde_json::json!({"value": "ms-x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(
            json["error"]
                .as_str()
                .unwrap()
                .starts_with("failed to save state")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_of_same_value_yield_one_201() {
        let h = harness(&[], "http://unused", "");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let app = h.app();
            handles.push(tokio::spawn(async move {
                app.oneshot(json_request(
                    "POST",
                    "/admin/api/keys",
                    serde_json::json!({"value": "ms-contended"}),
                ))
                .await
                .unwrap()
                .status()
            }));
        }

        let mut created = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                StatusCode::CREATED => created += 1,
                StatusCode::CONFLICT => conflicts += 1,
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(h.state.pool.len().await, 1);
    }

    #[tokio::test]
    async fn delete_key_204_then_404() {
        let h = harness(&["k1"], "http://unused", "");

        let first = h
            .app()
            .oneshot(json_request(
                "DELETE",
                "/admin/api/keys",
                serde_json::json!({"value": "k1"}),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::NO_CONTENT);
        assert!(h.state.pool.is_empty().await);

        let second = h
            .app()
            .oneshot(json_request(
                "DELETE",
                "/admin/api/keys",
                serde_json::json!({"value": "k1"}),
            ))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disable_uses_default_reason_and_reactivate_clears_it() {
        let h = harness(&["k1"], "http://unused", "");

        let disabled = h
            .app()
            .oneshot(json_request(
                "POST",
                "/admin/api/keys/disable",
                serde_json::json!({"value": "k1"}),
            ))
            .await
            .unwrap();
        assert_eq!(disabled.status(), StatusCode::OK);
        let json = body_json(disabled).await;
        assert_eq!(json["status"], "disabled");
        assert_eq!(json["last_failure_reason"], DEFAULT_DISABLE_REASON);

        let reactivated = h
            .app()
            .oneshot(json_request(
                "POST",
                "/admin/api/keys/reactivate",
                serde_json::json!({"value": "k1"}),
            ))
            .await
            .unwrap();
        assert_eq!(reactivated.status(), StatusCode::OK);
        let json = body_json(reactivated).await;
        assert_eq!(json["status"], "active");
        assert_eq!(json["last_failure_reason"], "");
    }

    #[tokio::test]
    async fn disable_and_reactivate_unknown_key_404() {
        let h = harness(&["k1"], "http://unused", "");
        for uri in ["/admin/api/keys/disable", "/admin/api/keys/reactivate"] {
            let response = h
                .app()
                .oneshot(json_request(
                    "POST",
                    uri,
                    serde_json::json!({"value": "ghost"}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn batch_add_trims_and_skips_duplicates() {
        let h = harness(&["k1"], "http://unused", "");

        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/admin/api/keys/batch-add",
                serde_json::json!({"keys": [" k2 ", "", "k1", "k3", "k2"]}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["added_count"], 2);
        assert_eq!(json["skipped_count"], 3);

        let values: Vec<String> = h
            .state
            .pool
            .list()
            .await
            .into_iter()
            .map(|k| k.value)
            .collect();
        assert_eq!(values, vec!["k1", "k2", "k3"]);

        let saved = std::fs::read_to_string(h.state.pool.state_path()).unwrap();
        assert!(saved.contains("k2") && saved.contains("k3"));
    }

    #[tokio::test]
    async fn batch_add_rejects_empty_list() {
        let h = harness(&[], "http://unused", "");
        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/admin/api/keys/batch-add",
                serde_json::json!({"keys": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn settings_get_redacts_and_post_restarts_scheduler() {
        let h = harness(&["k1"], "http://unused", "admin-secret");

        let response = h
            .app()
            .oneshot(
                Request::builder()
                    .uri("/admin/api/settings")
                    .header("authorization", "Bearer admin-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["admin_token"], common::REDACTED);
        assert_eq!(json["auto_reactivation"]["mode"], "interval");

        assert!(!h.state.scheduler.is_running());
        let mut update = json_request(
            "POST",
            "/admin/api/settings",
            serde_json::json!({"auto_reactivation": {"interval": "5m"}}),
        );
        update.headers_mut().insert(
            "authorization",
            "Bearer admin-secret".parse().unwrap(),
        );
        let response = h.app().oneshot(update).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.state.scheduler.is_running());
        assert_eq!(
            h.state.settings.snapshot().await.auto_reactivation.interval,
            "5m"
        );
        h.state.scheduler.stop();
    }

    #[tokio::test]
    async fn settings_post_rejects_invalid_policy() {
        let h = harness(&["k1"], "http://unused", "");
        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/admin/api/settings",
                serde_json::json!({"auto_reactivation": {"mode": "scheduled", "timezone": "Nowhere/Land"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!h.state.scheduler.is_running());
    }

    #[tokio::test]
    async fn proxied_models_forwards_upstream_body() {
        let url = probe_upstream().await;
        let h = harness(&["good-1"], &url, "");

        let response = h
            .app()
            .oneshot(
                Request::builder()
                    .uri("/admin/api/proxied-models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"][0]["id"], "Qwen/Qwen3-8B");
    }

    #[tokio::test]
    async fn proxied_models_without_keys_is_503() {
        let h = harness(&[], "http://unused", "");
        let response = h
            .app()
            .oneshot(
                Request::builder()
                    .uri("/admin/api/proxied-models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn system_key_test_streams_results_and_updates_pool() {
        let url = probe_upstream().await;
        let h = harness(&["good-key-0001", "bad-key-00002"], &url, "");
        h.state.pool.disable("good-key-0001", "stale failure").await;

        let response = h
            .app()
            .oneshot(json_request(
                "POST",
                "/admin/api/keys/test",
                serde_json::json!({"source": "system", "model": "Qwen/Qwen3-8B"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let events = sse_events(response).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["status"], "success");
        assert_eq!(events[1]["status"], "failed");
        assert_eq!(events[1]["error"], "HTTP 401: bad key");
        assert_eq!(events[2]["type"], "complete");
        assert_eq!(events[2]["total"], 2);

        assert!(!h.state.pool.is_disabled("good-key-0001").await);
        assert!(h.state.pool.is_disabled("bad-key-00002").await);
        assert!(h.state.pool.state_path().exists());
    }

    #[tokio::test]
    async fn custom_key_test_leaves_pool_alone() {
        let url = probe_upstream().await;
        let h = harness(&["bad-pool-key"], &url, "admin-secret");

        let response = h
            .app()
            .oneshot(
                Request::builder()
                    .uri("/admin/api/keys/test?source=custom&model=m&keys=good-a,%20bad-b&token=admin-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let events = sse_events(response).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["status"], "success");
        assert_eq!(events[1]["status"], "failed");
        assert!(!h.state.pool.is_disabled("bad-pool-key").await);
        assert!(!h.state.pool.state_path().exists());
    }

    #[tokio::test]
    async fn key_test_checks_query_token() {
        let h = harness(&["k1"], "http://unused", "admin-secret");
        let response = h
            .app()
            .oneshot(
                Request::builder()
                    .uri("/admin/api/keys/test?source=system&model=m&token=wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn key_test_validates_request() {
        let h = harness(&["k1"], "http://unused", "");
        let cases = [
            serde_json::json!({"source": "system", "model": ""}),
            serde_json::json!({"source": "elsewhere", "model": "m"}),
            serde_json::json!({"source": "custom", "model": "m", "keys": [" "]}),
        ];
        for body in cases {
            let response = h
                .app()
                .oneshot(json_request("POST", "/admin/api/keys/test", body.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        }
    }
}

//! Live settings store
//!
//! Owns the current [`Config`] and the file it came from. Handlers read tokens
//! through the store on every request, so an update takes effect without a
//! restart. Listener and upstream changes are persisted but apply on the next
//! start.

use std::path::PathBuf;

use common::{REDACTED, Secret};
use key_pool::ReactivationPolicy;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::Config;
use crate::error::Error;

/// Top-level settings that hold credentials and are redacted on read.
const TOKEN_FIELDS: &[&str] = &["admin_token", "api_token"];

pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Config>,
}

impl SettingsStore {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            path,
            current: RwLock::new(config),
        }
    }

    pub async fn snapshot(&self) -> Config {
        self.current.read().await.clone()
    }

    pub async fn admin_token(&self) -> Secret<String> {
        self.current.read().await.admin_token.clone()
    }

    pub async fn api_token(&self) -> Secret<String> {
        self.current.read().await.api_token.clone()
    }

    /// Current settings as JSON with tokens and startup keys redacted.
    pub async fn redacted(&self) -> Result<Value, Error> {
        let config = self.snapshot().await;
        let mut value = serde_json::to_value(&config)
            .map_err(|e| Error::InvalidSettings(format!("encoding settings: {e}")))?;

        if let Some(object) = value.as_object_mut() {
            for field in TOKEN_FIELDS {
                if let Some(token) = object.get_mut(*field) {
                    if token.as_str().is_some_and(|t| !t.is_empty()) {
                        *token = Value::String(REDACTED.to_string());
                    }
                }
            }
            let masked: Vec<Value> = config
                .api_keys
                .iter()
                .map(|k| Value::String(key_pool::key::mask(k)))
                .collect();
            object.insert("api_keys".to_string(), Value::Array(masked));
        }
        Ok(value)
    }

    /// Merge `patch` into the current settings, validate, persist, then swap.
    ///
    /// Tokens patched with the redaction placeholder keep their current value.
    /// Startup keys are managed through the key endpoints and cannot be patched.
    pub async fn update(&self, patch: &Value) -> Result<Config, Error> {
        let Some(patch_object) = patch.as_object() else {
            return Err(Error::InvalidSettings(
                "settings patch must be a JSON object".into(),
            ));
        };
        if patch_object.contains_key("api_keys") {
            return Err(Error::InvalidSettings(
                "api_keys cannot be changed through settings; use the key endpoints".into(),
            ));
        }

        let mut current = self.current.write().await;
        let mut merged = serde_json::to_value(&*current)
            .map_err(|e| Error::InvalidSettings(format!("encoding settings: {e}")))?;

        let mut patch = patch.clone();
        if let Some(object) = patch.as_object_mut() {
            object.retain(|field, value| {
                !(TOKEN_FIELDS.contains(&field.as_str()) && value.as_str() == Some(REDACTED))
            });
        }
        merge(&mut merged, patch);

        let updated: Config = serde_json::from_value(merged)
            .map_err(|e| Error::InvalidSettings(e.to_string()))?;
        updated.validate()?;
        ReactivationPolicy::from_settings(&updated.auto_reactivation)?;

        updated.save(&self.path).await?;
        *current = updated.clone();

        info!(
            path = %self.path.display(),
            fields = patch_object.len(),
            "settings updated"
        );
        Ok(updated)
    }
}

/// Deep-merge `patch` into `target`. Objects merge key by key; anything else replaces.
fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir) -> SettingsStore {
        let config = Config {
            api_keys: vec!["ms-startup-key-0001".into()],
            admin_token: Secret::new("admin-secret".into()),
            ..Config::default()
        };
        SettingsStore::new(config, dir.path().join("key-balancer.toml"))
    }

    #[test]
    fn merge_is_deep_for_objects() {
        let mut target = json!({"a": {"x": 1, "y": 2}, "b": 1});
        merge(&mut target, json!({"a": {"y": 3}, "c": [1]}));
        assert_eq!(target, json!({"a": {"x": 1, "y": 3}, "b": 1, "c": [1]}));
    }

    #[tokio::test]
    async fn redacted_hides_tokens_and_masks_keys() {
        let dir = tempfile::tempdir().unwrap();
        let value = store(&dir).redacted().await.unwrap();

        assert_eq!(value["admin_token"], REDACTED);
        // Unset tokens stay empty so clients can tell them apart
        assert_eq!(value["api_token"], "");
        assert_eq!(value["api_keys"], json!(["ms-s…0001"]));
        assert_eq!(value["auto_reactivation"]["interval"], "10m");
    }

    #[tokio::test]
    async fn update_merges_persists_and_swaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let updated = store
            .update(&json!({
                "api_token": "new-api-token",
                "auto_reactivation": {"interval": "30m"}
            }))
            .await
            .unwrap();

        assert_eq!(updated.api_token.expose(), "new-api-token");
        assert_eq!(updated.auto_reactivation.interval, "30m");
        assert_eq!(updated.auto_reactivation.mode, "interval");
        assert_eq!(store.api_token().await.expose(), "new-api-token");

        let written = std::fs::read_to_string(dir.path().join("key-balancer.toml")).unwrap();
        let on_disk: Config = toml::from_str(&written).unwrap();
        assert_eq!(on_disk, updated);
    }

    #[tokio::test]
    async fn redacted_placeholder_keeps_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        store
            .update(&json!({"admin_token": REDACTED, "api_token": "x"}))
            .await
            .unwrap();
        assert_eq!(store.admin_token().await.expose(), "admin-secret");
        assert_eq!(store.api_token().await.expose(), "x");
    }

    #[tokio::test]
    async fn invalid_reactivation_policy_rejected_without_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let err = store
            .update(&json!({"auto_reactivation": {"mode": "scheduled", "cron_spec": "nope"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Policy(_)), "got: {err}");
        assert_eq!(store.snapshot().await.auto_reactivation.mode, "interval");
        assert!(!dir.path().join("key-balancer.toml").exists());
    }

    #[tokio::test]
    async fn invalid_proxy_settings_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let err = store
            .update(&json!({"proxy": {"timeout_secs": 0}}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout_secs"), "got: {err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_all_persist_and_file_matches_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store(&dir));

        let mut handles = Vec::new();
        for i in 1..=16u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let token = store.admin_token().await;
                assert_eq!(token.expose(), "admin-secret");
                store
                    .update(&json!({"proxy": {"timeout_secs": i}}))
                    .await
                    .map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let written = std::fs::read_to_string(dir.path().join("key-balancer.toml")).unwrap();
        let on_disk: Config = toml::from_str(&written).unwrap();
        assert_eq!(on_disk, store.snapshot().await);
    }

    #[tokio::test]
    async fn wrong_types_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        assert!(store.update(&json!({"proxy": {"timeout_secs": "soon"}})).await.is_err());
        assert!(store.update(&json!(["not", "an", "object"])).await.is_err());
        assert!(store.update(&json!({"api_keys": ["x"]})).await.is_err());
    }
}

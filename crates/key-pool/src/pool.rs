//! Key pool and round-robin selection
//!
//! The pool is an ordered `Vec<Key>` behind one `RwLock`. Selection, listing and
//! lookups take the read lock; add/delete/disable/reactivate take the write lock.
//! The round-robin cursor is an `AtomicUsize` outside the lock so concurrent
//! selections never serialize on it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::key::{Key, KeySource, KeyStatus};
use crate::state;

/// Key counts for the health endpoint and gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub total: usize,
    pub active: usize,
    pub disabled: usize,
}

impl PoolSummary {
    /// Overall label: all active → healthy, some → degraded, none → unhealthy.
    pub fn status(&self) -> &'static str {
        if self.total > 0 && self.active == self.total {
            "healthy"
        } else if self.active > 0 {
            "degraded"
        } else {
            "unhealthy"
        }
    }
}

/// Pool of upstream API keys.
///
/// Config-provided keys live only in memory; user-added keys are written to
/// `state_path` when the caller invokes `save_state`.
pub struct KeyPool {
    keys: RwLock<Vec<Key>>,
    next_index: AtomicUsize,
    state_path: PathBuf,
    /// Serializes state file writes; held from snapshot through rename.
    save_lock: Mutex<()>,
}

impl KeyPool {
    /// Create a pool from configured key values. All keys start Active.
    pub fn new(config_keys: Vec<String>, state_path: PathBuf) -> Self {
        let keys: Vec<Key> = config_keys
            .into_iter()
            .map(|value| Key::new(value, KeySource::Config))
            .collect();
        info!(keys = keys.len(), "key pool initialized");
        Self {
            keys: RwLock::new(keys),
            next_index: AtomicUsize::new(0),
            state_path,
            save_lock: Mutex::new(()),
        }
    }

    /// Select the next active key round-robin.
    ///
    /// Each probe advances the shared cursor and maps it onto the pool. Probing
    /// stops after twice the pool size so a fully disabled pool returns
    /// `NoActiveKey` instead of spinning.
    pub async fn select_next(&self) -> Result<Key> {
        let keys = self.keys.read().await;
        let n = keys.len();
        if n == 0 {
            return Err(Error::Empty);
        }

        for _ in 0..n * 2 {
            let idx = self.next_index.fetch_add(1, Ordering::Relaxed) % n;
            let key = &keys[idx];
            if key.is_active() {
                return Ok(key.clone());
            }
        }

        debug!(keys = n, "no active key after full probe");
        Err(Error::NoActiveKey)
    }

    /// Disable the first key with this value, recording why.
    ///
    /// Returns whether a key matched. A missing key (e.g. deleted concurrently)
    /// is a no-op.
    pub async fn disable(&self, value: &str, reason: &str) -> bool {
        let mut keys = self.keys.write().await;
        match keys.iter_mut().find(|k| k.value == value) {
            Some(key) => {
                key.disable(reason, Utc::now());
                warn!(key = %key.masked(), reason, "key disabled");
                true
            }
            None => false,
        }
    }

    /// Return a key to rotation and clear its failure reason. No-op if missing.
    pub async fn reactivate(&self, value: &str) -> bool {
        let mut keys = self.keys.write().await;
        match keys.iter_mut().find(|k| k.value == value) {
            Some(key) => {
                key.reactivate();
                info!(key = %key.masked(), "key reactivated");
                true
            }
            None => false,
        }
    }

    /// Whether the key is disabled. Unknown keys report `false`.
    pub async fn is_disabled(&self, value: &str) -> bool {
        let keys = self.keys.read().await;
        keys.iter()
            .find(|k| k.value == value)
            .is_some_and(|k| k.status == KeyStatus::Disabled)
    }

    /// Snapshot of the first key with this value.
    pub async fn find(&self, value: &str) -> Option<Key> {
        let keys = self.keys.read().await;
        keys.iter().find(|k| k.value == value).cloned()
    }

    /// Append a user-added key. Duplicates are not rejected here.
    pub async fn add(&self, value: String) -> Key {
        let key = Key::new(value, KeySource::User);
        let mut keys = self.keys.write().await;
        keys.push(key.clone());
        info!(key = %key.masked(), total = keys.len(), "key added to pool");
        key
    }

    /// Append a user-added key unless one with this value already exists.
    ///
    /// The check and the insert happen under one write lock. `None` if the
    /// value was already pooled.
    pub async fn add_if_absent(&self, value: String) -> Option<Key> {
        let mut keys = self.keys.write().await;
        if keys.iter().any(|k| k.value == value) {
            debug!("add skipped, key already pooled");
            return None;
        }
        let key = Key::new(value, KeySource::User);
        keys.push(key.clone());
        info!(key = %key.masked(), total = keys.len(), "key added to pool");
        Some(key)
    }

    /// Remove the first key with this value. Returns whether one was removed.
    pub async fn delete(&self, value: &str) -> bool {
        let mut keys = self.keys.write().await;
        match keys.iter().position(|k| k.value == value) {
            Some(idx) => {
                let removed = keys.remove(idx);
                info!(key = %removed.masked(), total = keys.len(), "key removed from pool");
                true
            }
            None => {
                debug!("delete requested for unknown key");
                false
            }
        }
    }

    /// Snapshot of every key in pool order.
    pub async fn list(&self) -> Vec<Key> {
        self.keys.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn summary(&self) -> PoolSummary {
        let keys = self.keys.read().await;
        let active = keys.iter().filter(|k| k.is_active()).count();
        PoolSummary {
            total: keys.len(),
            active,
            disabled: keys.len() - active,
        }
    }

    /// Reactivate every key that has been disabled for longer than `threshold`.
    pub async fn reactivate_older_than(&self, threshold: Duration) -> usize {
        self.reactivate_older_than_at(threshold, Utc::now()).await
    }

    /// Threshold sweep against an explicit clock.
    ///
    /// The comparison is strict: a key disabled exactly `threshold` before `now`
    /// stays disabled. A disabled key with no timestamp counts as infinitely old.
    pub async fn reactivate_older_than_at(&self, threshold: Duration, now: DateTime<Utc>) -> usize {
        let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
        let mut keys = self.keys.write().await;
        let mut reactivated = 0usize;

        for key in keys.iter_mut() {
            if key.status != KeyStatus::Disabled {
                continue;
            }
            let expired = match key.disabled_at {
                Some(at) => now.signed_duration_since(at) > threshold,
                None => true,
            };
            if expired {
                key.reactivate();
                reactivated += 1;
                info!(
                    key = %key.masked(),
                    disabled_at = ?key.disabled_at,
                    "disabled key past threshold, reactivated"
                );
            }
        }

        if reactivated > 0 {
            info!(
                reactivated,
                threshold_secs = threshold.num_seconds(),
                "threshold reactivation sweep completed"
            );
        }
        reactivated
    }

    /// Reactivate every disabled key regardless of how long it was disabled.
    pub async fn reactivate_all(&self) -> usize {
        let mut keys = self.keys.write().await;
        let mut reactivated = 0usize;
        for key in keys.iter_mut().filter(|k| k.status == KeyStatus::Disabled) {
            key.reactivate();
            reactivated += 1;
            debug!(key = %key.masked(), "key reactivated by sweep");
        }
        info!(reactivated, "unconditional reactivation sweep completed");
        reactivated
    }

    /// Write the user-added keys to the state file (full replace).
    ///
    /// Saves run one at a time in snapshot order, so the file always ends up
    /// holding the most recent snapshot. The pool read lock is held only while
    /// copying the subset.
    pub async fn save_state(&self) -> Result<()> {
        let _saving = self.save_lock.lock().await;
        let user_keys: Vec<Key> = {
            let keys = self.keys.read().await;
            keys.iter()
                .filter(|k| k.source == KeySource::User)
                .cloned()
                .collect()
        };
        state::write_atomic(&self.state_path, &user_keys).await?;
        info!(
            path = %self.state_path.display(),
            user_keys = user_keys.len(),
            "key state saved"
        );
        Ok(())
    }

    /// Append previously saved user-added keys onto the configured keys.
    ///
    /// A missing state file is the first run and not an error. Returns the
    /// number of keys loaded.
    pub async fn load_state(&self) -> Result<usize> {
        let Some(loaded) = state::read(&self.state_path).await? else {
            info!(path = %self.state_path.display(), "state file not found, starting with configured keys");
            return Ok(0);
        };
        let count = loaded.len();
        let mut keys = self.keys.write().await;
        keys.extend(loaded);
        info!(
            path = %self.state_path.display(),
            user_keys = count,
            total = keys.len(),
            "key state loaded"
        );
        Ok(count)
    }

    /// Location of the state file. Used by tests and diagnostics.
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }
}

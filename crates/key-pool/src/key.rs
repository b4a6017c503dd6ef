//! Key record and its health state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of a key. A key is either in rotation or set aside.
///
/// Transitions:
/// - Active → Disabled (transport or HTTP failure, manual disable)
/// - Disabled → Active (threshold sweep, unconditional sweep, manual reactivation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Disabled,
}

/// Where a key came from. Only `User` keys are written to the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    Config,
    User,
}

/// One upstream credential and its health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub value: String,
    pub status: KeyStatus,
    /// Set when the key is disabled; kept after reactivation for diagnostics.
    #[serde(default)]
    pub disabled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_reason: String,
    pub source: KeySource,
}

impl Key {
    pub fn new(value: String, source: KeySource) -> Self {
        Self {
            value,
            status: KeyStatus::Active,
            disabled_at: None,
            last_failure_reason: String::new(),
            source,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }

    /// Short redacted form for log lines: first four and last four characters.
    ///
    /// Values of eight characters or fewer are fully hidden.
    pub fn masked(&self) -> String {
        mask(&self.value)
    }

    pub(crate) fn disable(&mut self, reason: &str, at: DateTime<Utc>) {
        self.status = KeyStatus::Disabled;
        self.disabled_at = Some(at);
        self.last_failure_reason = reason.to_string();
    }

    pub(crate) fn reactivate(&mut self) {
        self.status = KeyStatus::Active;
        self.last_failure_reason.clear();
    }
}

/// Redact a credential string for logging.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key pool is empty")]
    Empty,

    #[error("no active key available")]
    NoActiveKey,

    #[error("state file I/O error: {0}")]
    Io(String),

    #[error("state file parse error: {0}")]
    StateParse(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Rejected reactivation policy settings.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid interval {value:?}: {reason}")]
    InvalidInterval { value: String, reason: String },

    #[error("invalid cron expression {value:?}: {reason}")]
    InvalidCron { value: String, reason: String },

    #[error("invalid timezone {0:?}")]
    InvalidTimezone(String),

    #[error("unknown reactivation mode {0:?} (expected \"interval\" or \"scheduled\")")]
    UnknownMode(String),
}

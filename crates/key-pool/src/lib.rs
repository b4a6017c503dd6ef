//! Credential pool for an upstream inference API
//!
//! Tracks a list of API keys and their health so requests can be spread across
//! them and a rejected key can be set aside without interrupting service.
//!
//! Key lifecycle:
//! 1. Keys come from configuration at startup (`config`) or the admin API (`user`)
//! 2. Pool selects keys round-robin, skipping disabled ones
//! 3. Upstream rejects a key (transport error or non-2xx) → `Disabled` with a reason
//! 4. Reactivation sweep (interval threshold or cron schedule) → `Active` again
//! 5. User-added keys are written to the state file by the caller after mutations

pub mod error;
pub mod key;
pub mod pool;
pub mod reactivation;
mod state;

pub use error::{Error, PolicyError, Result};
pub use key::{Key, KeySource, KeyStatus};
pub use pool::{KeyPool, PoolSummary};
pub use reactivation::{ReactivationPolicy, ReactivationSettings, Scheduler};

//! Automatic reactivation of disabled keys
//!
//! Two policies drive the pool's sweep operations from a background task:
//! - `interval`: every `interval`, reactivate keys disabled for longer than `interval`
//! - `scheduled`: at each cron fire time in the configured timezone, reactivate all keys
//!
//! Restarting the scheduler aborts the running task and spawns a new one. The
//! pool is the only state that survives a restart.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PolicyError;
use crate::pool::KeyPool;

/// Reactivation settings as they appear in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactivationSettings {
    pub enabled: bool,
    /// `"interval"` or `"scheduled"`
    pub mode: String,
    /// Human duration, e.g. `"10m"` or `"1h 30m"`
    pub interval: String,
    /// Cron expression with a seconds field, e.g. `"0 */10 * * * *"`
    pub cron_spec: String,
    /// IANA timezone name, or `"Local"` for the host timezone
    pub timezone: String,
}

impl Default for ReactivationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: "interval".to_string(),
            interval: "10m".to_string(),
            cron_spec: "0 */10 * * * *".to_string(),
            timezone: "Local".to_string(),
        }
    }
}

/// Timezone a cron schedule is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Local,
    Named(Tz),
}

impl Zone {
    fn parse(name: &str) -> Result<Self, PolicyError> {
        match name.trim() {
            "" | "Local" | "local" => Ok(Zone::Local),
            other => Tz::from_str(other)
                .map(Zone::Named)
                .map_err(|_| PolicyError::InvalidTimezone(name.to_string())),
        }
    }

    /// First fire time strictly after `after`.
    fn next_fire(&self, schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Zone::Local => schedule
                .after(&after.with_timezone(&Local))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            Zone::Named(tz) => schedule
                .after(&after.with_timezone(tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// A validated reactivation policy.
#[derive(Debug, Clone)]
pub enum ReactivationPolicy {
    Interval(Duration),
    Scheduled { schedule: Schedule, zone: Zone },
}

impl ReactivationPolicy {
    /// Validate settings. `Ok(None)` when auto reactivation is disabled.
    pub fn from_settings(settings: &ReactivationSettings) -> Result<Option<Self>, PolicyError> {
        if !settings.enabled {
            return Ok(None);
        }

        let mode = settings.mode.trim();
        if mode.eq_ignore_ascii_case("interval") {
            let interval = humantime::parse_duration(settings.interval.trim()).map_err(|e| {
                PolicyError::InvalidInterval {
                    value: settings.interval.clone(),
                    reason: e.to_string(),
                }
            })?;
            if interval.is_zero() {
                return Err(PolicyError::InvalidInterval {
                    value: settings.interval.clone(),
                    reason: "interval must be greater than zero".into(),
                });
            }
            Ok(Some(ReactivationPolicy::Interval(interval)))
        } else if mode.eq_ignore_ascii_case("scheduled") {
            let schedule = Schedule::from_str(settings.cron_spec.trim()).map_err(|e| {
                PolicyError::InvalidCron {
                    value: settings.cron_spec.clone(),
                    reason: e.to_string(),
                }
            })?;
            let zone = Zone::parse(&settings.timezone)?;
            Ok(Some(ReactivationPolicy::Scheduled { schedule, zone }))
        } else {
            Err(PolicyError::UnknownMode(settings.mode.clone()))
        }
    }

    /// Policy label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ReactivationPolicy::Interval(_) => "interval",
            ReactivationPolicy::Scheduled { .. } => "scheduled",
        }
    }
}

/// Owns the background reactivation task for a pool.
pub struct Scheduler {
    pool: Arc<KeyPool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(pool: Arc<KeyPool>) -> Self {
        Self {
            pool,
            task: Mutex::new(None),
        }
    }

    /// Stop any running task and start one for `settings`.
    ///
    /// Invalid settings are logged and returned; the scheduler is left stopped
    /// and the rest of the process is unaffected. Must be called from within a
    /// tokio runtime.
    pub fn start(&self, settings: &ReactivationSettings) -> Result<(), PolicyError> {
        let mut task = self.lock_task();
        if let Some(previous) = task.take() {
            previous.abort();
            info!("stopped previous reactivation task");
        }

        let policy = match ReactivationPolicy::from_settings(settings) {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                info!("auto reactivation disabled");
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "invalid reactivation settings, scheduler not started");
                return Err(e);
            }
        };

        info!(
            mode = policy.label(),
            interval = %settings.interval,
            cron_spec = %settings.cron_spec,
            timezone = %settings.timezone,
            "reactivation scheduler started"
        );
        *task = Some(spawn_reactivation_task(self.pool.clone(), policy));
        Ok(())
    }

    /// Abort the running task, if any.
    pub fn stop(&self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
            info!("reactivation scheduler stopped");
        }
    }

    /// Whether a reactivation task is live. Only tests read this.
    pub fn is_running(&self) -> bool {
        self.lock_task()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
    }
}

/// Spawn the sweep loop for `policy`.
///
/// Returns a `JoinHandle` for the spawned task; aborting it stops the policy.
pub fn spawn_reactivation_task(pool: Arc<KeyPool>, policy: ReactivationPolicy) -> JoinHandle<()> {
    tokio::spawn(async move {
        match policy {
            ReactivationPolicy::Interval(interval) => {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // Skip the immediate first tick
                ticker.tick().await;

                loop {
                    ticker.tick().await;
                    debug!("running interval reactivation sweep");
                    let reactivated = pool.reactivate_older_than(interval).await;
                    after_sweep(&pool, "interval", reactivated).await;
                }
            }
            ReactivationPolicy::Scheduled { schedule, zone } => {
                let mut from = Utc::now();
                loop {
                    let Some(next) = zone.next_fire(&schedule, from) else {
                        warn!("cron schedule has no upcoming fire time, reactivation task exiting");
                        return;
                    };
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    debug!(next = %next, wait_secs = wait.as_secs(), "waiting for next scheduled sweep");
                    tokio::time::sleep(wait).await;

                    let reactivated = pool.reactivate_all().await;
                    after_sweep(&pool, "scheduled", reactivated).await;
                    from = std::cmp::max(next, Utc::now());
                }
            }
        }
    })
}

async fn after_sweep(pool: &KeyPool, policy: &'static str, reactivated: usize) {
    if reactivated == 0 {
        return;
    }
    metrics::counter!("balancer_keys_reactivated_total", "policy" => policy)
        .increment(reactivated as u64);
    if let Err(e) = pool.save_state().await {
        warn!(error = %e, policy, "failed to persist state after reactivation sweep");
    }
}

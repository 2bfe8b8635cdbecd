//! Coordinator configuration.
//!
//! Every section has serde defaults so a partial file or an empty
//! environment yields a working configuration. [`CoordinatorConfig::from_env`]
//! overlays the documented environment variables on the defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::RetryPolicy;
use crate::invoker::{CallbackConfig, InvokerConfig};
use crate::logging::LogConfig;
use crate::{Error, Result};

/// Hard ceiling for the per-task recording duration, in seconds.
pub const MAX_RECORD_DURATION_CAP_SECS: u64 = 72 * 3600;

/// Liveness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Extra slack on top of two intervals before an entry counts as stale.
    #[serde(default = "default_staleness_buffer_ms")]
    pub staleness_buffer_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    3000
}

fn default_staleness_buffer_ms() -> u64 {
    1000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            staleness_buffer_ms: default_staleness_buffer_ms(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn staleness_buffer(&self) -> Duration {
        Duration::from_millis(self.staleness_buffer_ms)
    }
}

/// Lease timings for stage workers and task updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_stage_ttl_ms")]
    pub stage_ttl_ms: u64,
    #[serde(default = "default_renew_check_interval_ms")]
    pub renew_check_interval_ms: u64,
    #[serde(default = "default_acquire_retry_count")]
    pub acquire_retry_count: u32,
    #[serde(default = "default_acquire_retry_delay_ms")]
    pub acquire_retry_delay_ms: u64,
    #[serde(default = "default_update_ttl_ms")]
    pub update_ttl_ms: u64,
    #[serde(default = "default_update_retry_count")]
    pub update_retry_count: u32,
    #[serde(default = "default_update_retry_delay_ms")]
    pub update_retry_delay_ms: u64,
}

fn default_stage_ttl_ms() -> u64 {
    10_000
}

fn default_renew_check_interval_ms() -> u64 {
    2000
}

fn default_acquire_retry_count() -> u32 {
    5
}

fn default_acquire_retry_delay_ms() -> u64 {
    2500
}

fn default_update_ttl_ms() -> u64 {
    15_000
}

fn default_update_retry_count() -> u32 {
    3
}

fn default_update_retry_delay_ms() -> u64 {
    200
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            stage_ttl_ms: default_stage_ttl_ms(),
            renew_check_interval_ms: default_renew_check_interval_ms(),
            acquire_retry_count: default_acquire_retry_count(),
            acquire_retry_delay_ms: default_acquire_retry_delay_ms(),
            update_ttl_ms: default_update_ttl_ms(),
            update_retry_count: default_update_retry_count(),
            update_retry_delay_ms: default_update_retry_delay_ms(),
        }
    }
}

impl LeaseConfig {
    pub fn stage_ttl(&self) -> Duration {
        Duration::from_millis(self.stage_ttl_ms)
    }

    pub fn renew_check_interval(&self) -> Duration {
        Duration::from_millis(self.renew_check_interval_ms)
    }

    pub fn acquire_retry_delay(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_delay_ms)
    }
}

/// Diagnose sweep settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnoseConfig {
    /// Recoveries allowed before a task is escalated to the callback stage.
    #[serde(default = "default_max_retry_num")]
    pub max_retry_num: u32,
    /// Further recoveries tolerated while escalated before the task is
    /// abandoned as finished.
    #[serde(default = "default_callback_grace_retries")]
    pub callback_grace_retries: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Wall-clock budget of one sweep run.
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,
    /// The sweep stops picking up jobs this long before the budget ends.
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

fn default_max_retry_num() -> u32 {
    20
}

fn default_callback_grace_retries() -> u32 {
    3
}

fn default_interval_secs() -> u64 {
    60
}

fn default_time_budget_secs() -> u64 {
    120
}

fn default_safety_margin_secs() -> u64 {
    30
}

fn default_jitter_max_ms() -> u64 {
    50
}

impl Default for DiagnoseConfig {
    fn default() -> Self {
        Self {
            max_retry_num: default_max_retry_num(),
            callback_grace_retries: default_callback_grace_retries(),
            interval_secs: default_interval_secs(),
            time_budget_secs: default_time_budget_secs(),
            safety_margin_secs: default_safety_margin_secs(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

impl DiagnoseConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }
}

/// Control channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

fn default_poll_timeout_ms() -> u64 {
    2000
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl ControlConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Validation limits and timings for the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchLimits {
    #[serde(default = "default_max_dimension")]
    pub max_width: u32,
    #[serde(default = "default_max_dimension")]
    pub max_height: u32,
    /// Default and upper bound of `MaxDurationLimit`, in seconds.
    #[serde(default = "default_max_record_duration_secs")]
    pub max_record_duration_secs: u64,
    /// Wait between a forced stop signal and terminating the invocation.
    #[serde(default = "default_force_stop_grace_ms")]
    pub force_stop_grace_ms: u64,
}

fn default_max_dimension() -> u32 {
    2560
}

fn default_max_record_duration_secs() -> u64 {
    36_000
}

fn default_force_stop_grace_ms() -> u64 {
    2000
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
            max_record_duration_secs: default_max_record_duration_secs(),
            force_stop_grace_ms: default_force_stop_grace_ms(),
        }
    }
}

/// Store connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Expire task records this many seconds after their last write.
    #[serde(default)]
    pub task_ttl_secs: Option<u64>,
}

fn default_database_url() -> String {
    "sqlite:pagecast.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            retry: RetryPolicy::default(),
            task_ttl_secs: None,
        }
    }
}

/// Complete coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub diagnose: DiagnoseConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub limits: DispatchLimits,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub invoker: InvokerConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl CoordinatorConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.store.database_url = url;
        }
        if let Some(ttl) = parse_var(&lookup, "TASK_EXPIRE")? {
            config.store.task_ttl_secs = Some(ttl);
        }
        if let Some(interval) = parse_var(&lookup, "HEARTBEAT_INTERVAL")? {
            config.heartbeat.interval_ms = interval;
        }
        if let Some(buffer) = parse_var(&lookup, "HEARTBEAT_BUFFER")? {
            config.heartbeat.staleness_buffer_ms = buffer;
        }
        if let Some(max) = parse_var(&lookup, "MAX_RETRY_NUM")? {
            config.diagnose.max_retry_num = max;
        }
        if let Some(interval) = parse_var(&lookup, "DIAGNOSE_INTERVAL")? {
            config.diagnose.interval_secs = interval;
        }
        if let Some(budget) = parse_var(&lookup, "DIAGNOSE_TIME_BUDGET")? {
            config.diagnose.time_budget_secs = budget;
        }
        if let Some(limit) = parse_var::<u64, _>(&lookup, "MAX_RECORD_DURATION_LIMIT")? {
            config.limits.max_record_duration_secs = limit.min(MAX_RECORD_DURATION_CAP_SECS);
        }
        if let Some(width) = parse_var(&lookup, "MAX_WIDTH")? {
            config.limits.max_width = width;
        }
        if let Some(height) = parse_var(&lookup, "MAX_HEIGHT")? {
            config.limits.max_height = height;
        }
        if let Some(base_url) = lookup("INVOKER_BASE_URL") {
            config.invoker.base_url = base_url;
        }
        if let Some(token) = lookup("INVOKER_TOKEN") {
            config.invoker.token = Some(token);
        }
        if let Some(filter) = lookup("LOG_FILTER") {
            config.log.filter = filter;
        }
        if let Some(json) = parse_var(&lookup, "LOG_JSON")? {
            config.log.json = json;
        }
        if let Some(dir) = lookup("LOG_DIR") {
            config.log.dir = Some(PathBuf::from(dir));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval_ms == 0 {
            return Err(Error::config("heartbeat interval must be positive"));
        }
        if self.lease.stage_ttl_ms == 0 || self.lease.update_ttl_ms == 0 {
            return Err(Error::config("lease TTLs must be positive"));
        }
        // An update reads and writes the record under the lease, and each
        // store call may spend the whole retry budget.
        let update_budget = self.store.retry.max_total_delay() * 2;
        if Duration::from_millis(self.lease.update_ttl_ms) <= update_budget {
            return Err(Error::config(format!(
                "task update lease TTL must exceed {} ms of store retries",
                update_budget.as_millis()
            )));
        }
        if self.lease.renew_check_interval_ms >= self.lease.stage_ttl_ms / 2 {
            return Err(Error::config(
                "lease renew check interval must be shorter than half the stage lease TTL",
            ));
        }
        if self.diagnose.safety_margin_secs >= self.diagnose.time_budget_secs {
            return Err(Error::config(
                "diagnose safety margin must be smaller than the time budget",
            ));
        }
        if self.limits.max_record_duration_secs > MAX_RECORD_DURATION_CAP_SECS {
            return Err(Error::config("max record duration exceeds 72 hours"));
        }
        Ok(())
    }

    pub fn task_ttl(&self) -> Option<Duration> {
        self.store.task_ttl_secs.map(Duration::from_secs)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::config(format!("Invalid value for {}: {} ({})", name, raw, e))),
    }
}

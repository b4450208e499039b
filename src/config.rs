//! Scheduler options.
//!
//! Loaded from a TOML file; every field has a default matching the original
//! operational constants so a missing file yields a usable configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// What to do with jobs that abort or error out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlingStrategy {
    /// Leave aborted jobs aborted; they only run again on operator reset.
    DontRestart,
    /// Re-queue aborted jobs and let the next evaluation pick them up.
    RestartAfterQueue,
    /// Restart the aborted job itself after `retry_delay_secs`.
    RestartImmediately,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Base iteration period of the control loop, milliseconds.
    pub update_period_ms: u64,
    /// Shared retry ceiling for the per-stage failure counters.
    pub max_failure_attempts: u32,

    /// Per-stage inactivity timeouts, seconds.
    pub align_timeout_secs: u64,
    pub focus_timeout_secs: u64,
    pub guide_timeout_secs: u64,
    pub capture_timeout_secs: u64,
    /// Delay before re-starting guiding after an abort, seconds.
    pub restart_guiding_delay_secs: u64,

    /// How far ahead of a job's startup time the scheduler stays awake.
    pub lead_time_secs: i64,
    /// Park the mount while sleeping toward a distant startup.
    pub park_mount_while_sleeping: bool,
    /// Park devices and sleep when the next job is further away than this.
    pub preemptive_shutdown: bool,
    pub preemptive_shutdown_secs: i64,

    pub error_handling: ErrorHandlingStrategy,
    /// Also re-queue jobs in Error state, not only aborted ones.
    pub reschedule_errors: bool,
    /// Delay before an immediately-restarted job runs again, seconds.
    pub retry_delay_secs: i64,

    /// Count already-stored frames and subtract them from the work left.
    pub remember_job_progress: bool,
    /// When the whole queue finishes, reset every job and start over.
    pub repeat_all: bool,
    /// Force a fresh alignment whenever a repeating job starts a new batch.
    pub force_realign_per_batch: bool,

    /// Unpark the dome/mount/dust-cover during startup, park during shutdown.
    pub unpark_dome: bool,
    pub unpark_mount: bool,
    pub open_dust_cover: bool,

    /// Optional startup/shutdown scripts run by the script collaborator.
    pub startup_script: Option<String>,
    pub shutdown_script: Option<String>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            update_period_ms: 1000,
            max_failure_attempts: 5,
            align_timeout_secs: 120,
            focus_timeout_secs: 120,
            guide_timeout_secs: 60,
            capture_timeout_secs: 180,
            restart_guiding_delay_secs: 5,
            lead_time_secs: 300,
            park_mount_while_sleeping: false,
            preemptive_shutdown: false,
            preemptive_shutdown_secs: 1800,
            error_handling: ErrorHandlingStrategy::RestartAfterQueue,
            reschedule_errors: false,
            retry_delay_secs: 60,
            remember_job_progress: false,
            repeat_all: false,
            force_realign_per_batch: false,
            unpark_dome: false,
            unpark_mount: true,
            open_dust_cover: false,
            startup_script: None,
            shutdown_script: None,
        }
    }
}

impl SchedulerOptions {
    pub fn from_toml_str(s: &str) -> Result<Self, SchedulerError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, SchedulerError> {
        let text = std::fs::read_to_string(path).map_err(|source| SchedulerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

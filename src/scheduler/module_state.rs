//! Session-wide scheduler state registry.
//!
//! One [`ModuleState`] exists per scheduler session and is passed explicitly
//! to every component; it gates progression on coarse external readiness
//! (startup, shutdown, park-wait, communication), tracks per-stage failure
//! counters, and owns the timer-state/interval pair the iteration driver
//! consumes.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::devices::WeatherStatus;
use crate::models::CapturedFramesMap;

/// Top-level scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Starting,
    Running,
    Paused,
    Shutdown,
    Aborted,
    Loading,
}

/// Communication status of an external link (hub process, device links).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommStatus {
    Idle,
    Pending,
    Success,
    Error,
}

/// Startup procedure phases, walked in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StartupState {
    Idle,
    Script,
    UnparkDome,
    UnparkMount,
    UncapDustCover,
    Complete,
    Error,
}

/// Shutdown procedure phases, walked in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Idle,
    CapDustCover,
    ParkMount,
    ParkDome,
    Script,
    Complete,
    Error,
}

/// Park-wait procedure used when waiting for a distant job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkWaitState {
    Idle,
    Park,
    Parking,
    Parked,
    Unpark,
    Unparking,
    Unparked,
    Error,
}

/// Which phase handler the next iteration dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Wake from sleep or preemptive shutdown.
    Wakeup,
    /// Evaluate the queue and select a job.
    Scheduler,
    /// Monitor the active job's stage.
    JobCheck,
    /// Drive the shutdown procedure.
    Shutdown,
    /// Idle; no further iteration scheduled.
    Nothing,
}

/// Per-stage failure counters sharing one retry ceiling.
#[derive(Debug, Default, Clone)]
pub struct FailureCounters {
    pub align: u32,
    pub focus: u32,
    pub guide: u32,
    pub capture: u32,
}

pub struct ModuleState {
    pub scheduler_state: SchedulerState,
    pub hub_state: CommStatus,
    pub links_state: CommStatus,
    pub startup_state: StartupState,
    pub shutdown_state: ShutdownState,
    pub park_wait_state: ParkWaitState,
    pub weather_status: WeatherStatus,

    failures: FailureCounters,
    max_failure_attempts: u32,

    pub autofocus_completed: bool,

    pub captured_frames: CapturedFramesMap,
    pub captured_frames_valid: bool,

    /// Id of the job currently owning the sequencer, if any.
    pub active_job: Option<Uuid>,
    /// Job whose reference frame is being plate-solved, if any.
    pub solver_job: Option<Uuid>,
    /// Batches completed by the active job in this run (loop/deadline jobs).
    pub capture_batch: u32,

    /// Last observed progress of the current stage; inactivity timeouts
    /// measure from here.
    pub operation_started: DateTime<Utc>,
    /// Deadline for restarting guiding after an abort, when armed.
    pub guiding_restart_at: Option<DateTime<Utc>>,

    pub preemptive_shutdown: bool,
    pub preemptive_wakeup: Option<DateTime<Utc>>,

    timer_state: TimerState,
    timer_interval_ms: i64,
    iteration_setup: bool,
    pub iteration: u64,
}

impl ModuleState {
    pub fn new(max_failure_attempts: u32) -> Self {
        Self {
            scheduler_state: SchedulerState::Idle,
            hub_state: CommStatus::Idle,
            links_state: CommStatus::Idle,
            startup_state: StartupState::Idle,
            shutdown_state: ShutdownState::Idle,
            park_wait_state: ParkWaitState::Idle,
            weather_status: WeatherStatus::Ok,
            failures: FailureCounters::default(),
            max_failure_attempts,
            autofocus_completed: false,
            captured_frames: CapturedFramesMap::new(),
            captured_frames_valid: false,
            active_job: None,
            solver_job: None,
            capture_batch: 0,
            operation_started: Utc::now(),
            guiding_restart_at: None,
            preemptive_shutdown: false,
            preemptive_wakeup: None,
            timer_state: TimerState::Nothing,
            timer_interval_ms: -1,
            iteration_setup: false,
            iteration: 0,
        }
    }

    /// Full reset at scheduler stop; the session context does not leak into
    /// the next run.
    pub fn reset(&mut self) {
        let max = self.max_failure_attempts;
        *self = ModuleState::new(max);
    }

    // --- failure counters -------------------------------------------------

    /// Each `increase_*` bumps the stage counter and reports whether another
    /// retry is allowed. False means the ceiling is exceeded and the job
    /// must be aborted.
    pub fn increase_align_failure_count(&mut self) -> bool {
        self.failures.align += 1;
        self.failures.align <= self.max_failure_attempts
    }

    pub fn increase_focus_failure_count(&mut self) -> bool {
        self.failures.focus += 1;
        self.failures.focus <= self.max_failure_attempts
    }

    pub fn increase_guide_failure_count(&mut self) -> bool {
        self.failures.guide += 1;
        self.failures.guide <= self.max_failure_attempts
    }

    pub fn increase_capture_failure_count(&mut self) -> bool {
        self.failures.capture += 1;
        self.failures.capture <= self.max_failure_attempts
    }

    pub fn reset_failure_counters(&mut self) {
        self.failures = FailureCounters::default();
    }

    pub fn failures(&self) -> &FailureCounters {
        &self.failures
    }

    // --- stage inactivity timer -------------------------------------------

    /// Re-arm the inactivity timer; called whenever a stage shows progress.
    pub fn start_current_operation_timer(&mut self, now: DateTime<Utc>) {
        self.operation_started = now;
    }

    pub fn current_operation_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.operation_started).num_seconds()
    }

    // --- iteration timer ---------------------------------------------------

    /// Record the next phase handler and its delay. Every handler is
    /// expected to call this exactly once per dispatch.
    pub fn setup_next_iteration(&mut self, state: TimerState, interval_ms: i64) {
        self.timer_state = state;
        self.timer_interval_ms = interval_ms;
        self.iteration_setup = true;
    }

    pub fn timer_state(&self) -> TimerState {
        self.timer_state
    }

    pub fn timer_interval_ms(&self) -> i64 {
        self.timer_interval_ms
    }

    pub fn begin_iteration(&mut self) -> TimerState {
        self.iteration += 1;
        self.iteration_setup = false;
        self.timer_state
    }

    pub fn iteration_setup(&self) -> bool {
        self.iteration_setup
    }

    // --- preemptive shutdown ----------------------------------------------

    pub fn enable_preemptive_shutdown(&mut self, wakeup: DateTime<Utc>) {
        self.preemptive_shutdown = true;
        self.preemptive_wakeup = Some(wakeup);
    }

    pub fn disable_preemptive_shutdown(&mut self) {
        self.preemptive_shutdown = false;
        self.preemptive_wakeup = None;
    }
}

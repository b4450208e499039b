//! Iteration driver and job-stage sequencer.
//!
//! The control loop is a single-shot timer: every iteration dispatches on the
//! recorded [`TimerState`], runs exactly one phase handler, and that handler
//! records the next phase and delay before returning. Device notifications
//! arrive on a channel between iterations and advance the active job's stage
//! directly; the periodic job-check only covers what notifications cannot,
//! inactivity timeouts and polled collaborators.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::config::{ErrorHandlingStrategy, SchedulerOptions};
use crate::devices::{
    AlignStatus, CaptureStatus, DeviceEvent, DeviceSet, FocusStatus, GuideStatus, MountStatus,
    SolverResult, WeatherStatus,
};
use crate::ephemeris::Ephemeris;
use crate::models::{CompletionCondition, JobStage, JobStatus, StepPipeline};
use crate::services::estimator::can_count_captures;
use crate::services::queue::update_completed_jobs_count;
use crate::services::EventLog;

use super::greedy::{GreedyParams, GreedyScheduler};
use super::module_state::{
    CommStatus, ModuleState, ParkWaitState, SchedulerState, ShutdownState, StartupState,
    TimerState,
};
use super::process::SchedulerProcess;

/// Operator commands accepted by the running control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    Start,
    Stop,
    Pause,
    Resume,
    WakeUp,
}

pub struct Scheduler {
    options: SchedulerOptions,
    jobs: Vec<crate::models::SchedulerJob>,
    state: ModuleState,
    greedy: GreedyScheduler,
    process: SchedulerProcess,
    ephemeris: Arc<dyn Ephemeris>,
    log: EventLog,
}

impl Scheduler {
    pub fn new(
        options: SchedulerOptions,
        devices: DeviceSet,
        ephemeris: Arc<dyn Ephemeris>,
        log: EventLog,
    ) -> Self {
        let state = ModuleState::new(options.max_failure_attempts);
        let process = SchedulerProcess::new(devices, options.clone(), log.clone());
        Self {
            options,
            jobs: Vec::new(),
            state,
            greedy: GreedyScheduler::new(),
            process,
            ephemeris,
            log,
        }
    }

    pub fn set_jobs(&mut self, jobs: Vec<crate::models::SchedulerJob>) {
        self.jobs = jobs;
    }

    pub fn jobs(&self) -> &[crate::models::SchedulerJob] {
        &self.jobs
    }

    pub fn jobs_mut(&mut self) -> &mut Vec<crate::models::SchedulerJob> {
        &mut self.jobs
    }

    pub fn module_state(&self) -> &ModuleState {
        &self.state
    }

    pub fn module_state_mut(&mut self) -> &mut ModuleState {
        &mut self.state
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    fn update_ms(&self) -> i64 {
        self.options.update_period_ms as i64
    }

    fn active_index(&self) -> Option<usize> {
        let id = self.state.active_job?;
        self.jobs.iter().position(|j| j.id == id)
    }

    // --- lifecycle ---------------------------------------------------------

    /// Start a scheduler session over the current queue.
    pub fn execute(&mut self, now: DateTime<Utc>) {
        match self.state.scheduler_state {
            SchedulerState::Running => return,
            SchedulerState::Paused => {
                self.resume(now);
                return;
            }
            _ => {}
        }

        self.state.reset();
        for job in &mut self.jobs {
            job.reset();
        }
        self.state.weather_status = self.process.devices().weather.status();
        self.state.scheduler_state = SchedulerState::Running;
        self.state.start_current_operation_timer(now);
        self.log.info("Scheduler started.");
        info!(jobs = self.jobs.len(), "scheduler session started");
        self.state
            .setup_next_iteration(TimerState::Scheduler, self.update_ms());
    }

    /// Stop the session. The active job, if any, is aborted.
    pub fn stop(&mut self, now: DateTime<Utc>) {
        if self.state.scheduler_state == SchedulerState::Idle {
            return;
        }
        if let Some(index) = self.active_index() {
            self.stop_current_job_action(now);
            let job = &mut self.jobs[index];
            if job.status == JobStatus::Busy {
                job.status = JobStatus::Aborted;
                job.stop_reason = "scheduler stopped".into();
            }
        }
        if self.state.solver_job.take().is_some() {
            self.process.devices().solver.abort();
        }
        self.state.reset();
        self.log.info("Scheduler stopped.");
        info!("scheduler session stopped");
    }

    /// Request a pause; it takes effect at the next decision point.
    pub fn pause(&mut self) {
        if self.state.scheduler_state == SchedulerState::Running {
            self.state.scheduler_state = SchedulerState::Paused;
            self.log.info("Scheduler pause requested.");
        }
    }

    /// Park the loop while paused; only a resume or stop re-arms it.
    fn set_paused(&mut self) {
        self.log.info("Scheduler paused.");
        self.state.setup_next_iteration(TimerState::Nothing, -1);
    }

    pub fn resume(&mut self, _now: DateTime<Utc>) {
        if self.state.scheduler_state != SchedulerState::Paused {
            return;
        }
        self.state.scheduler_state = SchedulerState::Running;
        self.log.info("Scheduler resumed.");
        self.state
            .setup_next_iteration(TimerState::Scheduler, self.update_ms());
    }

    // --- iteration dispatch ------------------------------------------------

    /// Run one iteration of the control loop and return the delay in
    /// milliseconds until the next one (negative means none is scheduled).
    pub fn run_scheduler_iteration(&mut self, now: DateTime<Utc>) -> i64 {
        let phase = self.state.begin_iteration();
        debug!(?phase, iteration = self.state.iteration, "scheduler iteration");

        match phase {
            TimerState::Wakeup => self.wake_up_scheduler(now),
            TimerState::Scheduler => self.check_status(now),
            TimerState::JobCheck => self.check_job_stage(now),
            TimerState::Shutdown => self.check_shutdown_state(now),
            TimerState::Nothing => {
                self.state.setup_next_iteration(TimerState::Nothing, -1);
            }
        }

        if !self.state.iteration_setup() {
            // A handler returned without arming the timer; re-arm its own
            // phase so the loop cannot stall.
            warn!(?phase, "iteration handler did not arm the next timer");
            self.state.setup_next_iteration(phase, self.update_ms());
        }
        self.state.timer_interval_ms()
    }

    /// Wake from a sleep or a preemptive shutdown.
    pub fn wake_up_scheduler(&mut self, _now: DateTime<Utc>) {
        if self.state.preemptive_shutdown {
            self.state.disable_preemptive_shutdown();
            self.state.startup_state = StartupState::Idle;
            self.state.shutdown_state = ShutdownState::Idle;
            self.state.scheduler_state = SchedulerState::Running;
            self.log
                .info("Scheduler is awake, resuming observatory startup.");
        } else {
            if self.state.park_wait_state == ParkWaitState::Parked {
                self.state.park_wait_state = ParkWaitState::Unpark;
            }
            self.log.info("Scheduler is awake.");
        }
        self.state
            .setup_next_iteration(TimerState::Scheduler, self.update_ms());
    }

    // --- scheduler phase ---------------------------------------------------

    /// Main decision point when no job is being monitored: drive shutdown to
    /// its end, or evaluate the queue and start the best candidate.
    fn check_status(&mut self, now: DateTime<Utc>) {
        if self.state.scheduler_state == SchedulerState::Paused {
            self.set_paused();
            return;
        }

        match self.state.shutdown_state {
            ShutdownState::Complete | ShutdownState::Error => {
                self.complete_shutdown(now);
                return;
            }
            ShutdownState::Idle => {}
            _ => {
                // Shutdown already in progress, keep driving it.
                self.check_shutdown_state(now);
                return;
            }
        }

        if !self.process.check_park_wait_state(&mut self.state) {
            self.state
                .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            return;
        }

        if self.state.active_job.is_some() {
            self.state
                .setup_next_iteration(TimerState::JobCheck, self.update_ms());
            return;
        }

        // Targets specified by a reference frame need their coordinates
        // solved before they can be ranked.
        if self.solve_pending_targets() {
            self.state
                .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            return;
        }

        self.evaluate_jobs(now);
        self.select_active_job(now);
    }

    /// Kick off, or wait out, a plate solve for the next unresolved target.
    /// True while one is pending.
    fn solve_pending_targets(&mut self) -> bool {
        if self.state.solver_job.is_some() {
            return true;
        }
        for job in &self.jobs {
            if job.status.is_terminal() || job.fits_solved {
                continue;
            }
            if let Some(file) = &job.fits_file {
                self.log.info(format!(
                    "Solving target coordinates for job '{}'...",
                    job.name
                ));
                self.process
                    .devices()
                    .solver
                    .run(file, self.options.align_timeout_secs);
                self.state.solver_job = Some(job.id);
                return true;
            }
        }
        false
    }

    /// Re-rank the whole queue.
    fn evaluate_jobs(&mut self, now: DateTime<Utc>) {
        if self.options.remember_job_progress {
            let forced = !self.state.captured_frames_valid;
            update_completed_jobs_count(
                &self.jobs,
                self.process.devices().storage.as_ref(),
                &mut self.state.captured_frames,
                forced,
            );
            self.state.captured_frames_valid = true;
        }

        let strategy = self.options.error_handling;
        self.greedy.set_params(GreedyParams {
            restart_aborted_immediately: strategy == ErrorHandlingStrategy::RestartImmediately,
            restart_queue: strategy == ErrorHandlingStrategy::RestartAfterQueue,
            reschedule_errors: self.options.reschedule_errors,
            retry_delay_secs: self.options.retry_delay_secs,
        });
        self.greedy.schedule_jobs(
            &mut self.jobs,
            now,
            &self.state.captured_frames,
            self.ephemeris.as_ref(),
            self.state.weather_status,
            self.options.remember_job_progress,
            &self.log,
        );
    }

    /// Act on the evaluation result: start the best candidate, sleep toward
    /// its startup time, or wind the session down.
    fn select_active_job(&mut self, now: DateTime<Utc>) {
        let Some(id) = self.greedy.scheduled_job() else {
            self.handle_empty_selection(now);
            return;
        };
        let Some(index) = self.jobs.iter().position(|j| j.id == id) else {
            self.handle_empty_selection(now);
            return;
        };

        let startup = self.jobs[index].startup_time.unwrap_or(now);
        let lead = Duration::seconds(self.options.lead_time_secs);

        if startup > now + lead {
            self.should_scheduler_sleep(now, startup);
            return;
        }
        if startup > now {
            // Within lead time: stay awake and poll until the startup time.
            self.state
                .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            return;
        }

        // Observatory must be up before the job runs. The startup script
        // powers the equipment on, so it runs before the hub and the device
        // links come up; unparking follows once everything is connected.
        let script_done = self.process.check_startup_script(&mut self.state);
        let hub_ready = script_done && self.process.check_hub_state(&mut self.state);
        let links_ready = hub_ready && self.process.check_links_state(&mut self.state);
        let started_up = links_ready && self.process.check_startup_state(&mut self.state);
        if !started_up {
            if self.state.startup_state == StartupState::Error
                || self.state.hub_state == CommStatus::Error
                || self.state.links_state == CommStatus::Error
            {
                self.log
                    .error("Observatory startup failed, stopping the scheduler.");
                self.state.scheduler_state = SchedulerState::Aborted;
                self.state.setup_next_iteration(TimerState::Nothing, -1);
                return;
            }
            self.state
                .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            return;
        }

        self.execute_job(index, now);
    }

    /// Nothing selectable: restart abortees, restart the whole queue, or
    /// shut down.
    fn handle_empty_selection(&mut self, now: DateTime<Utc>) {
        let restartable: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| {
                j.status == JobStatus::Aborted
                    || (j.status == JobStatus::Error && self.options.reschedule_errors)
            })
            .map(|(i, _)| i)
            .collect();

        if self.options.error_handling != ErrorHandlingStrategy::DontRestart
            && !restartable.is_empty()
        {
            self.log
                .info("Only aborted or failed jobs remain, rescheduling them.");
            for index in restartable {
                let job = &mut self.jobs[index];
                job.status = JobStatus::Idle;
                job.stage = JobStage::Idle;
            }
            self.state.setup_next_iteration(
                TimerState::Scheduler,
                (self.options.retry_delay_secs * 1000).max(self.update_ms()),
            );
            return;
        }

        let all_terminal = self.jobs.iter().all(|j| j.status.is_terminal());
        let any_complete = self.jobs.iter().any(|j| j.status == JobStatus::Complete);
        if self.options.repeat_all && all_terminal && any_complete {
            self.log.info("All jobs completed, restarting the queue.");
            for job in &mut self.jobs {
                job.reset();
            }
            self.state.captured_frames_valid = false;
            self.state
                .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            return;
        }

        self.log
            .info("No jobs left in the scheduler queue, initiating shutdown.");
        self.start_shutdown(now);
    }

    /// A distant startup: either park everything and sleep, or just sleep.
    fn should_scheduler_sleep(&mut self, now: DateTime<Utc>, startup: DateTime<Utc>) {
        let delay = startup - now;
        if self.options.preemptive_shutdown
            && delay > Duration::seconds(self.options.preemptive_shutdown_secs)
        {
            self.log.info(format!(
                "Next job is far away, parking the observatory until {startup}."
            ));
            self.state.enable_preemptive_shutdown(startup);
            self.start_shutdown(now);
            return;
        }

        // Optionally park the mount first; the park-wait procedure runs on
        // the scheduler timer until the mount reports parked.
        if self.options.park_mount_while_sleeping
            && matches!(
                self.state.park_wait_state,
                ParkWaitState::Idle | ParkWaitState::Unparked
            )
        {
            self.log.info("Parking the mount until the next job.");
            self.state.park_wait_state = ParkWaitState::Park;
            self.state
                .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            return;
        }

        let wake_at = startup - Duration::seconds(self.options.lead_time_secs);
        let ms = (wake_at - now).num_milliseconds().max(self.update_ms());
        self.log
            .info(format!("Scheduler is going to sleep until {wake_at}."));
        self.state.setup_next_iteration(TimerState::Wakeup, ms);
    }

    /// Hand the observatory to the selected job.
    fn execute_job(&mut self, index: usize, now: DateTime<Utc>) {
        {
            let job = &mut self.jobs[index];
            job.status = JobStatus::Busy;
            job.stage = JobStage::Idle;
            self.state.active_job = Some(job.id);
            self.log.info(format!("Job '{}' is starting.", job.name));
            info!(job = %job.name, "job execution started");
        }
        self.state.autofocus_completed = false;
        self.state.capture_batch = 0;
        self.state.park_wait_state = ParkWaitState::Idle;
        self.state.reset_failure_counters();
        self.state.start_current_operation_timer(now);
        self.get_next_action(now);
        self.state
            .setup_next_iteration(TimerState::JobCheck, self.update_ms());
    }

    // --- shutdown phase ----------------------------------------------------

    fn start_shutdown(&mut self, _now: DateTime<Utc>) {
        self.state.active_job = None;
        self.state.scheduler_state = SchedulerState::Shutdown;
        self.state.shutdown_state = ShutdownState::Idle;
        self.state
            .setup_next_iteration(TimerState::Shutdown, self.update_ms());
    }

    fn check_shutdown_state(&mut self, now: DateTime<Utc>) {
        if self.process.check_shutdown_procedure(&mut self.state) {
            self.complete_shutdown(now);
        } else {
            self.state
                .setup_next_iteration(TimerState::Shutdown, self.update_ms());
        }
    }

    /// Final teardown. A preemptive shutdown arms a wakeup timer instead of
    /// ending the session.
    fn complete_shutdown(&mut self, now: DateTime<Utc>) {
        self.process.complete_shutdown(&mut self.state);

        if self.state.preemptive_shutdown {
            if let Some(wakeup) = self.state.preemptive_wakeup {
                let wake_at = wakeup - Duration::seconds(self.options.lead_time_secs);
                let ms = (wake_at - now).num_milliseconds().max(self.update_ms());
                self.log
                    .info(format!("Observatory parked, sleeping until {wake_at}."));
                self.state.setup_next_iteration(TimerState::Wakeup, ms);
                return;
            }
        }

        self.state.scheduler_state = SchedulerState::Idle;
        self.log.success("Scheduler finished.");
        info!("scheduler session finished");
        self.state.setup_next_iteration(TimerState::Nothing, -1);
    }

    // --- job-check phase ---------------------------------------------------

    /// Monitor the active job: re-validate it against its constraints, then
    /// run the per-stage supervision.
    fn check_job_stage(&mut self, now: DateTime<Utc>) {
        let Some(active_id) = self.state.active_job else {
            self.state
                .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            return;
        };

        // An expired deadline is a completion, not a violation: the job
        // stays busy and find_next_job applies its completion condition.
        if let Some(index) = self.active_index() {
            if let CompletionCondition::FinishAt(deadline) = self.jobs[index].completion {
                if now >= deadline {
                    self.stop_current_job_action(now);
                    self.find_next_job(now);
                    return;
                }
            }
        }

        if !self.greedy.check_job(
            &self.jobs,
            now,
            active_id,
            self.ephemeris.as_ref(),
            self.state.weather_status,
        ) {
            if let Some(index) = self.active_index() {
                self.stop_current_job_action(now);
                let job = &mut self.jobs[index];
                job.status = JobStatus::Idle;
                self.log.info(format!(
                    "Job '{}' is stopping, its constraints are no longer met.",
                    job.name
                ));
            }
            self.find_next_job(now);
            return;
        }

        self.check_job_stage_epilogue(now);
    }

    /// Per-stage supervision: inactivity timeouts and polled collaborators.
    fn check_job_stage_epilogue(&mut self, now: DateTime<Utc>) {
        let Some(index) = self.active_index() else {
            self.state
                .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            return;
        };

        self.process
            .process_guiding_timer(&mut self.jobs[index], &mut self.state, now);

        match self.jobs[index].stage {
            JobStage::Idle => {
                self.get_next_action(now);
            }
            JobStage::Slewing | JobStage::Reslewing => match self.process.devices().mount.status() {
                None => {
                    if !self.process.manage_connection_loss(&mut self.state, "mount") {
                        self.fail_active_job(now, JobStatus::Error, "mount connection lost");
                        return;
                    }
                }
                Some(MountStatus::Error) => {
                    self.fail_active_job(now, JobStatus::Error, "mount failed while slewing");
                    return;
                }
                Some(MountStatus::Tracking) => {
                    // Completion may arrive by poll before the notification.
                    let job = &mut self.jobs[index];
                    job.stage = if job.stage == JobStage::Reslewing {
                        JobStage::ReslewComplete
                    } else {
                        JobStage::SlewComplete
                    };
                    self.state.start_current_operation_timer(now);
                }
                _ => {}
            },
            JobStage::SlewComplete | JobStage::ReslewComplete => {
                // Wait out dome slaving before the next stage.
                if self.process.devices().dome.is_available() {
                    match self.process.devices().dome.is_moving() {
                        None => {
                            if !self.process.manage_connection_loss(&mut self.state, "dome") {
                                self.fail_active_job(now, JobStatus::Error, "dome connection lost");
                                return;
                            }
                        }
                        Some(true) => {}
                        Some(false) => self.get_next_action(now),
                    }
                } else {
                    self.get_next_action(now);
                }
            }
            JobStage::Focusing | JobStage::PostalignFocusing => {
                let stalled = self.process.devices().focuser.status() == FocusStatus::Idle
                    && self.state.current_operation_secs(now)
                        > self.options.focus_timeout_secs as i64;
                if stalled {
                    self.log.warning(format!(
                        "Job '{}' focusing procedure timed out.",
                        self.jobs[index].name
                    ));
                    if self.state.increase_focus_failure_count() {
                        self.process
                            .start_focusing(&mut self.jobs[index], &mut self.state, now);
                    } else {
                        self.abort_active_job(now, "focusing failed repeatedly");
                        return;
                    }
                }
            }
            JobStage::Aligning => {
                let stalled = self.process.devices().aligner.status() == AlignStatus::Idle
                    && self.state.current_operation_secs(now)
                        > self.options.align_timeout_secs as i64;
                if stalled {
                    self.log.warning(format!(
                        "Job '{}' alignment procedure timed out.",
                        self.jobs[index].name
                    ));
                    if self.state.increase_align_failure_count() {
                        self.process
                            .start_astrometry(&mut self.jobs[index], &mut self.state, now);
                    } else {
                        self.abort_active_job(now, "alignment failed repeatedly");
                        return;
                    }
                }
            }
            JobStage::Guiding => {
                let stalled = self.process.guiding_status() == GuideStatus::Idle
                    && self.state.current_operation_secs(now)
                        > self.options.guide_timeout_secs as i64;
                if stalled {
                    self.log.warning(format!(
                        "Job '{}' guiding procedure timed out.",
                        self.jobs[index].name
                    ));
                    if self.state.increase_guide_failure_count() {
                        self.process
                            .start_guiding(&mut self.jobs[index], &mut self.state, now, true);
                    } else {
                        self.abort_active_job(now, "guiding failed repeatedly");
                        return;
                    }
                }
            }
            JobStage::Capturing => {
                let stalled = self.process.devices().camera.status() == CaptureStatus::Idle
                    && self.state.current_operation_secs(now)
                        > self.options.capture_timeout_secs as i64;
                if stalled {
                    self.log.warning(format!(
                        "Job '{}' capture did not start in time.",
                        self.jobs[index].name
                    ));
                    if self.state.increase_capture_failure_count() {
                        self.process
                            .start_capture(&mut self.jobs[index], &mut self.state, now);
                    } else {
                        self.abort_active_job(now, "capture failed repeatedly");
                        return;
                    }
                }
            }
            // Transitional stages advance on device notifications.
            _ => {}
        }

        self.state
            .setup_next_iteration(TimerState::JobCheck, self.update_ms());
    }

    /// Pick the next stage for the active job from its pipeline and current
    /// progress, and issue the corresponding command.
    fn get_next_action(&mut self, now: DateTime<Utc>) {
        let Some(index) = self.active_index() else {
            return;
        };
        let stage = self.jobs[index].stage;
        let pipeline = self.jobs[index].pipeline;
        let already_guiding = self.process.guiding_status() == GuideStatus::Guiding;

        match stage {
            JobStage::Idle => {
                if !self.jobs[index].light_frames_required {
                    // Calibration-only work needs no sky preparation.
                    self.process
                        .start_capture(&mut self.jobs[index], &mut self.state, now);
                } else if pipeline.contains(StepPipeline::TRACK) {
                    self.process
                        .start_slew(&mut self.jobs[index], &mut self.state, now);
                } else if pipeline.contains(StepPipeline::FOCUS) && !self.state.autofocus_completed
                {
                    self.process
                        .start_focusing(&mut self.jobs[index], &mut self.state, now);
                } else if pipeline.contains(StepPipeline::ALIGN) {
                    self.process
                        .start_astrometry(&mut self.jobs[index], &mut self.state, now);
                } else if pipeline.contains(StepPipeline::GUIDE) && !already_guiding {
                    self.process
                        .start_guiding(&mut self.jobs[index], &mut self.state, now, false);
                } else {
                    self.process
                        .start_capture(&mut self.jobs[index], &mut self.state, now);
                }
            }
            JobStage::SlewComplete => {
                if pipeline.contains(StepPipeline::FOCUS) && !self.state.autofocus_completed {
                    self.process
                        .start_focusing(&mut self.jobs[index], &mut self.state, now);
                } else if pipeline.contains(StepPipeline::ALIGN) {
                    self.process
                        .start_astrometry(&mut self.jobs[index], &mut self.state, now);
                } else if pipeline.contains(StepPipeline::GUIDE) && !already_guiding {
                    self.process
                        .start_guiding(&mut self.jobs[index], &mut self.state, now, false);
                } else {
                    self.process
                        .start_capture(&mut self.jobs[index], &mut self.state, now);
                }
            }
            JobStage::FocusComplete => {
                if pipeline.contains(StepPipeline::ALIGN) {
                    self.process
                        .start_astrometry(&mut self.jobs[index], &mut self.state, now);
                } else if pipeline.contains(StepPipeline::GUIDE) && !already_guiding {
                    self.process
                        .start_guiding(&mut self.jobs[index], &mut self.state, now, false);
                } else {
                    self.process
                        .start_capture(&mut self.jobs[index], &mut self.state, now);
                }
            }
            JobStage::AlignComplete => {
                // Re-slew to the solved position before anything else.
                self.process
                    .start_slew(&mut self.jobs[index], &mut self.state, now);
            }
            JobStage::ReslewComplete => {
                if self.jobs[index].in_sequence_focus
                    && pipeline.contains(StepPipeline::FOCUS)
                {
                    self.process
                        .start_focusing(&mut self.jobs[index], &mut self.state, now);
                } else if pipeline.contains(StepPipeline::GUIDE) && !already_guiding {
                    self.process
                        .start_guiding(&mut self.jobs[index], &mut self.state, now, false);
                } else {
                    self.process
                        .start_capture(&mut self.jobs[index], &mut self.state, now);
                }
            }
            JobStage::PostalignFocusComplete => {
                if pipeline.contains(StepPipeline::GUIDE) && !already_guiding {
                    self.process
                        .start_guiding(&mut self.jobs[index], &mut self.state, now, false);
                } else {
                    self.process
                        .start_capture(&mut self.jobs[index], &mut self.state, now);
                }
            }
            JobStage::GuideComplete => {
                self.process
                    .start_capture(&mut self.jobs[index], &mut self.state, now);
            }
            // In-flight stages wait for their completion notification.
            _ => {}
        }
    }

    /// Decide what follows the active job: another batch, completion, a
    /// retry, or a fresh evaluation.
    fn find_next_job(&mut self, now: DateTime<Utc>) {
        if self.state.scheduler_state == SchedulerState::Paused {
            self.set_paused();
            return;
        }

        self.state.reset_failure_counters();
        self.state.guiding_restart_at = None;

        let Some(index) = self.active_index() else {
            self.state
                .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            return;
        };

        match self.jobs[index].status {
            JobStatus::Error | JobStatus::Aborted => {
                self.state.captured_frames_valid = false;
                self.state.active_job = None;

                let restartable = self.jobs[index].status == JobStatus::Aborted
                    || self.options.reschedule_errors;
                if self.options.error_handling == ErrorHandlingStrategy::RestartImmediately
                    && restartable
                {
                    let retry = Duration::seconds(self.options.retry_delay_secs);
                    let job = &mut self.jobs[index];
                    job.status = JobStatus::Scheduled;
                    job.stage = JobStage::Idle;
                    job.startup_time = Some(now + retry);
                    self.log.info(format!(
                        "Job '{}' will be restarted in {} seconds.",
                        job.name, self.options.retry_delay_secs
                    ));
                    self.state.setup_next_iteration(
                        TimerState::Wakeup,
                        (self.options.retry_delay_secs * 1000).max(self.update_ms()),
                    );
                } else {
                    self.state
                        .setup_next_iteration(TimerState::Scheduler, self.update_ms());
                }
            }
            JobStatus::Idle => {
                // Stopped mid-run; hand the decision back to evaluation.
                self.state.active_job = None;
                self.state
                    .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            }
            JobStatus::Busy => self.continue_or_complete_job(index, now),
            other => {
                warn!(status = %other, "active job in unexpected state, re-evaluating");
                self.state.active_job = None;
                self.state
                    .setup_next_iteration(TimerState::Scheduler, self.update_ms());
            }
        }
    }

    /// The active job finished a capture batch; apply its completion
    /// condition.
    fn continue_or_complete_job(&mut self, index: usize, now: DateTime<Utc>) {
        let completion = self.jobs[index].completion;
        match completion {
            CompletionCondition::FinishSequence => self.mark_job_complete(index),
            CompletionCondition::FinishRepeat(_) => {
                if self.jobs[index].repeats_remaining <= 1 {
                    self.jobs[index].repeats_remaining = 0;
                    self.mark_job_complete(index);
                } else {
                    let job = &mut self.jobs[index];
                    job.repeats_remaining -= 1;
                    job.completed_iterations += 1;
                    let remaining = job.repeats_remaining;
                    self.log.info(format!(
                        "Job '{}' completed a batch, {remaining} repeats remaining.",
                        job.name
                    ));
                    self.start_next_batch(index, now);
                }
            }
            CompletionCondition::FinishLoop => {
                self.jobs[index].completed_iterations += 1;
                self.log.info(format!(
                    "Job '{}' completed a batch and loops indefinitely.",
                    self.jobs[index].name
                ));
                self.start_next_batch(index, now);
            }
            CompletionCondition::FinishAt(deadline) => {
                if now >= deadline {
                    self.mark_job_complete(index);
                } else {
                    self.jobs[index].completed_iterations += 1;
                    self.start_next_batch(index, now);
                }
            }
        }
    }

    fn mark_job_complete(&mut self, index: usize) {
        let job = &mut self.jobs[index];
        job.completed_iterations += 1;
        job.status = JobStatus::Complete;
        job.stage = JobStage::Idle;
        self.log
            .success(format!("Job '{}' is complete.", job.name));
        info!(job = %job.name, "job complete");
        if can_count_captures(&self.jobs[index]) {
            // Stored frames changed; the next evaluation must re-count them.
            self.state.captured_frames_valid = false;
        }

        // With progress counting enabled, completion is verified against
        // stored frames: the job and any duplicates of it go back through
        // evaluation, which re-completes them from the frame counts.
        if self.options.remember_job_progress && can_count_captures(&self.jobs[index]) {
            let id = self.jobs[index].id;
            let name = self.jobs[index].name.clone();
            let file = self.jobs[index].sequence.file.clone();
            for job in &mut self.jobs {
                if job.id == id || (job.name == name && job.sequence.file == file) {
                    job.status = JobStatus::Idle;
                    job.stage = JobStage::Idle;
                }
            }
        }

        self.state.active_job = None;
        self.state
            .setup_next_iteration(TimerState::Scheduler, self.update_ms());
    }

    /// Re-issue the capture batch, redoing the preparation pipeline only
    /// when a per-batch realign is requested.
    fn start_next_batch(&mut self, index: usize, now: DateTime<Utc>) {
        self.state.capture_batch += 1;
        self.state.captured_frames_valid = false;
        if self.options.force_realign_per_batch {
            self.jobs[index].stage = JobStage::Idle;
            self.get_next_action(now);
        } else {
            self.process
                .start_capture(&mut self.jobs[index], &mut self.state, now);
        }
        self.state
            .setup_next_iteration(TimerState::JobCheck, self.update_ms());
    }

    /// Tear down whatever the active job's current stage started.
    fn stop_current_job_action(&mut self, _now: DateTime<Utc>) {
        let Some(index) = self.active_index() else {
            return;
        };
        let job = &mut self.jobs[index];
        debug!(job = %job.name, stage = %job.stage, "stopping current job action");
        match job.stage {
            JobStage::Slewing | JobStage::Reslewing => self.process.devices().mount.abort(),
            JobStage::Focusing | JobStage::PostalignFocusing => {
                self.process.devices().focuser.abort()
            }
            JobStage::Aligning => self.process.devices().aligner.abort(),
            JobStage::Capturing => {
                if let Err(err) = self.process.devices().camera.abort() {
                    warn!(%err, "capture abort failed");
                    self.log
                        .error(format!("Failed to abort capture: {err}"));
                }
            }
            _ => {}
        }
        job.stage = JobStage::Idle;
        self.process.stop_guiding(&mut self.state);
    }

    fn abort_active_job(&mut self, now: DateTime<Utc>, reason: &str) {
        self.fail_active_job(now, JobStatus::Aborted, reason);
    }

    fn fail_active_job(&mut self, now: DateTime<Utc>, status: JobStatus, reason: &str) {
        let Some(index) = self.active_index() else {
            return;
        };
        self.stop_current_job_action(now);
        let job = &mut self.jobs[index];
        job.status = status;
        job.stop_reason = reason.into();
        self.log
            .error(format!("Job '{}' stopped: {reason}.", job.name));
        warn!(job = %job.name, %status, reason, "job stopped");
        self.find_next_job(now);
    }

    // --- device notifications ----------------------------------------------

    pub fn handle_device_event(&mut self, event: DeviceEvent, now: DateTime<Utc>) {
        match event {
            DeviceEvent::Mount(status) => self.handle_mount_status(status, now),
            DeviceEvent::Focus(status) => self.handle_focus_status(status, now),
            DeviceEvent::Align(status) => self.handle_align_status(status, now),
            DeviceEvent::Guide(status) => self.handle_guide_status(status, now),
            DeviceEvent::Capture(status) => self.handle_capture_status(status, now),
            DeviceEvent::Weather(status) => self.handle_weather_status(status, now),
            DeviceEvent::DomeMoving(_) | DeviceEvent::DustCoverParked(_) => {
                // Polled by the startup/shutdown procedures and the epilogue.
            }
            DeviceEvent::HubReady(ready) => {
                self.state.hub_state = if ready {
                    CommStatus::Success
                } else {
                    CommStatus::Error
                };
            }
            DeviceEvent::LinksReady(ready) => {
                self.state.links_state = if ready {
                    CommStatus::Success
                } else {
                    CommStatus::Error
                };
            }
            DeviceEvent::StartupScriptFinished { success } => {
                self.process.startup_script_finished(&mut self.state, success);
            }
            DeviceEvent::ShutdownScriptFinished { success } => {
                self.process.shutdown_script_finished(&mut self.state, success);
            }
            DeviceEvent::SolverDone(result) => self.handle_solver_done(result),
        }
    }

    fn handle_mount_status(&mut self, status: MountStatus, now: DateTime<Utc>) {
        let Some(index) = self.active_index() else {
            return;
        };
        if !matches!(
            self.jobs[index].stage,
            JobStage::Slewing | JobStage::Reslewing
        ) {
            return;
        }
        match status {
            MountStatus::Tracking => {
                let job = &mut self.jobs[index];
                job.stage = if job.stage == JobStage::Reslewing {
                    JobStage::ReslewComplete
                } else {
                    JobStage::SlewComplete
                };
                self.log
                    .info(format!("Job '{}' slew is complete.", job.name));
                self.state.start_current_operation_timer(now);
            }
            MountStatus::Error => {
                self.fail_active_job(now, JobStatus::Error, "mount failed while slewing");
            }
            _ => {}
        }
    }

    fn handle_focus_status(&mut self, status: FocusStatus, now: DateTime<Utc>) {
        let Some(index) = self.active_index() else {
            return;
        };
        if !matches!(
            self.jobs[index].stage,
            JobStage::Focusing | JobStage::PostalignFocusing
        ) {
            return;
        }
        match status {
            FocusStatus::Complete => {
                {
                    let job = &mut self.jobs[index];
                    job.stage = if job.stage == JobStage::PostalignFocusing {
                        JobStage::PostalignFocusComplete
                    } else {
                        JobStage::FocusComplete
                    };
                    self.log
                        .info(format!("Job '{}' focusing is complete.", job.name));
                }
                self.state.autofocus_completed = true;
                self.state.start_current_operation_timer(now);
                self.get_next_action(now);
            }
            FocusStatus::Failed | FocusStatus::Aborted => {
                self.log.warning(format!(
                    "Job '{}' focusing failed.",
                    self.jobs[index].name
                ));
                if self.state.increase_focus_failure_count() {
                    self.process
                        .start_focusing(&mut self.jobs[index], &mut self.state, now);
                } else {
                    self.abort_active_job(now, "focusing failed repeatedly");
                }
            }
            _ => {}
        }
    }

    fn handle_align_status(&mut self, status: AlignStatus, now: DateTime<Utc>) {
        let Some(index) = self.active_index() else {
            return;
        };
        if self.jobs[index].stage != JobStage::Aligning {
            return;
        }
        match status {
            AlignStatus::Complete => {
                self.jobs[index].stage = JobStage::AlignComplete;
                self.log.info(format!(
                    "Job '{}' alignment is complete.",
                    self.jobs[index].name
                ));
                self.state.start_current_operation_timer(now);
                self.get_next_action(now);
            }
            AlignStatus::Failed | AlignStatus::Aborted => {
                self.log.warning(format!(
                    "Job '{}' alignment failed.",
                    self.jobs[index].name
                ));
                if self.state.increase_align_failure_count() {
                    self.process
                        .start_astrometry(&mut self.jobs[index], &mut self.state, now);
                } else {
                    self.abort_active_job(now, "alignment failed repeatedly");
                }
            }
            _ => {}
        }
    }

    fn handle_guide_status(&mut self, status: GuideStatus, now: DateTime<Utc>) {
        let Some(index) = self.active_index() else {
            return;
        };
        match self.jobs[index].stage {
            JobStage::Guiding => match status {
                GuideStatus::Guiding => {
                    self.jobs[index].stage = JobStage::GuideComplete;
                    self.log.info(format!(
                        "Job '{}' guiding is in progress.",
                        self.jobs[index].name
                    ));
                    self.state.start_current_operation_timer(now);
                    self.get_next_action(now);
                }
                GuideStatus::Aborted | GuideStatus::CalibrationFailed => {
                    self.log.warning(format!(
                        "Job '{}' guiding failed.",
                        self.jobs[index].name
                    ));
                    if self.state.increase_guide_failure_count() {
                        // Leave a settling delay before the guider retries.
                        self.state.guiding_restart_at = Some(
                            now + Duration::seconds(
                                self.options.restart_guiding_delay_secs as i64,
                            ),
                        );
                    } else {
                        self.abort_active_job(now, "guiding failed repeatedly");
                    }
                }
                _ => {}
            },
            JobStage::Capturing => {
                // A guiding drop under a running capture compromises the
                // frames being taken; it counts against the capture.
                if matches!(
                    status,
                    GuideStatus::Aborted | GuideStatus::CalibrationFailed
                ) {
                    self.log.warning(format!(
                        "Job '{}' guiding was lost during capture, recalibrating.",
                        self.jobs[index].name
                    ));
                    if self.state.increase_capture_failure_count() {
                        self.process
                            .start_guiding(&mut self.jobs[index], &mut self.state, now, true);
                    } else {
                        self.abort_active_job(now, "guiding lost during capture repeatedly");
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_capture_status(&mut self, status: CaptureStatus, now: DateTime<Utc>) {
        let Some(index) = self.active_index() else {
            return;
        };
        if self.jobs[index].stage != JobStage::Capturing {
            return;
        }
        match status {
            CaptureStatus::Complete => {
                self.log.info(format!(
                    "Job '{}' capture batch is complete.",
                    self.jobs[index].name
                ));
                self.state.captured_frames_valid = false;
                self.find_next_job(now);
            }
            CaptureStatus::Aborted => {
                self.log.warning(format!(
                    "Job '{}' capture was aborted.",
                    self.jobs[index].name
                ));
                if self.state.increase_capture_failure_count() {
                    self.process
                        .start_capture(&mut self.jobs[index], &mut self.state, now);
                } else {
                    self.abort_active_job(now, "capture failed repeatedly");
                }
            }
            CaptureStatus::InProgress | CaptureStatus::ImageReceived => {
                // Progress resets the inactivity clock.
                self.state.start_current_operation_timer(now);
            }
            _ => {}
        }
    }

    fn handle_solver_done(&mut self, result: SolverResult) {
        let Some(id) = self.state.solver_job.take() else {
            return;
        };
        let Some(index) = self.jobs.iter().position(|j| j.id == id) else {
            return;
        };
        let job = &mut self.jobs[index];
        match result.solution {
            Some(coords) if result.success => {
                job.target = coords;
                job.fits_solved = true;
                self.log.info(format!(
                    "Job '{}' target coordinates solved.",
                    job.name
                ));
                debug!(job = %job.name, elapsed = result.elapsed_secs, "plate solve finished");
            }
            _ => {
                job.status = JobStatus::Invalid;
                self.log.error(format!(
                    "Job '{}' reference frame did not solve{}, marking invalid.",
                    job.name,
                    if result.timed_out { " in time" } else { "" }
                ));
            }
        }
    }

    fn handle_weather_status(&mut self, status: WeatherStatus, now: DateTime<Utc>) {
        let previous = self.state.weather_status;
        self.state.weather_status = status;
        if previous == status {
            return;
        }
        match status {
            WeatherStatus::Warning => {
                self.log.warning("Weather conditions are degrading.");
            }
            WeatherStatus::Alert => {
                if matches!(
                    self.state.scheduler_state,
                    SchedulerState::Running | SchedulerState::Shutdown
                ) {
                    self.log
                        .warning("Weather alert received, shutting the observatory down.");
                    if let Some(index) = self.active_index() {
                        self.stop_current_job_action(now);
                        let job = &mut self.jobs[index];
                        if job.constraints.enforce_weather {
                            job.status = JobStatus::Aborted;
                            job.stop_reason = "weather alert".into();
                        } else {
                            // Back to the queue; it runs again once the
                            // observatory reopens.
                            job.status = JobStatus::Idle;
                        }
                        self.state.active_job = None;
                    }
                    if self.state.scheduler_state == SchedulerState::Running {
                        self.start_shutdown(now);
                    }
                }
            }
            WeatherStatus::Ok => {
                self.log.info("Weather conditions are back to normal.");
            }
        }
    }

    // --- async control loop ------------------------------------------------

    /// Drive the scheduler until a stop command arrives or the command
    /// channel closes.
    pub async fn run(
        &mut self,
        mut events: UnboundedReceiver<DeviceEvent>,
        mut commands: UnboundedReceiver<SchedulerCommand>,
    ) {
        loop {
            let interval = self.state.timer_interval_ms();
            let armed = self.state.timer_state() != TimerState::Nothing && interval >= 0;

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(interval.max(0) as u64)), if armed => {
                    self.run_scheduler_iteration(Utc::now());
                    // The session wound itself down; nothing left to drive.
                    if self.state.scheduler_state == SchedulerState::Idle
                        && self.state.timer_state() == TimerState::Nothing
                    {
                        break;
                    }
                }
                event = events.recv() => {
                    if let Some(event) = event {
                        self.handle_device_event(event, Utc::now());
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(SchedulerCommand::Start) => self.execute(Utc::now()),
                        Some(SchedulerCommand::Pause) => self.pause(),
                        Some(SchedulerCommand::Resume) => self.resume(Utc::now()),
                        Some(SchedulerCommand::WakeUp) => self.wake_up_scheduler(Utc::now()),
                        Some(SchedulerCommand::Stop) | None => {
                            self.stop(Utc::now());
                            break;
                        }
                    }
                }
            }
        }
    }
}

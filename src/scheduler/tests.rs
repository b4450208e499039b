//! End-to-end scheduler tests over the simulated observatory.
//!
//! With a zero event delay every device command acknowledges synchronously,
//! so a test advances the scheduler by running iterations and draining the
//! event channel in between. Time is injected, never read from the clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::config::{ErrorHandlingStrategy, SchedulerOptions};
use crate::devices::sim::SimObservatory;
use crate::devices::{DeviceEvent, GuideStatus, Hub, Mount, MountStatus, WeatherStatus};
use crate::ephemeris::Ephemeris;
use crate::error::DeviceError;
use crate::models::{
    CaptureSignature, CompletionCondition, FrameSet, JobStage, JobStatus, SchedulerJob,
    SequenceSummary, StartCondition, StepPipeline, TargetCoordinates, UploadMode,
};
use crate::services::EventLog;

use super::module_state::{SchedulerState, ShutdownState, StartupState, TimerState};
use super::Scheduler;

/// Constant sky conditions. Removes astronomy from the tests.
struct FlatSky {
    altitude_deg: f64,
    moon_separation_deg: f64,
    dark: bool,
}

impl FlatSky {
    /// Clear dark night with the Moon far away.
    fn clear(altitude_deg: f64) -> Self {
        Self {
            altitude_deg,
            moon_separation_deg: 120.0,
            dark: true,
        }
    }
}

impl Ephemeris for FlatSky {
    fn find_altitude(&self, _target: &TargetCoordinates, _t: DateTime<Utc>) -> (f64, bool) {
        (self.altitude_deg, false)
    }

    fn moon_separation(&self, _target: &TargetCoordinates, _t: DateTime<Utc>) -> f64 {
        self.moon_separation_deg
    }

    fn dawn_dusk(&self, t: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        if self.dark {
            (t + Duration::hours(1), t + Duration::hours(13))
        } else {
            (t + Duration::hours(13), t + Duration::hours(1))
        }
    }
}

struct Harness {
    scheduler: Scheduler,
    observatory: SimObservatory,
    events: UnboundedReceiver<DeviceEvent>,
    now: DateTime<Utc>,
}

impl Harness {
    fn new(options: SchedulerOptions, altitude_deg: f64) -> Self {
        Self::with_sky(options, FlatSky::clear(altitude_deg))
    }

    fn with_sky(options: SchedulerOptions, sky: FlatSky) -> Self {
        let (tx, events) = unbounded_channel();
        let observatory = SimObservatory::new(tx, std::time::Duration::ZERO);
        let scheduler = Scheduler::new(
            options,
            observatory.device_set(),
            Arc::new(sky),
            EventLog::new(),
        );
        Self {
            scheduler,
            observatory,
            events,
            now: Utc.with_ymd_and_hms(2026, 3, 1, 22, 0, 0).unwrap(),
        }
    }

    fn advance(&mut self, secs: i64) {
        self.now += Duration::seconds(secs);
    }

    /// Deliver pending device notifications, bounded against loop jobs that
    /// re-issue work forever.
    fn pump(&mut self) {
        for _ in 0..64 {
            match self.events.try_recv() {
                Ok(event) => self.scheduler.handle_device_event(event, self.now),
                Err(_) => break,
            }
        }
    }

    fn step(&mut self, iterations: usize) {
        for _ in 0..iterations {
            self.scheduler.run_scheduler_iteration(self.now);
            self.pump();
        }
    }

    fn busy_count(&self) -> usize {
        self.scheduler
            .jobs()
            .iter()
            .filter(|j| j.status == JobStatus::Busy)
            .count()
    }
}

fn sequence(file: &str, count: u32) -> SequenceSummary {
    SequenceSummary {
        file: file.into(),
        framesets: vec![FrameSet {
            signature: CaptureSignature::new("T", "L", "Light"),
            count,
            exposure_secs: 60.0,
            upload: UploadMode::Client,
        }],
    }
}

fn make_job(name: &str, pipeline: StepPipeline) -> SchedulerJob {
    let mut job = SchedulerJob::new(
        name,
        TargetCoordinates::new(120.0, 45.0),
        sequence(&format!("{name}.esq"), 5),
    );
    job.pipeline = pipeline;
    job.constraints.min_altitude_deg = 30.0;
    job
}

#[test]
fn test_full_pipeline_runs_to_completion() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    h.scheduler.set_jobs(vec![make_job("M31", StepPipeline::all())]);
    h.scheduler.execute(h.now);
    h.step(12);

    let job = &h.scheduler.jobs()[0];
    assert_eq!(job.status, JobStatus::Complete, "log: {:?}", h.scheduler.log().snapshot());
    assert_eq!(*h.observatory.focuser.focus_count.lock(), 1);
    assert_eq!(*h.observatory.aligner.align_count.lock(), 1);
    // Initial slew plus the post-align re-slew.
    assert_eq!(*h.observatory.mount.slew_count.lock(), 2);
    assert_eq!(*h.observatory.camera.capture_count.lock(), 1);
    assert!(h.scheduler.module_state().active_job.is_none());
}

#[test]
fn test_startup_script_runs_before_hub_start() {
    let options = SchedulerOptions {
        startup_script: Some("/opt/obs/startup.sh".into()),
        ..SchedulerOptions::default()
    };
    let mut h = Harness::new(options, 60.0);
    h.scheduler.set_jobs(vec![make_job("M31", StepPipeline::empty())]);
    h.scheduler.execute(h.now);

    // Withhold the script-finished notification: the gate must hold in the
    // script phase with the hub still down, since the script is what powers
    // the equipment on.
    for _ in 0..3 {
        h.scheduler.run_scheduler_iteration(h.now);
    }
    assert_eq!(
        h.scheduler.module_state().startup_state,
        StartupState::Script
    );
    assert!(!h.observatory.hub.is_ready());
    assert!(h.scheduler.log().contains("Running startup script"));

    // Deliver it; hub, links and unparking follow and the job runs.
    h.pump();
    h.step(8);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Complete);
}

#[test]
fn test_at_most_one_job_busy() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    h.scheduler.set_jobs(vec![
        make_job("A", StepPipeline::all()),
        make_job("B", StepPipeline::all()),
        make_job("C", StepPipeline::empty()),
    ]);
    h.scheduler.execute(h.now);
    for _ in 0..30 {
        h.step(1);
        assert!(h.busy_count() <= 1, "more than one busy job");
    }
}

#[test]
fn test_unreachable_altitude_marks_job_invalid() {
    // Sky pinned at 5 degrees against a 30 degree floor: never feasible.
    let mut h = Harness::new(SchedulerOptions::default(), 5.0);
    h.scheduler.set_jobs(vec![make_job("low", StepPipeline::all())]);
    h.scheduler.execute(h.now);
    h.step(3);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Invalid);
    // Nothing left to run: the session winds down.
    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Shutdown
    );
}

#[test]
fn test_moon_separation_constraint_marks_job_invalid() {
    let sky = FlatSky {
        moon_separation_deg: 20.0,
        ..FlatSky::clear(60.0)
    };
    let mut h = Harness::with_sky(SchedulerOptions::default(), sky);
    let mut job = make_job("near-moon", StepPipeline::empty());
    job.constraints.min_moon_separation_deg = Some(40.0);
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(3);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Invalid);
    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Shutdown
    );
}

#[test]
fn test_twilight_enforcement_rejects_daylight_run() {
    let sky = FlatSky {
        dark: false,
        ..FlatSky::clear(60.0)
    };
    let mut h = Harness::with_sky(SchedulerOptions::default(), sky);
    // Twilight is enforced by default; a bright sky blocks the whole window.
    h.scheduler.set_jobs(vec![make_job("day", StepPipeline::empty())]);
    h.scheduler.execute(h.now);
    h.step(3);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Invalid);
    assert_eq!(*h.observatory.camera.capture_count.lock(), 0);
}

#[test]
fn test_empty_queue_initiates_shutdown_and_finishes() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    h.scheduler.execute(h.now);
    h.step(10);

    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Idle
    );
    assert_eq!(
        h.scheduler.module_state().shutdown_state,
        ShutdownState::Complete
    );
    assert_eq!(h.scheduler.module_state().timer_state(), TimerState::Nothing);
    assert!(h.scheduler.log().contains("Scheduler finished"));
}

#[test]
fn test_focus_timeout_retries_then_aborts() {
    let options = SchedulerOptions {
        max_failure_attempts: 2,
        ..SchedulerOptions::default()
    };
    let mut h = Harness::new(options, 60.0);
    h.scheduler.set_jobs(vec![make_job("stall", StepPipeline::FOCUS)]);
    *h.observatory.focuser.stalled.lock() = true;
    h.scheduler.execute(h.now);
    h.step(8);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Busy);
    assert_eq!(h.scheduler.jobs()[0].stage, JobStage::Focusing);
    assert_eq!(*h.observatory.focuser.focus_count.lock(), 1);

    // Attempts 1 and 2 restart the stage after each timeout.
    h.advance(121);
    h.step(1);
    assert_eq!(*h.observatory.focuser.focus_count.lock(), 2);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Busy);

    h.advance(121);
    h.step(1);
    assert_eq!(*h.observatory.focuser.focus_count.lock(), 3);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Busy);

    // The third timeout exceeds the ceiling and aborts the job.
    h.advance(121);
    h.step(1);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Aborted);
    assert!(h.scheduler.module_state().active_job.is_none());
}

#[test]
fn test_finish_repeat_counts_down_batches() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("rep", StepPipeline::empty());
    job.completion = CompletionCondition::FinishRepeat(3);
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(10);

    let job = &h.scheduler.jobs()[0];
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.repeats_remaining, 0);
    assert_eq!(job.completed_iterations, 3);
    assert_eq!(*h.observatory.camera.capture_count.lock(), 3);
}

#[test]
fn test_finish_loop_keeps_reissuing_batches() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("loop", StepPipeline::empty());
    job.completion = CompletionCondition::FinishLoop;
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(8);

    let job = &h.scheduler.jobs()[0];
    assert_eq!(job.status, JobStatus::Busy, "a loop job never completes");
    assert!(job.completed_iterations >= 2);
    assert!(*h.observatory.camera.capture_count.lock() >= 2);
    assert!(h.scheduler.module_state().capture_batch >= 1);
}

#[test]
fn test_finish_at_completes_past_deadline() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("until", StepPipeline::empty());
    job.completion = CompletionCondition::FinishAt(h.now + Duration::minutes(1));
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(6);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Busy);

    h.advance(120);
    h.step(4);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Complete);
}

#[test]
fn test_asap_job_preferred_over_distant_fixed_start() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let a = make_job("A", StepPipeline::empty());
    let mut b = make_job("B", StepPipeline::empty());
    b.start_condition = StartCondition::At(h.now + Duration::hours(2));
    h.scheduler.set_jobs(vec![b, a]);
    h.scheduler.execute(h.now);
    h.step(8);

    // A runs first even though B appears earlier in the queue.
    let a = h.scheduler.jobs().iter().find(|j| j.name == "A").unwrap();
    let b = h.scheduler.jobs().iter().find(|j| j.name == "B").unwrap();
    assert_eq!(a.status, JobStatus::Complete);
    assert_ne!(b.status, JobStatus::Complete);
}

#[test]
fn test_distant_job_puts_scheduler_to_sleep() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("later", StepPipeline::empty());
    job.start_condition = StartCondition::At(h.now + Duration::hours(2));
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(1);

    assert_eq!(h.scheduler.module_state().timer_state(), TimerState::Wakeup);
    // Sleeps until lead time before the startup, not until the startup.
    let interval = h.scheduler.module_state().timer_interval_ms();
    let lead_ms = h.scheduler.options().lead_time_secs * 1000;
    assert!(interval > 0 && interval <= 2 * 3600 * 1000 - lead_ms);
    assert!(h.scheduler.log().contains("going to sleep"));
}

#[test]
fn test_sleep_can_park_the_mount_first() {
    let options = SchedulerOptions {
        park_mount_while_sleeping: true,
        ..SchedulerOptions::default()
    };
    let mut h = Harness::new(options, 60.0);
    let mut job = make_job("later", StepPipeline::empty());
    job.start_condition = StartCondition::At(h.now + Duration::hours(2));
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    // Park request, park-wait progression, then sleep.
    h.step(4);

    assert_eq!(h.observatory.mount.status(), Some(MountStatus::Parked));
    assert_eq!(h.scheduler.module_state().timer_state(), TimerState::Wakeup);
    assert!(h.scheduler.log().contains("Parking the mount"));
}

#[test]
fn test_preemptive_shutdown_parks_sleeps_and_wakes() {
    let options = SchedulerOptions {
        preemptive_shutdown: true,
        preemptive_shutdown_secs: 600,
        ..SchedulerOptions::default()
    };
    let lead_secs = options.lead_time_secs;
    let mut h = Harness::new(options, 60.0);
    let mut job = make_job("later", StepPipeline::empty());
    job.start_condition = StartCondition::At(h.now + Duration::hours(2));
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    // Sleep decision, then the shutdown procedure runs to its end.
    h.step(4);

    assert!(h.scheduler.log().contains("parking the observatory"));
    assert_eq!(h.observatory.mount.status(), Some(MountStatus::Parked));
    assert!(h.scheduler.module_state().preemptive_shutdown);
    assert_eq!(h.scheduler.module_state().timer_state(), TimerState::Wakeup);

    // The wakeup fires at lead time before the startup and re-opens the
    // observatory.
    h.advance(7200 - lead_secs);
    h.step(1);
    assert!(!h.scheduler.module_state().preemptive_shutdown);
    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Running
    );

    h.advance(lead_secs);
    h.step(10);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Complete);
}

#[test]
fn test_better_immediate_candidate_preempts_active_job() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut a = make_job("A", StepPipeline::empty());
    a.completion = CompletionCondition::FinishLoop;
    a.constraints.min_altitude_deg = 50.0;
    h.scheduler.set_jobs(vec![a]);
    h.scheduler.execute(h.now);
    h.step(6);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Busy);

    // A new candidate with a much larger altitude margin, startable right
    // now: the next job check interrupts the active job for it.
    let mut b = make_job("B", StepPipeline::empty());
    b.completion = CompletionCondition::FinishLoop;
    b.constraints.min_altitude_deg = 0.0;
    b.status = JobStatus::Scheduled;
    b.startup_time = Some(h.now);
    h.scheduler.jobs_mut().push(b);
    h.step(2);

    let a = h.scheduler.jobs().iter().find(|j| j.name == "A").unwrap();
    let b = h.scheduler.jobs().iter().find(|j| j.name == "B").unwrap();
    assert_eq!(b.status, JobStatus::Busy);
    assert_ne!(a.status, JobStatus::Busy);
}

#[test]
fn test_guide_loss_during_capture_recalibrates() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("cap", StepPipeline::GUIDE);
    job.completion = CompletionCondition::FinishLoop;
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(6);
    assert_eq!(h.scheduler.jobs()[0].stage, JobStage::Capturing);

    let recalibrations_before = *h.observatory.guider.recalibrations.lock();
    h.scheduler
        .handle_device_event(DeviceEvent::Guide(GuideStatus::Aborted), h.now);

    // The capture keeps going; guiding restarts with a fresh calibration.
    assert_eq!(h.scheduler.jobs()[0].stage, JobStage::Capturing);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Busy);
    assert_eq!(
        *h.observatory.guider.recalibrations.lock(),
        recalibrations_before + 1
    );
    assert_eq!(h.scheduler.module_state().failures().capture, 1);
}

#[test]
fn test_repeated_guide_loss_during_capture_aborts() {
    let options = SchedulerOptions {
        max_failure_attempts: 1,
        ..SchedulerOptions::default()
    };
    let mut h = Harness::new(options, 60.0);
    let mut job = make_job("cap", StepPipeline::GUIDE);
    job.completion = CompletionCondition::FinishLoop;
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(6);
    assert_eq!(h.scheduler.jobs()[0].stage, JobStage::Capturing);

    h.scheduler
        .handle_device_event(DeviceEvent::Guide(GuideStatus::Aborted), h.now);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Busy);
    h.scheduler
        .handle_device_event(DeviceEvent::Guide(GuideStatus::Aborted), h.now);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Aborted);
    assert!(*h.observatory.camera.abort_count.lock() >= 1);
}

#[test]
fn test_weather_alert_aborts_job_and_shuts_down() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("wx", StepPipeline::empty());
    job.completion = CompletionCondition::FinishLoop;
    job.constraints.enforce_weather = true;
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(6);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Busy);

    h.scheduler
        .handle_device_event(DeviceEvent::Weather(WeatherStatus::Alert), h.now);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Aborted);
    assert_eq!(h.scheduler.jobs()[0].stop_reason, "weather alert");
    assert!(h.scheduler.module_state().active_job.is_none());
    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Shutdown
    );
    assert_eq!(h.scheduler.module_state().timer_state(), TimerState::Shutdown);
}

#[test]
fn test_weather_alert_spares_job_without_enforcement() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("wx", StepPipeline::empty());
    job.completion = CompletionCondition::FinishLoop;
    job.constraints.enforce_weather = false;
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(6);

    h.scheduler
        .handle_device_event(DeviceEvent::Weather(WeatherStatus::Alert), h.now);

    // The observatory still closes, but the job stays eligible.
    assert_ne!(h.scheduler.jobs()[0].status, JobStatus::Aborted);
    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Shutdown
    );
}

#[test]
fn test_aborted_jobs_are_rescheduled_by_queue_strategy() {
    let options = SchedulerOptions {
        max_failure_attempts: 0,
        error_handling: ErrorHandlingStrategy::RestartAfterQueue,
        ..SchedulerOptions::default()
    };
    let mut h = Harness::new(options, 60.0);
    h.scheduler.set_jobs(vec![make_job("flaky", StepPipeline::FOCUS)]);
    *h.observatory.focuser.stalled.lock() = true;
    h.scheduler.execute(h.now);
    h.step(8);
    h.advance(121);
    h.step(1);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Aborted);

    // The next evaluation finds only an aborted job and re-queues it.
    h.step(1);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Idle);
    assert!(h.scheduler.log().contains("rescheduling"));
}

#[test]
fn test_dont_restart_strategy_leaves_aborted_jobs() {
    let options = SchedulerOptions {
        max_failure_attempts: 0,
        error_handling: ErrorHandlingStrategy::DontRestart,
        ..SchedulerOptions::default()
    };
    let mut h = Harness::new(options, 60.0);
    h.scheduler.set_jobs(vec![make_job("flaky", StepPipeline::FOCUS)]);
    *h.observatory.focuser.stalled.lock() = true;
    h.scheduler.execute(h.now);
    h.step(8);
    h.advance(121);
    h.step(3);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Aborted);
    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Shutdown
    );
}

#[test]
fn test_immediate_restart_arms_retry_timer() {
    let options = SchedulerOptions {
        max_failure_attempts: 0,
        error_handling: ErrorHandlingStrategy::RestartImmediately,
        retry_delay_secs: 30,
        ..SchedulerOptions::default()
    };
    let mut h = Harness::new(options, 60.0);
    h.scheduler.set_jobs(vec![make_job("flaky", StepPipeline::FOCUS)]);
    *h.observatory.focuser.stalled.lock() = true;
    h.scheduler.execute(h.now);
    h.step(8);
    h.advance(121);
    h.step(1);

    let job = &h.scheduler.jobs()[0];
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.startup_time, Some(h.now + Duration::seconds(30)));
    assert_eq!(h.scheduler.module_state().timer_state(), TimerState::Wakeup);
    assert_eq!(h.scheduler.module_state().timer_interval_ms(), 30_000);
}

#[test]
fn test_repeat_all_restarts_completed_queue() {
    let options = SchedulerOptions {
        repeat_all: true,
        ..SchedulerOptions::default()
    };
    let mut h = Harness::new(options, 60.0);
    h.scheduler.set_jobs(vec![make_job("again", StepPipeline::empty())]);
    h.scheduler.execute(h.now);
    h.step(8);

    // The job completed at least once and was reset for another pass.
    assert!(*h.observatory.camera.capture_count.lock() >= 1);
    assert!(h.scheduler.log().contains("restarting the queue"));
    assert_ne!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Shutdown
    );
}

#[test]
fn test_pause_parks_the_loop_and_resume_rearms_it() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("p", StepPipeline::empty());
    job.completion = CompletionCondition::FinishLoop;
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(3);

    h.scheduler.pause();
    h.step(3);
    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Paused
    );

    h.scheduler.resume(h.now);
    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Running
    );
    assert_eq!(
        h.scheduler.module_state().timer_state(),
        TimerState::Scheduler
    );
}

#[test]
fn test_stop_aborts_the_active_job() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("s", StepPipeline::empty());
    job.completion = CompletionCondition::FinishLoop;
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(6);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Busy);

    h.scheduler.stop(h.now);
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Aborted);
    assert_eq!(h.scheduler.jobs()[0].stop_reason, "scheduler stopped");
    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Idle
    );
}

#[test]
fn test_failed_capture_abort_is_logged() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("cap", StepPipeline::empty());
    job.completion = CompletionCondition::FinishLoop;
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(6);
    assert_eq!(h.scheduler.jobs()[0].stage, JobStage::Capturing);

    *h.observatory.camera.abort_error.lock() = Some(DeviceError::Rejected {
        family: "camera",
        reason: "exposure download in progress".into(),
    });
    h.scheduler.stop(h.now);

    // The teardown failure is surfaced but does not wedge the stop.
    assert!(h.scheduler.log().contains("Failed to abort capture"));
    assert!(h.scheduler.log().contains("exposure download in progress"));
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Aborted);
    assert_eq!(
        h.scheduler.module_state().scheduler_state,
        SchedulerState::Idle
    );
}

#[test]
fn test_mount_connection_loss_fails_the_job() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    h.scheduler.set_jobs(vec![make_job("lost", StepPipeline::TRACK)]);
    h.scheduler.execute(h.now);
    // Iterate without delivering notifications: the startup gate is polled,
    // so the job reaches its slewing stage with the slew still in flight.
    for _ in 0..5 {
        h.scheduler.run_scheduler_iteration(h.now);
    }
    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Busy);
    assert_eq!(h.scheduler.jobs()[0].stage, JobStage::Slewing);

    // Sever the link entirely: the mount stops answering and the hub is down.
    *h.observatory.mount.unreachable.lock() = true;
    h.observatory.hub.stop();
    h.scheduler.run_scheduler_iteration(h.now);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Error);
    assert_eq!(h.scheduler.jobs()[0].stop_reason, "mount connection lost");
}

#[test]
fn test_skipped_pipeline_steps_go_straight_to_capture() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    h.scheduler.set_jobs(vec![make_job("fast", StepPipeline::empty())]);
    h.scheduler.execute(h.now);
    h.step(8);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Complete);
    assert_eq!(*h.observatory.mount.slew_count.lock(), 0);
    assert_eq!(*h.observatory.focuser.focus_count.lock(), 0);
    assert_eq!(*h.observatory.aligner.align_count.lock(), 0);
    assert_eq!(*h.observatory.guider.start_count.lock(), 0);
    assert_eq!(*h.observatory.camera.capture_count.lock(), 1);
}

#[test]
fn test_calibration_only_job_skips_sky_preparation() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("darks", StepPipeline::all());
    job.light_frames_required = false;
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(8);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Complete);
    assert_eq!(*h.observatory.mount.slew_count.lock(), 0);
    assert_eq!(*h.observatory.camera.capture_count.lock(), 1);
}

#[test]
fn test_reference_frame_target_is_solved_before_scheduling() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("deep", StepPipeline::empty());
    job.fits_file = Some("deep.fits".into());
    job.target = TargetCoordinates::new(0.0, 0.0);
    h.scheduler.set_jobs(vec![job]);
    *h.observatory.solver.result.lock() = Some(TargetCoordinates::new(83.8, -5.4));
    h.scheduler.execute(h.now);
    h.step(9);

    assert_eq!(*h.observatory.solver.run_count.lock(), 1);
    let job = &h.scheduler.jobs()[0];
    assert_eq!(job.target, TargetCoordinates::new(83.8, -5.4));
    assert!(job.fits_solved);
    assert_eq!(job.status, JobStatus::Complete);
}

#[test]
fn test_unsolvable_reference_frame_marks_job_invalid() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("deep", StepPipeline::empty());
    job.fits_file = Some("deep.fits".into());
    h.scheduler.set_jobs(vec![job]);
    // SimSolver answers with no solution by default.
    h.scheduler.execute(h.now);
    h.step(4);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Invalid);
    assert!(h.scheduler.log().contains("did not solve"));
}

#[test]
fn test_stop_aborts_in_flight_plate_solve() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    let mut job = make_job("deep", StepPipeline::empty());
    job.fits_file = Some("deep.fits".into());
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    // One iteration issues the solve; leave its answer undelivered.
    h.scheduler.run_scheduler_iteration(h.now);
    assert!(h.scheduler.module_state().solver_job.is_some());

    h.scheduler.stop(h.now);
    assert_eq!(*h.observatory.solver.abort_count.lock(), 1);
    assert!(h.scheduler.module_state().solver_job.is_none());
}

#[test]
fn test_autofocus_not_repeated_within_session() {
    let options = SchedulerOptions {
        force_realign_per_batch: true,
        ..SchedulerOptions::default()
    };
    let mut h = Harness::new(options, 60.0);
    let mut job = make_job("foc", StepPipeline::TRACK | StepPipeline::FOCUS);
    job.completion = CompletionCondition::FinishRepeat(2);
    h.scheduler.set_jobs(vec![job]);
    h.scheduler.execute(h.now);
    h.step(12);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Complete);
    // The second batch redoes the pipeline but skips the completed autofocus.
    assert_eq!(*h.observatory.mount.slew_count.lock(), 2);
    assert_eq!(*h.observatory.focuser.focus_count.lock(), 1);
}

#[test]
fn test_remembered_progress_completes_job_without_capturing() {
    let options = SchedulerOptions {
        remember_job_progress: true,
        ..SchedulerOptions::default()
    };
    let mut h = Harness::new(options, 60.0);
    h.scheduler.set_jobs(vec![make_job("done", StepPipeline::empty())]);
    // Storage already holds every frame the 5-frame sequence asks for.
    h.observatory
        .storage
        .counts
        .lock()
        .insert("T/L/Light".to_string(), 5);
    h.scheduler.execute(h.now);
    h.step(2);

    assert_eq!(h.scheduler.jobs()[0].status, JobStatus::Complete);
    assert_eq!(*h.observatory.camera.capture_count.lock(), 0);
    assert!(h.scheduler.log().contains("already has all required frames"));
}

#[test]
fn test_iteration_fallback_rearms_same_phase() {
    let mut h = Harness::new(SchedulerOptions::default(), 60.0);
    // Nothing armed and nothing running: the Nothing phase self-sustains.
    let interval = h.scheduler.run_scheduler_iteration(h.now);
    assert_eq!(h.scheduler.module_state().timer_state(), TimerState::Nothing);
    assert_eq!(interval, -1);
}

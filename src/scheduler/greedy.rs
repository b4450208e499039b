//! Greedy scoring and selection engine.
//!
//! Re-ranks the whole queue from scratch on every call: for each
//! non-terminal job it finds the earliest feasible startup time within the
//! lookahead window, scores it, and selects the best candidate. No
//! incremental state survives between calls except the per-job
//! captured-frame counts cached by the caller.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::devices::WeatherStatus;
use crate::ephemeris::Ephemeris;
use crate::models::{CapturedFramesMap, CompletionCondition, JobStatus, SchedulerJob, StartCondition};
use crate::services::estimator::{can_count_captures, estimate_job_duration, sequence_satisfied};
use crate::services::EventLog;

/// Sentinel: this job must not run at the probed time.
pub const BAD_SCORE: f64 = -1000.0;

/// How far ahead the engine searches for a feasible startup.
const LOOKAHEAD_HOURS: i64 = 24;
/// Probe step when searching for a feasible startup time.
const PROBE_STEP_MINUTES: i64 = 10;

/// Selection parameters synced from the options before each evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyParams {
    pub restart_aborted_immediately: bool,
    pub restart_queue: bool,
    pub reschedule_errors: bool,
    pub retry_delay_secs: i64,
}

#[derive(Default)]
pub struct GreedyScheduler {
    params: GreedyParams,
    scheduled: Option<Uuid>,
}

impl GreedyScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_params(&mut self, params: GreedyParams) {
        self.params = params;
    }

    pub fn params(&self) -> &GreedyParams {
        &self.params
    }

    /// The best candidate computed by the last `schedule_jobs` call.
    pub fn scheduled_job(&self) -> Option<Uuid> {
        self.scheduled
    }

    /// Score `job` at time `t`. [`BAD_SCORE`] when any enforced constraint
    /// is violated there; otherwise monotonic in altitude margin and in how
    /// soon the job can start.
    fn score_at(
        job: &SchedulerJob,
        t: DateTime<Utc>,
        now: DateTime<Utc>,
        eph: &dyn Ephemeris,
        weather: WeatherStatus,
    ) -> f64 {
        let (altitude, _setting) = eph.find_altitude(&job.target, t);

        let mut floor = job.constraints.min_altitude_deg;
        if job.constraints.enforce_horizon {
            floor = floor.max(0.0);
        }
        if altitude < floor {
            return BAD_SCORE;
        }

        if job.constraints.enforce_twilight && !eph.is_dark(t) {
            return BAD_SCORE;
        }

        if let Some(min_sep) = job.constraints.min_moon_separation_deg {
            if eph.moon_separation(&job.target, t) < min_sep {
                return BAD_SCORE;
            }
        }

        // Weather is only known for the present; an alert blocks immediate
        // starts but is not forecast onto future probes.
        if job.constraints.enforce_weather
            && weather == WeatherStatus::Alert
            && (t - now) < Duration::minutes(PROBE_STEP_MINUTES)
        {
            return BAD_SCORE;
        }

        let margin = (altitude - floor) / 90.0;
        let delay_hours = (t - now).num_seconds().max(0) as f64 / 3600.0;
        margin - delay_hours
    }

    /// Earliest feasible startup within the lookahead, with its score.
    fn find_startup(
        job: &SchedulerJob,
        now: DateTime<Utc>,
        eph: &dyn Ephemeris,
        weather: WeatherStatus,
    ) -> Option<(DateTime<Utc>, f64)> {
        match job.start_condition {
            StartCondition::Asap => {
                let step = Duration::minutes(PROBE_STEP_MINUTES);
                let horizon = now + Duration::hours(LOOKAHEAD_HOURS);
                let mut t = now;
                while t <= horizon {
                    let score = Self::score_at(job, t, now, eph, weather);
                    if score > BAD_SCORE {
                        return Some((t, score));
                    }
                    t += step;
                }
                None
            }
            StartCondition::At(t0) => {
                let start = t0.max(now);
                if start > now + Duration::hours(LOOKAHEAD_HOURS) {
                    return None;
                }
                let score = Self::score_at(job, start, now, eph, weather);
                (score > BAD_SCORE).then_some((start, score))
            }
        }
    }

    /// Evaluate every non-terminal job, mark infeasible ones invalid, and
    /// select the best candidate. Mutates per-job startup/completion times
    /// and statuses (evaluation → scheduled/invalid).
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_jobs(
        &mut self,
        jobs: &mut [SchedulerJob],
        now: DateTime<Utc>,
        captured: &CapturedFramesMap,
        eph: &dyn Ephemeris,
        weather: WeatherStatus,
        remember_progress: bool,
        log: &EventLog,
    ) {
        self.scheduled = None;

        let mut best: Option<(f64, DateTime<Utc>, usize)> = None;

        for (index, job) in jobs.iter_mut().enumerate() {
            if job.status.is_terminal() || job.status == JobStatus::Busy {
                continue;
            }

            // A deadline already in the past can never be satisfied.
            if let CompletionCondition::FinishAt(deadline) = job.completion {
                if deadline <= now {
                    job.status = JobStatus::Invalid;
                    log.warning(format!(
                        "Job '{}' is invalid: completion time already passed.",
                        job.name
                    ));
                    continue;
                }
            }

            // Stored frames may already satisfy the whole request, typically
            // after a re-idle of a completed job and its duplicates.
            if remember_progress && can_count_captures(job) && sequence_satisfied(job, captured) {
                job.status = JobStatus::Complete;
                log.info(format!(
                    "Job '{}' already has all required frames captured, marking complete.",
                    job.name
                ));
                continue;
            }

            job.status = JobStatus::Evaluation;

            match Self::find_startup(job, now, eph, weather) {
                Some((startup, score)) => {
                    let duration = estimate_job_duration(job, captured, remember_progress);
                    job.startup_time = Some(startup);
                    job.completion_time = Some(startup + duration);
                    job.status = JobStatus::Scheduled;
                    debug!(job = %job.name, score, %startup, "job scheduled");

                    let better = match &best {
                        None => true,
                        Some((best_score, best_startup, _)) => {
                            score > *best_score
                                || (score == *best_score && startup < *best_startup)
                        }
                    };
                    if better {
                        best = Some((score, startup, index));
                    }
                }
                None => {
                    job.status = JobStatus::Invalid;
                    job.startup_time = None;
                    job.completion_time = None;
                    log.warning(format!(
                        "Job '{}' cannot meet its constraints within the next {} hours, marking invalid.",
                        job.name, LOOKAHEAD_HOURS
                    ));
                }
            }
        }

        if let Some((_, _, index)) = best {
            self.scheduled = Some(jobs[index].id);
        }
    }

    /// Re-validate the active job mid-run. False means the caller must tear
    /// down the current stage and re-run selection.
    pub fn check_job(
        &self,
        jobs: &[SchedulerJob],
        now: DateTime<Utc>,
        active_id: Uuid,
        eph: &dyn Ephemeris,
        weather: WeatherStatus,
    ) -> bool {
        let Some(active) = jobs.iter().find(|j| j.id == active_id) else {
            return false;
        };

        if let CompletionCondition::FinishAt(deadline) = active.completion {
            if deadline <= now {
                debug!(job = %active.name, "completion deadline passed");
                return false;
            }
        }

        let active_score = Self::score_at(active, now, now, eph, weather);
        if active_score <= BAD_SCORE {
            debug!(job = %active.name, "active job violates constraints");
            return false;
        }

        // Preemption: a different, immediately-startable candidate with a
        // strictly better score interrupts the active job. Equal scores
        // never preempt, keeping selection stable.
        for job in jobs {
            if job.id == active_id || job.status != JobStatus::Scheduled {
                continue;
            }
            if let Some(startup) = job.startup_time {
                if startup <= now
                    && Self::score_at(job, now, now, eph, weather) > active_score
                {
                    debug!(job = %job.name, "preempts the active job");
                    return false;
                }
            }
        }

        true
    }
}

//! Job duration estimation.
//!
//! The selection engine needs a completion estimate for every candidate to
//! compute its scheduled window. Estimates are deliberately coarse: per-frame
//! exposure plus a fixed overhead, multiplied by the remaining repeats.

use chrono::Duration;

use crate::models::{CapturedFramesMap, CompletionCondition, SchedulerJob};

/// Per-frame overhead covering download, dithering and settling, seconds.
const FRAME_OVERHEAD_SECS: f64 = 12.0;

/// Fixed pipeline setup cost (slew, focus, align, guide acquisition), seconds.
const SETUP_OVERHEAD_SECS: f64 = 240.0;

/// Estimate the wall-clock duration of the work left in `job`.
///
/// When `remember_progress` is set, frames already stored under a matching
/// signature are subtracted from the first iteration. Loop and
/// deadline-bound jobs are estimated as a single iteration; the driver
/// re-issues batches itself.
pub fn estimate_job_duration(
    job: &SchedulerJob,
    captured: &CapturedFramesMap,
    remember_progress: bool,
) -> Duration {
    let mut first_iteration_secs = 0.0;
    for fs in &job.sequence.framesets {
        let done = if remember_progress {
            captured.get(&fs.signature.key()).copied().unwrap_or(0)
        } else {
            0
        };
        let left = fs.count.saturating_sub(done);
        first_iteration_secs += left as f64 * (fs.exposure_secs + FRAME_OVERHEAD_SECS);
    }

    let full_iteration_secs: f64 = job
        .sequence
        .framesets
        .iter()
        .map(|fs| fs.count as f64 * (fs.exposure_secs + FRAME_OVERHEAD_SECS))
        .sum();

    let total = match job.completion {
        CompletionCondition::FinishSequence => first_iteration_secs,
        CompletionCondition::FinishRepeat(_) => {
            let extra = job.repeats_remaining.saturating_sub(1) as f64;
            first_iteration_secs + extra * full_iteration_secs
        }
        CompletionCondition::FinishLoop | CompletionCondition::FinishAt(_) => full_iteration_secs,
    };

    Duration::seconds((total + SETUP_OVERHEAD_SECS) as i64)
}

/// True when the stored frames already satisfy the job's whole request.
///
/// Only sequence- and repeat-bound jobs can finish by counting; loop and
/// deadline jobs always have work left.
pub fn sequence_satisfied(job: &SchedulerJob, captured: &CapturedFramesMap) -> bool {
    let multiplier = match job.completion {
        CompletionCondition::FinishSequence => 1,
        CompletionCondition::FinishRepeat(n) => n,
        CompletionCondition::FinishLoop | CompletionCondition::FinishAt(_) => return false,
    };
    job.sequence.framesets.iter().all(|fs| {
        let done = captured.get(&fs.signature.key()).copied().unwrap_or(0);
        done >= fs.count * multiplier
    })
}

/// True when job completion can be verified by counting stored frames.
///
/// Any frameset uploading to the remote camera host makes counting
/// impossible; such jobs are marked complete as soon as their last batch
/// finishes.
pub fn can_count_captures(job: &SchedulerJob) -> bool {
    job.sequence.can_count_captures()
}

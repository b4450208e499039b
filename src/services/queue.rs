//! Job queue persistence.
//!
//! The on-disk format is a JSON document with a job list; the scheduler only
//! requires that it round-trips through the [`SchedulerJob`] model. A
//! SHA-256 checksum of the source text detects external edits between load
//! and save.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::devices::CompletedFramesProvider;
use crate::error::SchedulerError;
use crate::models::{CapturedFramesMap, SchedulerJob};

#[derive(Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    pub name: String,
    pub jobs: Vec<SchedulerJob>,
}

/// A loaded queue plus the checksum of the text it came from.
pub struct LoadedQueue {
    pub name: String,
    pub jobs: Vec<SchedulerJob>,
    pub checksum: String,
}

fn checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parse a queue from its JSON text.
///
/// Jobs arrive with fresh run state: repeat counters are derived from the
/// completion condition and statuses reset to idle.
pub fn parse_queue_json_str(text: &str) -> Result<LoadedQueue, SchedulerError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("jobs").is_none() {
        return Err(SchedulerError::InvalidQueue(
            "missing required 'jobs' field".into(),
        ));
    }

    let file: QueueFile = serde_json::from_str(text)?;
    let mut jobs = file.jobs;
    for job in &mut jobs {
        if job.name.trim().is_empty() {
            return Err(SchedulerError::InvalidQueue("job with empty name".into()));
        }
        job.reset();
    }

    Ok(LoadedQueue {
        name: file.name,
        jobs,
        checksum: checksum(text),
    })
}

pub fn load_queue(path: &Path) -> Result<LoadedQueue, SchedulerError> {
    let text = std::fs::read_to_string(path).map_err(|source| SchedulerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_queue_json_str(&text)
}

/// Serialize the queue; returns the JSON text and its checksum.
pub fn queue_to_json_str(
    name: &str,
    jobs: &[SchedulerJob],
) -> Result<(String, String), SchedulerError> {
    let file = QueueFile {
        name: name.to_string(),
        jobs: jobs.to_vec(),
    };
    let text = serde_json::to_string_pretty(&file)?;
    let sum = checksum(&text);
    Ok((text, sum))
}

pub fn save_queue(path: &Path, name: &str, jobs: &[SchedulerJob]) -> Result<String, SchedulerError> {
    let (text, sum) = queue_to_json_str(name, jobs)?;
    std::fs::write(path, text).map_err(|source| SchedulerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(sum)
}

/// Rebuild the captured-frames map from the storage collaborator.
///
/// The map is cached across iterations; callers pass `forced` to invalidate
/// it (new scheduler session, or the capture module reported new frames).
pub fn update_completed_jobs_count(
    jobs: &[SchedulerJob],
    storage: &dyn CompletedFramesProvider,
    map: &mut CapturedFramesMap,
    forced: bool,
) {
    if !forced && !map.is_empty() {
        return;
    }
    map.clear();
    for job in jobs {
        for fs in &job.sequence.framesets {
            let key = fs.signature.key();
            map.entry(key)
                .or_insert_with(|| storage.completed_frames(&fs.signature));
        }
    }
}

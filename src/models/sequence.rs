//! Capture sequence summaries.
//!
//! The full sequence file format belongs to the capture module; the scheduler
//! only needs a per-signature frame count, exposure and upload mode to
//! estimate durations and count completed work.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::target::CaptureSignature;

/// Mapping from capture-signature key to the number of frames already stored.
///
/// Rebuilt lazily from the storage collaborator and cached across scheduler
/// iterations unless a recount is forced.
pub type CapturedFramesMap = HashMap<String, u32>;

/// Where the camera stores finished frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// Frames land on the client host; their files can be counted.
    Client,
    /// Frames stay on the remote camera host; completion cannot be verified
    /// by counting files.
    Remote,
}

impl Default for UploadMode {
    fn default() -> Self {
        UploadMode::Client
    }
}

/// One homogeneous batch of frames within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSet {
    pub signature: CaptureSignature,
    /// Frames requested per iteration of the sequence.
    pub count: u32,
    pub exposure_secs: f64,
    #[serde(default)]
    pub upload: UploadMode,
}

/// Scheduler-side view of a job's capture sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceSummary {
    /// Reference to the sequence file handed to the capture module.
    pub file: PathBuf,
    pub framesets: Vec<FrameSet>,
}

impl SequenceSummary {
    /// Total frames requested for one full iteration of the sequence.
    pub fn total_frames(&self) -> u32 {
        self.framesets.iter().map(|f| f.count).sum()
    }

    /// True when every frameset stores frames where they can be counted.
    pub fn can_count_captures(&self) -> bool {
        self.framesets.iter().all(|f| f.upload == UploadMode::Client)
    }
}

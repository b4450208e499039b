//! Observation job: immutable description plus mutable run state.

use std::cmp::Ordering;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ephemeris::Ephemeris;

use super::sequence::SequenceSummary;
use super::target::TargetCoordinates;

/// Job-level lifecycle. Independent of [`JobStage`], which tracks progress
/// within one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Not yet evaluated, or reset for re-evaluation.
    Idle,
    /// Under evaluation by the selection engine.
    Evaluation,
    /// Selected to run at its computed startup time.
    Scheduled,
    /// Currently executing. At most one job is busy at a time.
    Busy,
    /// Stopped after repeated stage failures; eligible for rescheduling.
    Aborted,
    /// Stopped by an unrecoverable device failure.
    Error,
    /// Cannot run under its constraints within the lookahead window.
    Invalid,
    /// All requested work done.
    Complete,
}

impl JobStatus {
    /// Terminal states are skipped by evaluation until explicitly reset.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Aborted | JobStatus::Error | JobStatus::Invalid | JobStatus::Complete
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Idle => "idle",
            JobStatus::Evaluation => "evaluation",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Busy => "busy",
            JobStatus::Aborted => "aborted",
            JobStatus::Error => "error",
            JobStatus::Invalid => "invalid",
            JobStatus::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// Progress within one execution attempt of the active job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Idle,
    Slewing,
    SlewComplete,
    Focusing,
    FocusComplete,
    Aligning,
    AlignComplete,
    Reslewing,
    ReslewComplete,
    PostalignFocusing,
    PostalignFocusComplete,
    Guiding,
    GuideComplete,
    Capturing,
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStage::Idle => "idle",
            JobStage::Slewing => "slewing",
            JobStage::SlewComplete => "slew complete",
            JobStage::Focusing => "focusing",
            JobStage::FocusComplete => "focus complete",
            JobStage::Aligning => "aligning",
            JobStage::AlignComplete => "align complete",
            JobStage::Reslewing => "reslewing",
            JobStage::ReslewComplete => "reslew complete",
            JobStage::PostalignFocusing => "post-align focusing",
            JobStage::PostalignFocusComplete => "post-align focus complete",
            JobStage::Guiding => "guiding",
            JobStage::GuideComplete => "guiding complete",
            JobStage::Capturing => "capturing",
        };
        write!(f, "{s}")
    }
}

/// When a job may start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "time")]
pub enum StartCondition {
    /// As soon as constraints allow.
    Asap,
    /// Not before the given wall-clock time.
    At(DateTime<Utc>),
}

/// When a job is considered done.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum CompletionCondition {
    /// One full pass over the capture sequence.
    FinishSequence,
    /// N full passes over the capture sequence.
    FinishRepeat(u32),
    /// Repeat until interrupted by constraints or the operator.
    FinishLoop,
    /// Repeat until the given wall-clock time.
    FinishAt(DateTime<Utc>),
}

/// Bitset of preparatory steps requested before capturing.
///
/// The canonical pipeline order is track, focus, align, guide, capture;
/// unset steps are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct StepPipeline(u8);

impl StepPipeline {
    pub const TRACK: StepPipeline = StepPipeline(0b0001);
    pub const FOCUS: StepPipeline = StepPipeline(0b0010);
    pub const ALIGN: StepPipeline = StepPipeline(0b0100);
    pub const GUIDE: StepPipeline = StepPipeline(0b1000);

    pub fn empty() -> Self {
        StepPipeline(0)
    }

    pub fn all() -> Self {
        Self::TRACK | Self::FOCUS | Self::ALIGN | Self::GUIDE
    }

    pub fn contains(self, step: StepPipeline) -> bool {
        self.0 & step.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for StepPipeline {
    type Output = StepPipeline;
    fn bitor(self, rhs: StepPipeline) -> StepPipeline {
        StepPipeline(self.0 | rhs.0)
    }
}

impl From<Vec<String>> for StepPipeline {
    fn from(names: Vec<String>) -> Self {
        let mut steps = StepPipeline::empty();
        for name in names {
            steps = steps
                | match name.as_str() {
                    "track" => StepPipeline::TRACK,
                    "focus" => StepPipeline::FOCUS,
                    "align" => StepPipeline::ALIGN,
                    "guide" => StepPipeline::GUIDE,
                    _ => StepPipeline::empty(),
                };
        }
        steps
    }
}

impl From<StepPipeline> for Vec<String> {
    fn from(steps: StepPipeline) -> Self {
        let mut names = Vec::new();
        for (bit, name) in [
            (StepPipeline::TRACK, "track"),
            (StepPipeline::FOCUS, "focus"),
            (StepPipeline::ALIGN, "align"),
            (StepPipeline::GUIDE, "guide"),
        ] {
            if steps.contains(bit) {
                names.push(name.to_string());
            }
        }
        names
    }
}

/// Environmental and temporal constraints gating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConstraints {
    /// Minimum target altitude in degrees.
    pub min_altitude_deg: f64,
    /// Minimum angular separation from the Moon, degrees. None disables.
    #[serde(default)]
    pub min_moon_separation_deg: Option<f64>,
    #[serde(default)]
    pub enforce_weather: bool,
    #[serde(default)]
    pub enforce_twilight: bool,
    #[serde(default)]
    pub enforce_horizon: bool,
}

impl Default for JobConstraints {
    fn default() -> Self {
        Self {
            min_altitude_deg: 15.0,
            min_moon_separation_deg: None,
            enforce_weather: true,
            enforce_twilight: true,
            enforce_horizon: false,
        }
    }
}

/// One queued observation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerJob {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub group: String,
    pub target: TargetCoordinates,
    /// Reference frame to plate-solve the target coordinates from; `target`
    /// holds the solution once resolved.
    #[serde(default)]
    pub fits_file: Option<PathBuf>,
    #[serde(skip)]
    pub fits_solved: bool,
    pub sequence: SequenceSummary,
    #[serde(default)]
    pub constraints: JobConstraints,
    pub start_condition: StartCondition,
    pub completion: CompletionCondition,
    #[serde(default)]
    pub pipeline: StepPipeline,
    /// Post-align refocus requested by the sequence itself.
    #[serde(default)]
    pub in_sequence_focus: bool,
    /// False when only calibration frames are pending; such jobs go straight
    /// to capture.
    #[serde(default = "default_true")]
    pub light_frames_required: bool,

    // Mutable run state, owned by the evaluation engine and the sequencer.
    #[serde(skip, default = "JobStatus::default_idle")]
    pub status: JobStatus,
    #[serde(skip, default = "JobStage::default_idle")]
    pub stage: JobStage,
    #[serde(skip)]
    pub repeats_remaining: u32,
    #[serde(skip)]
    pub completed_iterations: u32,
    #[serde(skip)]
    pub startup_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub stop_reason: String,
}

fn default_true() -> bool {
    true
}

impl JobStatus {
    fn default_idle() -> Self {
        JobStatus::Idle
    }
}

impl JobStage {
    fn default_idle() -> Self {
        JobStage::Idle
    }
}

impl SchedulerJob {
    pub fn new(
        name: impl Into<String>,
        target: TargetCoordinates,
        sequence: SequenceSummary,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            group: String::new(),
            target,
            fits_file: None,
            fits_solved: false,
            sequence,
            constraints: JobConstraints::default(),
            start_condition: StartCondition::Asap,
            completion: CompletionCondition::FinishSequence,
            pipeline: StepPipeline::all(),
            in_sequence_focus: false,
            light_frames_required: true,
            status: JobStatus::Idle,
            stage: JobStage::Idle,
            repeats_remaining: 0,
            completed_iterations: 0,
            startup_time: None,
            completion_time: None,
            stop_reason: String::new(),
        }
    }

    /// Reset run state for a fresh scheduler session.
    pub fn reset(&mut self) {
        self.status = JobStatus::Idle;
        self.stage = JobStage::Idle;
        self.repeats_remaining = match self.completion {
            CompletionCondition::FinishRepeat(n) => n,
            _ => 0,
        };
        self.completed_iterations = 0;
        self.startup_time = None;
        self.completion_time = None;
        self.stop_reason.clear();
    }

    /// True when both jobs target the same work: identical name and
    /// sequence file. Symmetric by construction.
    pub fn is_duplicate_of(&self, other: &SchedulerJob) -> bool {
        self.id != other.id
            && self.name == other.name
            && self.sequence.file == other.sequence.file
    }

    /// Comparator ranking two jobs by decreasing target altitude at the
    /// reference time; used for the manual altitude sort of the queue.
    pub fn decreasing_altitude_order(
        a: &SchedulerJob,
        b: &SchedulerJob,
        eph: &dyn Ephemeris,
        reference: DateTime<Utc>,
    ) -> Ordering {
        let (alt_a, setting_a) = eph.find_altitude(&a.target, reference);
        let (alt_b, setting_b) = eph.find_altitude(&b.target, reference);
        // Setting targets sort before rising ones at equal altitude: they
        // are the more urgent observation.
        (alt_b, setting_b as u8)
            .partial_cmp(&(alt_a, setting_a as u8))
            .unwrap_or(Ordering::Equal)
    }
}

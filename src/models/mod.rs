//! Core data model: jobs, targets, capture signatures and sequences.

pub mod job;
pub mod sequence;
pub mod target;

pub use job::{
    CompletionCondition, JobConstraints, JobStage, JobStatus, SchedulerJob, StartCondition,
    StepPipeline,
};
pub use sequence::{CapturedFramesMap, FrameSet, SequenceSummary, UploadMode};
pub use target::{CaptureSignature, TargetCoordinates};

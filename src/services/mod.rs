//! Support services around the scheduler core: user-visible logging, queue
//! persistence and job duration estimation.

pub mod estimator;
pub mod event_log;
pub mod queue;

pub use event_log::{EventLog, LogEntry, LogLevel};

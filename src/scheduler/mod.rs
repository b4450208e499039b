//! Scheduling core: queue evaluation, job selection and execution.

mod driver;
mod greedy;
mod module_state;
mod process;

#[cfg(test)]
mod tests;

pub use driver::{Scheduler, SchedulerCommand};
pub use greedy::{GreedyParams, GreedyScheduler, BAD_SCORE};
pub use module_state::{
    CommStatus, FailureCounters, ModuleState, ParkWaitState, SchedulerState, ShutdownState,
    StartupState, TimerState,
};
pub use process::SchedulerProcess;

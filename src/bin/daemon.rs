//! Observation Scheduler Daemon
//!
//! Entry point for running the scheduler over the simulated observatory.
//! It loads the options and the job queue, wires the device collaborators to
//! the event channel, and drives the control loop until the queue is done or
//! Ctrl-C arrives.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin obsched-daemon -- queue.json
//! ```
//!
//! # Environment Variables
//!
//! - `OBSCHED_CONFIG`: path to a TOML options file (defaults apply if unset)
//! - `RUST_LOG`: log level (default: info)

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use obsched::devices::sim::SimObservatory;
use obsched::ephemeris::SineEphemeris;
use obsched::scheduler::{Scheduler, SchedulerCommand};
use obsched::services::queue::load_queue;
use obsched::services::EventLog;
use obsched::SchedulerOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_max_level(
            env::var("RUST_LOG")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Level::INFO),
        )
        .with_target(true)
        .init();

    let options = match env::var("OBSCHED_CONFIG") {
        Ok(path) => SchedulerOptions::load(Path::new(&path))?,
        Err(_) => SchedulerOptions::default(),
    };

    let queue_path = env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: obsched-daemon <queue.json>"))?;
    let queue = load_queue(Path::new(&queue_path))?;
    info!(
        queue = %queue.name,
        jobs = queue.jobs.len(),
        checksum = %queue.checksum,
        "queue loaded"
    );

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel();

    // Simulated devices with a small delay so the pipeline shows in the logs.
    let observatory = SimObservatory::new(event_tx, Duration::from_millis(250));
    let log = EventLog::new();

    let mut scheduler = Scheduler::new(
        options,
        observatory.device_set(),
        Arc::new(SineEphemeris::default()),
        log.clone(),
    );
    scheduler.set_jobs(queue.jobs);

    command_tx.send(SchedulerCommand::Start)?;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping the scheduler");
            let _ = command_tx.send(SchedulerCommand::Stop);
        }
    });

    scheduler.run(event_rx, command_rx).await;

    for entry in log.snapshot() {
        info!(level = ?entry.level, "{} {}", entry.timestamp, entry.message);
    }

    Ok(())
}

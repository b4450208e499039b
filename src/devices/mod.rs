//! Typed capability interfaces for external device collaborators.
//!
//! The scheduler never talks to hardware or any IPC transport directly: each
//! device family is a narrow trait with fire-and-forget `start_*` commands, a
//! poll-able status, and asynchronous status notifications pushed into the
//! driver's event channel as [`DeviceEvent`]s. The one deliberate exception
//! is [`Camera::abort`], a synchronous request/response, so that a capture is
//! guaranteed to be torn down before subsequent actions are issued.

pub mod sim;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::models::{CaptureSignature, SequenceSummary, TargetCoordinates};

/// Mount state as reported by the mount collaborator.
///
/// `None` from [`Mount::status`] means the module stopped answering and the
/// driver should attempt connection management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Idle,
    Slewing,
    Tracking,
    Parking,
    Parked,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusStatus {
    Idle,
    Waiting,
    InProgress,
    Complete,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignStatus {
    Idle,
    InProgress,
    Complete,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideStatus {
    Idle,
    Connected,
    Disconnected,
    Calibrating,
    Guiding,
    Suspended,
    Aborted,
    CalibrationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Idle,
    InProgress,
    ImageReceived,
    Suspended,
    Complete,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherStatus {
    Ok,
    Warning,
    Alert,
}

/// Solver outcome pushed back by the plate-solving collaborator.
#[derive(Debug, Clone)]
pub struct SolverResult {
    pub timed_out: bool,
    pub success: bool,
    pub solution: Option<TargetCoordinates>,
    pub elapsed_secs: f64,
}

/// Asynchronous notifications from all collaborators, delivered on the
/// driver's single event queue.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Mount(MountStatus),
    Focus(FocusStatus),
    Align(AlignStatus),
    Guide(GuideStatus),
    Capture(CaptureStatus),
    Weather(WeatherStatus),
    /// Dome finished moving (false) or started moving (true).
    DomeMoving(bool),
    DustCoverParked(bool),
    HubReady(bool),
    LinksReady(bool),
    StartupScriptFinished { success: bool },
    ShutdownScriptFinished { success: bool },
    SolverDone(SolverResult),
}

pub trait Mount: Send + Sync {
    fn start_slew(&self, target: &TargetCoordinates);
    fn abort(&self);
    fn park(&self);
    fn unpark(&self);
    /// None when the module no longer answers.
    fn status(&self) -> Option<MountStatus>;
}

pub trait Focuser: Send + Sync {
    fn start_focus(&self);
    fn abort(&self);
    fn status(&self) -> FocusStatus;
}

pub trait Aligner: Send + Sync {
    fn start_align(&self, target: &TargetCoordinates);
    fn abort(&self);
    fn status(&self) -> AlignStatus;
}

pub trait Guider: Send + Sync {
    /// `recalibrate` forces a fresh calibration before guiding resumes.
    fn start_guiding(&self, recalibrate: bool);
    fn stop(&self);
    fn status(&self) -> GuideStatus;
}

pub trait Camera: Send + Sync {
    fn start_capture(&self, sequence: &SequenceSummary, target_name: &str);
    /// Synchronous: returns only once the in-progress exposure is torn down,
    /// guaranteeing ordering with whatever the driver does next.
    fn abort(&self) -> Result<(), DeviceError>;
    fn status(&self) -> CaptureStatus;
}

pub trait Dome: Send + Sync {
    fn park(&self);
    fn unpark(&self);
    /// None when the module no longer answers.
    fn is_moving(&self) -> Option<bool>;
    fn is_parked(&self) -> bool;
    /// A dome is present and participating in slaving.
    fn is_available(&self) -> bool;
}

pub trait DustCap: Send + Sync {
    fn park(&self);
    fn unpark(&self);
    fn is_parked(&self) -> bool;
    fn is_available(&self) -> bool;
}

pub trait WeatherStation: Send + Sync {
    fn status(&self) -> WeatherStatus;
    fn is_available(&self) -> bool;
}

/// Communication/connection manager for the external device stack: starting
/// the hub process and connecting the individual device links.
pub trait Hub: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn connect_links(&self);
    fn disconnect_links(&self);
    fn is_ready(&self) -> bool;
    fn links_ready(&self) -> bool;
}

/// Startup/shutdown script collaborator.
pub trait ScriptRunner: Send + Sync {
    fn run(&self, path: &Path);
    fn terminate(&self);
    fn is_running(&self) -> bool;
}

/// Plate-solving collaborator, request/response over the event channel.
/// Resolves the coordinates of targets specified by a reference frame.
pub trait Solver: Send + Sync {
    fn run(&self, filename: &Path, timeout_secs: u64);
    fn abort(&self);
}

/// Storage collaborator: counts frames already stored for a signature.
pub trait CompletedFramesProvider: Send + Sync {
    fn completed_frames(&self, signature: &CaptureSignature) -> u32;
}

/// The full collaborator set handed to the scheduler.
#[derive(Clone)]
pub struct DeviceSet {
    pub mount: Arc<dyn Mount>,
    pub focuser: Arc<dyn Focuser>,
    pub aligner: Arc<dyn Aligner>,
    pub guider: Arc<dyn Guider>,
    pub camera: Arc<dyn Camera>,
    pub dome: Arc<dyn Dome>,
    pub dust_cap: Arc<dyn DustCap>,
    pub weather: Arc<dyn WeatherStation>,
    pub hub: Arc<dyn Hub>,
    pub scripts: Arc<dyn ScriptRunner>,
    pub solver: Arc<dyn Solver>,
    pub storage: Arc<dyn CompletedFramesProvider>,
}

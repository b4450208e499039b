//! Simulated device collaborators.
//!
//! Used by the demo daemon and the test suite. With a zero delay every
//! command acknowledges synchronously by pushing its status events into the
//! channel, which keeps tests deterministic; the daemon configures small
//! delays so the pipeline is observable in the logs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::DeviceError;
use crate::models::{CaptureSignature, SequenceSummary, TargetCoordinates};

use super::{
    AlignStatus, Aligner, Camera, CaptureStatus, CompletedFramesProvider, DeviceEvent, Dome,
    DustCap, FocusStatus, Focuser, GuideStatus, Guider, Hub, Mount, MountStatus, ScriptRunner,
    Solver, SolverResult, WeatherStation, WeatherStatus,
};

fn emit(tx: &UnboundedSender<DeviceEvent>, delay: Duration, events: Vec<DeviceEvent>) {
    if delay.is_zero() {
        for ev in events {
            let _ = tx.send(ev);
        }
    } else {
        let tx = tx.clone();
        tokio::spawn(async move {
            for ev in events {
                tokio::time::sleep(delay).await;
                let _ = tx.send(ev);
            }
        });
    }
}

pub struct SimMount {
    tx: UnboundedSender<DeviceEvent>,
    delay: Duration,
    status: Mutex<MountStatus>,
    pub slew_count: Mutex<u32>,
    /// When true, `status()` answers None to exercise connection loss.
    pub unreachable: Mutex<bool>,
}

impl SimMount {
    pub fn new(tx: UnboundedSender<DeviceEvent>, delay: Duration) -> Self {
        Self {
            tx,
            delay,
            status: Mutex::new(MountStatus::Idle),
            slew_count: Mutex::new(0),
            unreachable: Mutex::new(false),
        }
    }
}

impl Mount for SimMount {
    fn start_slew(&self, _target: &TargetCoordinates) {
        *self.slew_count.lock() += 1;
        *self.status.lock() = MountStatus::Tracking;
        emit(
            &self.tx,
            self.delay,
            vec![
                DeviceEvent::Mount(MountStatus::Slewing),
                DeviceEvent::Mount(MountStatus::Tracking),
            ],
        );
    }

    fn abort(&self) {
        *self.status.lock() = MountStatus::Idle;
    }

    fn park(&self) {
        *self.status.lock() = MountStatus::Parked;
        emit(&self.tx, self.delay, vec![DeviceEvent::Mount(MountStatus::Parked)]);
    }

    fn unpark(&self) {
        *self.status.lock() = MountStatus::Tracking;
        emit(&self.tx, self.delay, vec![DeviceEvent::Mount(MountStatus::Tracking)]);
    }

    fn status(&self) -> Option<MountStatus> {
        if *self.unreachable.lock() {
            None
        } else {
            Some(*self.status.lock())
        }
    }
}

pub struct SimFocuser {
    tx: UnboundedSender<DeviceEvent>,
    delay: Duration,
    status: Mutex<FocusStatus>,
    pub focus_count: Mutex<u32>,
    /// When true the focuser never answers, to exercise inactivity timeouts.
    pub stalled: Mutex<bool>,
}

impl SimFocuser {
    pub fn new(tx: UnboundedSender<DeviceEvent>, delay: Duration) -> Self {
        Self {
            tx,
            delay,
            status: Mutex::new(FocusStatus::Idle),
            focus_count: Mutex::new(0),
            stalled: Mutex::new(false),
        }
    }
}

impl Focuser for SimFocuser {
    fn start_focus(&self) {
        *self.focus_count.lock() += 1;
        if *self.stalled.lock() {
            return;
        }
        *self.status.lock() = FocusStatus::Complete;
        emit(
            &self.tx,
            self.delay,
            vec![
                DeviceEvent::Focus(FocusStatus::InProgress),
                DeviceEvent::Focus(FocusStatus::Complete),
            ],
        );
    }

    fn abort(&self) {
        *self.status.lock() = FocusStatus::Idle;
    }

    fn status(&self) -> FocusStatus {
        if *self.stalled.lock() {
            FocusStatus::Idle
        } else {
            *self.status.lock()
        }
    }
}

pub struct SimAligner {
    tx: UnboundedSender<DeviceEvent>,
    delay: Duration,
    status: Mutex<AlignStatus>,
    pub align_count: Mutex<u32>,
    pub stalled: Mutex<bool>,
}

impl SimAligner {
    pub fn new(tx: UnboundedSender<DeviceEvent>, delay: Duration) -> Self {
        Self {
            tx,
            delay,
            status: Mutex::new(AlignStatus::Idle),
            align_count: Mutex::new(0),
            stalled: Mutex::new(false),
        }
    }
}

impl Aligner for SimAligner {
    fn start_align(&self, _target: &TargetCoordinates) {
        *self.align_count.lock() += 1;
        if *self.stalled.lock() {
            return;
        }
        *self.status.lock() = AlignStatus::Complete;
        emit(
            &self.tx,
            self.delay,
            vec![
                DeviceEvent::Align(AlignStatus::InProgress),
                DeviceEvent::Align(AlignStatus::Complete),
            ],
        );
    }

    fn abort(&self) {
        *self.status.lock() = AlignStatus::Idle;
    }

    fn status(&self) -> AlignStatus {
        if *self.stalled.lock() {
            AlignStatus::Idle
        } else {
            *self.status.lock()
        }
    }
}

pub struct SimGuider {
    tx: UnboundedSender<DeviceEvent>,
    delay: Duration,
    status: Mutex<GuideStatus>,
    pub start_count: Mutex<u32>,
    pub recalibrations: Mutex<u32>,
}

impl SimGuider {
    pub fn new(tx: UnboundedSender<DeviceEvent>, delay: Duration) -> Self {
        Self {
            tx,
            delay,
            status: Mutex::new(GuideStatus::Idle),
            start_count: Mutex::new(0),
            recalibrations: Mutex::new(0),
        }
    }
}

impl Guider for SimGuider {
    fn start_guiding(&self, recalibrate: bool) {
        *self.start_count.lock() += 1;
        if recalibrate {
            *self.recalibrations.lock() += 1;
        }
        *self.status.lock() = GuideStatus::Guiding;
        emit(
            &self.tx,
            self.delay,
            vec![
                DeviceEvent::Guide(GuideStatus::Calibrating),
                DeviceEvent::Guide(GuideStatus::Guiding),
            ],
        );
    }

    fn stop(&self) {
        *self.status.lock() = GuideStatus::Idle;
    }

    fn status(&self) -> GuideStatus {
        *self.status.lock()
    }
}

pub struct SimCamera {
    tx: UnboundedSender<DeviceEvent>,
    delay: Duration,
    status: Mutex<CaptureStatus>,
    pub capture_count: Mutex<u32>,
    pub abort_count: Mutex<u32>,
    /// Error to answer the next abort request with, to exercise teardown
    /// failures.
    pub abort_error: Mutex<Option<DeviceError>>,
}

impl SimCamera {
    pub fn new(tx: UnboundedSender<DeviceEvent>, delay: Duration) -> Self {
        Self {
            tx,
            delay,
            status: Mutex::new(CaptureStatus::Idle),
            capture_count: Mutex::new(0),
            abort_count: Mutex::new(0),
            abort_error: Mutex::new(None),
        }
    }
}

impl Camera for SimCamera {
    fn start_capture(&self, _sequence: &SequenceSummary, _target_name: &str) {
        *self.capture_count.lock() += 1;
        *self.status.lock() = CaptureStatus::InProgress;
        emit(
            &self.tx,
            self.delay,
            vec![
                DeviceEvent::Capture(CaptureStatus::InProgress),
                DeviceEvent::Capture(CaptureStatus::Complete),
            ],
        );
    }

    fn abort(&self) -> Result<(), DeviceError> {
        *self.abort_count.lock() += 1;
        if let Some(err) = self.abort_error.lock().clone() {
            return Err(err);
        }
        *self.status.lock() = CaptureStatus::Idle;
        Ok(())
    }

    fn status(&self) -> CaptureStatus {
        *self.status.lock()
    }
}

pub struct SimDome {
    pub available: bool,
    moving: Mutex<bool>,
    parked: Mutex<bool>,
}

impl SimDome {
    pub fn new(available: bool) -> Self {
        Self {
            available,
            moving: Mutex::new(false),
            parked: Mutex::new(true),
        }
    }
}

impl Dome for SimDome {
    fn park(&self) {
        *self.parked.lock() = true;
    }

    fn unpark(&self) {
        *self.parked.lock() = false;
    }

    fn is_moving(&self) -> Option<bool> {
        Some(*self.moving.lock())
    }

    fn is_parked(&self) -> bool {
        *self.parked.lock()
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

pub struct SimDustCap {
    pub available: bool,
    parked: Mutex<bool>,
}

impl SimDustCap {
    pub fn new(available: bool) -> Self {
        Self {
            available,
            parked: Mutex::new(true),
        }
    }
}

impl DustCap for SimDustCap {
    fn park(&self) {
        *self.parked.lock() = true;
    }

    fn unpark(&self) {
        *self.parked.lock() = false;
    }

    fn is_parked(&self) -> bool {
        *self.parked.lock()
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

pub struct SimWeather {
    pub status: Mutex<WeatherStatus>,
}

impl SimWeather {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(WeatherStatus::Ok),
        }
    }
}

impl Default for SimWeather {
    fn default() -> Self {
        Self::new()
    }
}

impl WeatherStation for SimWeather {
    fn status(&self) -> WeatherStatus {
        *self.status.lock()
    }

    fn is_available(&self) -> bool {
        true
    }
}

pub struct SimHub {
    ready: Mutex<bool>,
    links: Mutex<bool>,
}

impl SimHub {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            links: Mutex::new(false),
        }
    }
}

impl Default for SimHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub for SimHub {
    fn start(&self) {
        *self.ready.lock() = true;
    }

    fn stop(&self) {
        *self.ready.lock() = false;
        *self.links.lock() = false;
    }

    fn connect_links(&self) {
        *self.links.lock() = true;
    }

    fn disconnect_links(&self) {
        *self.links.lock() = false;
    }

    fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    fn links_ready(&self) -> bool {
        *self.links.lock()
    }
}

pub struct SimScripts {
    tx: UnboundedSender<DeviceEvent>,
    running: Mutex<bool>,
}

impl SimScripts {
    pub fn new(tx: UnboundedSender<DeviceEvent>) -> Self {
        Self {
            tx,
            running: Mutex::new(false),
        }
    }
}

impl ScriptRunner for SimScripts {
    fn run(&self, _path: &Path) {
        *self.running.lock() = false;
        let _ = self
            .tx
            .send(DeviceEvent::StartupScriptFinished { success: true });
    }

    fn terminate(&self) {
        *self.running.lock() = false;
    }

    fn is_running(&self) -> bool {
        *self.running.lock()
    }
}

pub struct SimSolver {
    tx: UnboundedSender<DeviceEvent>,
    delay: Duration,
    /// Coordinates the next solve answers with; None makes it fail.
    pub result: Mutex<Option<TargetCoordinates>>,
    pub run_count: Mutex<u32>,
    pub abort_count: Mutex<u32>,
}

impl SimSolver {
    pub fn new(tx: UnboundedSender<DeviceEvent>, delay: Duration) -> Self {
        Self {
            tx,
            delay,
            result: Mutex::new(None),
            run_count: Mutex::new(0),
            abort_count: Mutex::new(0),
        }
    }
}

impl Solver for SimSolver {
    fn run(&self, _filename: &Path, _timeout_secs: u64) {
        *self.run_count.lock() += 1;
        let solution = *self.result.lock();
        let event = DeviceEvent::SolverDone(SolverResult {
            timed_out: false,
            success: solution.is_some(),
            solution,
            elapsed_secs: 1.5,
        });
        emit(&self.tx, self.delay, vec![event]);
    }

    fn abort(&self) {
        *self.abort_count.lock() += 1;
    }
}

pub struct SimStorage {
    pub counts: Mutex<std::collections::HashMap<String, u32>>,
}

impl SimStorage {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for SimStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletedFramesProvider for SimStorage {
    fn completed_frames(&self, signature: &CaptureSignature) -> u32 {
        self.counts.lock().get(&signature.key()).copied().unwrap_or(0)
    }
}

/// A complete simulated collaborator set plus handles to each device for
/// test manipulation.
pub struct SimObservatory {
    pub mount: Arc<SimMount>,
    pub focuser: Arc<SimFocuser>,
    pub aligner: Arc<SimAligner>,
    pub guider: Arc<SimGuider>,
    pub camera: Arc<SimCamera>,
    pub dome: Arc<SimDome>,
    pub dust_cap: Arc<SimDustCap>,
    pub weather: Arc<SimWeather>,
    pub hub: Arc<SimHub>,
    pub scripts: Arc<SimScripts>,
    pub solver: Arc<SimSolver>,
    pub storage: Arc<SimStorage>,
}

impl SimObservatory {
    pub fn new(tx: UnboundedSender<DeviceEvent>, delay: Duration) -> Self {
        Self {
            mount: Arc::new(SimMount::new(tx.clone(), delay)),
            focuser: Arc::new(SimFocuser::new(tx.clone(), delay)),
            aligner: Arc::new(SimAligner::new(tx.clone(), delay)),
            guider: Arc::new(SimGuider::new(tx.clone(), delay)),
            camera: Arc::new(SimCamera::new(tx.clone(), delay)),
            dome: Arc::new(SimDome::new(false)),
            dust_cap: Arc::new(SimDustCap::new(false)),
            weather: Arc::new(SimWeather::new()),
            hub: Arc::new(SimHub::new()),
            scripts: Arc::new(SimScripts::new(tx.clone())),
            solver: Arc::new(SimSolver::new(tx.clone(), delay)),
            storage: Arc::new(SimStorage::new()),
        }
    }

    pub fn device_set(&self) -> super::DeviceSet {
        super::DeviceSet {
            mount: self.mount.clone(),
            focuser: self.focuser.clone(),
            aligner: self.aligner.clone(),
            guider: self.guider.clone(),
            camera: self.camera.clone(),
            dome: self.dome.clone(),
            dust_cap: self.dust_cap.clone(),
            weather: self.weather.clone(),
            hub: self.hub.clone(),
            scripts: self.scripts.clone(),
            solver: self.solver.clone(),
            storage: self.storage.clone(),
        }
    }
}

//! Device command dispatch and readiness gates.
//!
//! [`SchedulerProcess`] is the only place that talks to the collaborator
//! traits. The driver decides *what* should happen; this type issues the
//! corresponding non-blocking commands, walks the startup/shutdown/park-wait
//! procedures, and manages reconnection after a lost link.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::SchedulerOptions;
use crate::devices::{DeviceSet, GuideStatus, MountStatus};
use crate::error::DeviceError;
use crate::models::{JobStage, SchedulerJob};
use crate::services::EventLog;

use super::module_state::{
    CommStatus, ModuleState, ParkWaitState, ShutdownState, StartupState,
};

pub struct SchedulerProcess {
    devices: DeviceSet,
    options: SchedulerOptions,
    log: EventLog,
}

impl SchedulerProcess {
    pub fn new(devices: DeviceSet, options: SchedulerOptions, log: EventLog) -> Self {
        Self {
            devices,
            options,
            log,
        }
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    // --- stage actions ----------------------------------------------------

    pub fn start_slew(&self, job: &mut SchedulerJob, state: &mut ModuleState, now: DateTime<Utc>) {
        job.stage = if matches!(job.stage, JobStage::AlignComplete | JobStage::Reslewing) {
            JobStage::Reslewing
        } else {
            JobStage::Slewing
        };
        self.devices.mount.start_slew(&job.target);
        state.start_current_operation_timer(now);
        info!(job = %job.name, stage = %job.stage, "slew started");
    }

    pub fn start_focusing(
        &self,
        job: &mut SchedulerJob,
        state: &mut ModuleState,
        now: DateTime<Utc>,
    ) {
        job.stage = if job.stage == JobStage::ReslewComplete {
            JobStage::PostalignFocusing
        } else {
            JobStage::Focusing
        };
        self.devices.focuser.start_focus();
        state.start_current_operation_timer(now);
        info!(job = %job.name, stage = %job.stage, "focus started");
    }

    pub fn start_astrometry(
        &self,
        job: &mut SchedulerJob,
        state: &mut ModuleState,
        now: DateTime<Utc>,
    ) {
        job.stage = JobStage::Aligning;
        self.devices.aligner.start_align(&job.target);
        state.start_current_operation_timer(now);
        info!(job = %job.name, "alignment started");
    }

    /// A guiding restart under a running capture leaves the stage untouched;
    /// the capture keeps going while guiding recovers.
    pub fn start_guiding(
        &self,
        job: &mut SchedulerJob,
        state: &mut ModuleState,
        now: DateTime<Utc>,
        recalibrate: bool,
    ) {
        if job.stage != JobStage::Capturing {
            job.stage = JobStage::Guiding;
        }
        self.devices.guider.start_guiding(recalibrate);
        state.start_current_operation_timer(now);
        info!(job = %job.name, recalibrate, "guiding started");
    }

    pub fn start_capture(
        &self,
        job: &mut SchedulerJob,
        state: &mut ModuleState,
        now: DateTime<Utc>,
    ) {
        job.stage = JobStage::Capturing;
        self.devices.camera.start_capture(&job.sequence, &job.name);
        state.start_current_operation_timer(now);
        info!(job = %job.name, "capture started");
    }

    pub fn stop_guiding(&self, state: &mut ModuleState) {
        self.devices.guider.stop();
        state.guiding_restart_at = None;
    }

    pub fn guiding_status(&self) -> GuideStatus {
        self.devices.guider.status()
    }

    /// Restart guiding once the restart timer armed after an abort expires.
    pub fn process_guiding_timer(
        &self,
        job: &mut SchedulerJob,
        state: &mut ModuleState,
        now: DateTime<Utc>,
    ) {
        if let Some(deadline) = state.guiding_restart_at {
            if deadline <= now {
                state.guiding_restart_at = None;
                self.log.info(format!("Job '{}' is restarting its guiding procedure.", job.name));
                self.start_guiding(job, state, now, true);
            }
        }
    }

    // --- startup gate -----------------------------------------------------

    /// First unpark phase applicable under the options and device set.
    fn next_unpark_phase(&self, after: StartupState) -> StartupState {
        let phases = [
            StartupState::UnparkDome,
            StartupState::UnparkMount,
            StartupState::UncapDustCover,
        ];
        for phase in phases {
            if phase <= after {
                continue;
            }
            let applicable = match phase {
                StartupState::UnparkDome => {
                    self.options.unpark_dome && self.devices.dome.is_available()
                }
                StartupState::UnparkMount => self.options.unpark_mount,
                StartupState::UncapDustCover => {
                    self.options.open_dust_cover && self.devices.dust_cap.is_available()
                }
                _ => false,
            };
            if applicable {
                return phase;
            }
        }
        StartupState::Complete
    }

    /// Run the startup script before anything else is powered on; the script
    /// typically switches the equipment supply on. True once the script phase
    /// is behind.
    pub fn check_startup_script(&self, state: &mut ModuleState) -> bool {
        match state.startup_state {
            StartupState::Idle => {
                if let Some(script) = &self.options.startup_script {
                    state.startup_state = StartupState::Script;
                    self.log.info("Running startup script...");
                    self.devices.scripts.run(std::path::Path::new(script));
                } else {
                    state.startup_state = self.next_unpark_phase(StartupState::Script);
                }
                false
            }
            // Advanced by the script-finished notification.
            StartupState::Script => false,
            _ => true,
        }
    }

    /// Walk the unpark phases of the startup procedure one step. True once
    /// complete.
    pub fn check_startup_state(&self, state: &mut ModuleState) -> bool {
        match state.startup_state {
            // Handled by check_startup_script before the hub comes up.
            StartupState::Idle | StartupState::Script => false,
            StartupState::UnparkDome => {
                self.devices.dome.unpark();
                if !self.devices.dome.is_parked() && self.devices.dome.is_moving() == Some(false) {
                    state.startup_state = self.next_unpark_phase(StartupState::UnparkDome);
                }
                false
            }
            StartupState::UnparkMount => {
                self.devices.mount.unpark();
                match self.devices.mount.status() {
                    Some(MountStatus::Tracking) | Some(MountStatus::Idle) => {
                        state.startup_state = self.next_unpark_phase(StartupState::UnparkMount);
                    }
                    Some(MountStatus::Error) => {
                        state.startup_state = StartupState::Error;
                        self.log.error("Mount unparking failed.");
                    }
                    _ => {}
                }
                false
            }
            StartupState::UncapDustCover => {
                self.devices.dust_cap.unpark();
                if !self.devices.dust_cap.is_parked() {
                    state.startup_state = StartupState::Complete;
                }
                false
            }
            StartupState::Complete => true,
            StartupState::Error => false,
        }
    }

    pub fn startup_script_finished(&self, state: &mut ModuleState, success: bool) {
        if state.startup_state != StartupState::Script {
            return;
        }
        if success {
            self.log.info("Startup script finished.");
            state.startup_state = self.next_unpark_phase(StartupState::Script);
        } else {
            self.log.error("Startup script failed, aborting startup.");
            state.startup_state = StartupState::Error;
        }
    }

    pub fn shutdown_script_finished(&self, state: &mut ModuleState, success: bool) {
        if state.shutdown_state != ShutdownState::Script {
            return;
        }
        state.shutdown_state = if success {
            ShutdownState::Complete
        } else {
            self.log.error("Shutdown script failed.");
            ShutdownState::Error
        };
    }

    /// Start or verify the hub process. True when ready.
    pub fn check_hub_state(&self, state: &mut ModuleState) -> bool {
        match state.hub_state {
            CommStatus::Idle => {
                self.devices.hub.start();
                state.hub_state = CommStatus::Pending;
                false
            }
            CommStatus::Pending => {
                if self.devices.hub.is_ready() {
                    state.hub_state = CommStatus::Success;
                    self.log.info("Communication hub is ready.");
                    true
                } else {
                    false
                }
            }
            CommStatus::Success => true,
            CommStatus::Error => false,
        }
    }

    /// Connect the individual device links. True when all are up.
    pub fn check_links_state(&self, state: &mut ModuleState) -> bool {
        match state.links_state {
            CommStatus::Idle => {
                self.devices.hub.connect_links();
                state.links_state = CommStatus::Pending;
                false
            }
            CommStatus::Pending => {
                if self.devices.hub.links_ready() {
                    state.links_state = CommStatus::Success;
                    self.log.info("Device links are connected.");
                    true
                } else {
                    false
                }
            }
            CommStatus::Success => true,
            CommStatus::Error => false,
        }
    }

    /// Walk the park-wait procedure. True when it is not blocking progress.
    pub fn check_park_wait_state(&self, state: &mut ModuleState) -> bool {
        match state.park_wait_state {
            ParkWaitState::Idle
            | ParkWaitState::Parked
            | ParkWaitState::Unparked
            | ParkWaitState::Error => true,
            ParkWaitState::Park => {
                self.devices.mount.park();
                state.park_wait_state = ParkWaitState::Parking;
                false
            }
            ParkWaitState::Parking => {
                match self.devices.mount.status() {
                    Some(MountStatus::Parked) => {
                        state.park_wait_state = ParkWaitState::Parked;
                        self.log.info("Mount parked while waiting for the next job.");
                    }
                    Some(MountStatus::Error) => state.park_wait_state = ParkWaitState::Error,
                    _ => {}
                }
                false
            }
            ParkWaitState::Unpark => {
                self.devices.mount.unpark();
                state.park_wait_state = ParkWaitState::Unparking;
                false
            }
            ParkWaitState::Unparking => {
                match self.devices.mount.status() {
                    Some(MountStatus::Tracking) | Some(MountStatus::Idle) => {
                        state.park_wait_state = ParkWaitState::Unparked;
                    }
                    Some(MountStatus::Error) => state.park_wait_state = ParkWaitState::Error,
                    _ => {}
                }
                false
            }
        }
    }

    // --- shutdown procedure -----------------------------------------------

    fn next_shutdown_phase(&self, after: ShutdownState) -> ShutdownState {
        let phases = [
            ShutdownState::CapDustCover,
            ShutdownState::ParkMount,
            ShutdownState::ParkDome,
            ShutdownState::Script,
        ];
        for phase in phases {
            if phase <= after {
                continue;
            }
            let applicable = match phase {
                ShutdownState::CapDustCover => {
                    self.options.open_dust_cover && self.devices.dust_cap.is_available()
                }
                ShutdownState::ParkMount => self.options.unpark_mount,
                ShutdownState::ParkDome => {
                    self.options.unpark_dome && self.devices.dome.is_available()
                }
                ShutdownState::Script => self.options.shutdown_script.is_some(),
                _ => false,
            };
            if applicable {
                return phase;
            }
        }
        ShutdownState::Complete
    }

    /// Walk the shutdown procedure one step. True once complete or failed.
    pub fn check_shutdown_procedure(&self, state: &mut ModuleState) -> bool {
        match state.shutdown_state {
            ShutdownState::Idle => {
                self.log.info("Observatory is entering the shutdown process.");
                state.shutdown_state = self.next_shutdown_phase(ShutdownState::Idle);
                false
            }
            ShutdownState::CapDustCover => {
                self.devices.dust_cap.park();
                if self.devices.dust_cap.is_parked() {
                    state.shutdown_state = self.next_shutdown_phase(ShutdownState::CapDustCover);
                }
                false
            }
            ShutdownState::ParkMount => {
                self.devices.mount.park();
                match self.devices.mount.status() {
                    Some(MountStatus::Parked) => {
                        state.shutdown_state = self.next_shutdown_phase(ShutdownState::ParkMount);
                    }
                    Some(MountStatus::Error) => {
                        state.shutdown_state = ShutdownState::Error;
                        self.log.error("Mount parking failed during shutdown.");
                    }
                    _ => {}
                }
                false
            }
            ShutdownState::ParkDome => {
                self.devices.dome.park();
                if self.devices.dome.is_parked() && self.devices.dome.is_moving() == Some(false) {
                    state.shutdown_state = self.next_shutdown_phase(ShutdownState::ParkDome);
                }
                false
            }
            ShutdownState::Script => {
                if let Some(script) = &self.options.shutdown_script {
                    if !self.devices.scripts.is_running() {
                        self.devices.scripts.run(std::path::Path::new(script));
                    }
                } else {
                    state.shutdown_state = ShutdownState::Complete;
                }
                false
            }
            ShutdownState::Complete | ShutdownState::Error => true,
        }
    }

    /// Final teardown after the shutdown procedure ran to its end.
    pub fn complete_shutdown(&self, state: &mut ModuleState) {
        self.devices.hub.disconnect_links();
        self.devices.hub.stop();
        state.hub_state = CommStatus::Idle;
        state.links_state = CommStatus::Idle;
        self.log.info("Observatory shutdown complete.");
    }

    /// Try to recover a lost device link. False when reconnection is not
    /// possible and the job must be failed.
    pub fn manage_connection_loss(&self, state: &mut ModuleState, family: &'static str) -> bool {
        let err = DeviceError::Unreachable { family };
        warn!(family, "device link lost, attempting reconnection");
        self.log.warning(format!("{err}, attempting to reconnect."));
        if !self.devices.hub.is_ready() {
            state.hub_state = CommStatus::Error;
            return false;
        }
        self.devices.hub.connect_links();
        state.links_state = CommStatus::Pending;
        true
    }
}

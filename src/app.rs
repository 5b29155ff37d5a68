//! Application facade.
//!
//! [`PolarizerApp`] owns the devices, the shared calibration offset, the scheduler task
//! and the operation lock, and exposes one method per operator command. Front ends (the
//! interactive console, the one-shot CLI subcommands, tests) only talk to this type.
//!
//! ## Resource rules
//!
//! - Calibration, setpoint seek and minimum search exclude each other ([`OperationLock`])
//! - Manual moves are refused while a seek or sweep owns the stage
//! - The minimum search suspends the scheduler for its whole duration and resumes it
//!   afterwards, whether or not the sweep succeeded
//! - Without an optical context the app runs rotator-only; optical features then fail
//!   with [`PolarizerError::OpticalContextUnavailable`]

use crate::calibrator::{CalibrationEvent, Calibrator};
use crate::config::{AppConfig, SweepSource};
use crate::error::{AppResult, PolarizerError};
use crate::exclusive::{Operation, OperationLock};
use crate::hardware::{JogDirection, OpticalContext, PowerSensor, PowerSource, Rotator};
use crate::minimum_finder::{MinimumFinder, MinimumReport};
use crate::offset::CalibrationOffset;
use crate::sampler::Sampler;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, Telemetry};
use crate::status::{StatusBoard, StatusMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Jog speed selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JogSpeed {
    /// One jog size
    #[default]
    Normal,
    /// `fast_jog_factor` jog sizes
    Fast,
}

/// Devices the application drives.
#[derive(Clone)]
pub struct Devices {
    /// Rotation stage
    pub rotator: Arc<dyn Rotator>,
    /// Power meter
    pub sensor: Arc<dyn PowerSensor>,
    /// Microscope, when one is attached
    pub optical: Option<Arc<dyn OpticalContext>>,
}

/// The running controller.
pub struct PolarizerApp {
    config: AppConfig,
    devices: Devices,
    offset: CalibrationOffset,
    lock: OperationLock,
    status: StatusBoard,
    scheduler: SchedulerHandle,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    jog_size: RwLock<f64>,
    calibration_cancel: Mutex<Option<watch::Sender<bool>>>,
    closed: AtomicBool,
}

impl PolarizerApp {
    /// Configure the devices and start sampling.
    ///
    /// # Errors
    /// A device that rejects its initial settings; the scheduler is not started then.
    pub async fn start(config: AppConfig, devices: Devices) -> AppResult<Self> {
        let status = StatusBoard::default();
        let offset = CalibrationOffset::default();
        let lock = OperationLock::new();

        devices
            .sensor
            .set_wavelength(config.sensor.wavelength_nm)
            .await?;
        devices
            .rotator
            .set_jog_step(config.rotator.jog_step_deg)
            .await?;
        let initial_angle = devices.rotator.angle().await?;

        match &devices.optical {
            None => status.warn("No optical context, running in rotator-only mode"),
            Some(_) => {
                if let Err(err) = config.optical.ensure_complete() {
                    status.warn(format!(
                        "{err}; set them in the config file to enable microscope features"
                    ));
                }
            }
        }

        let (scheduler, scheduler_task) = Scheduler::spawn(
            Sampler::new(devices.sensor.clone(), offset.clone()),
            devices.rotator.clone(),
            SchedulerConfig {
                sampler_period: config.sampler.period,
                controller: config.controller.clone(),
                setpoint_mw: 0.0,
            },
            lock.clone(),
            status.clone(),
        );
        scheduler.report_angle(initial_angle).await?;
        info!(
            name = %config.application.name,
            angle_deg = initial_angle,
            sensor = devices.sensor.name(),
            "application started"
        );

        Ok(Self {
            jog_size: RwLock::new(config.rotator.jog_step_deg),
            config,
            devices,
            offset,
            lock,
            status,
            scheduler,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            calibration_cancel: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Shared calibration offset
    pub fn offset(&self) -> &CalibrationOffset {
        &self.offset
    }

    /// Scheduler handle
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Latest telemetry
    pub fn telemetry(&self) -> Telemetry {
        self.scheduler.telemetry()
    }

    /// Status board (to post or subscribe)
    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    /// Receive status messages from now on
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusMessage> {
        self.status.subscribe()
    }

    /// Operation currently holding the devices
    pub fn active_operation(&self) -> Option<Operation> {
        self.lock.active()
    }

    /// Whether the optical context is connected
    pub fn optical_connected(&self) -> bool {
        self.devices
            .optical
            .as_ref()
            .is_some_and(|optical| optical.is_connected())
    }

    /// Current operator jog size (degrees)
    pub async fn jog_size(&self) -> f64 {
        *self.jog_size.read().await
    }

    async fn moved(&self) -> AppResult<f64> {
        let angle = self.devices.rotator.angle().await?;
        self.scheduler.report_angle(angle).await?;
        Ok(angle)
    }

    /// Jog one step; `Fast` multiplies the jog size by `fast_jog_factor`.
    pub async fn jog(&self, direction: JogDirection, speed: JogSpeed) -> AppResult<f64> {
        self.lock.ensure_stage_free()?;
        let factor = match speed {
            JogSpeed::Normal => 1.0,
            JogSpeed::Fast => self.config.rotator.fast_jog_factor,
        };
        let step = factor * self.jog_size().await;
        self.devices.rotator.set_jog_step(step).await?;
        self.devices.rotator.jog(direction).await?;
        let angle = self.moved().await?;
        debug!(%direction, step, angle, "jogged");
        Ok(angle)
    }

    /// Move to the home position
    pub async fn go_home(&self) -> AppResult<f64> {
        self.lock.ensure_stage_free()?;
        self.devices.rotator.home().await?;
        let angle = self.moved().await?;
        self.status.info(format!("Moved HOME to: {angle}"));
        Ok(angle)
    }

    /// Move to an absolute angle
    pub async fn jump_to_angle(&self, angle_deg: f64) -> AppResult<f64> {
        self.lock.ensure_stage_free()?;
        self.devices.rotator.set_angle(angle_deg).await?;
        let angle = self.moved().await?;
        self.status.info(format!("Moved to: {angle}"));
        Ok(angle)
    }

    /// Make the current position the new home; returns the stored offset
    pub async fn set_current_as_home(&self) -> AppResult<f64> {
        self.lock.ensure_stage_free()?;
        let angle_shift = self.devices.rotator.angle().await?;
        let old_home = self.devices.rotator.home_offset().await?;
        let new_home = old_home + angle_shift;
        self.devices.rotator.set_home_offset(new_home).await?;
        self.moved().await?;
        self.status.info(format!("New home is set to: {new_home}"));
        Ok(new_home)
    }

    /// Change the setpoint (mW)
    pub async fn set_setpoint(&self, setpoint_mw: f64) -> AppResult<()> {
        if !setpoint_mw.is_finite() {
            return Err(PolarizerError::Configuration(format!(
                "setpoint must be a finite number, got {setpoint_mw}"
            )));
        }
        self.scheduler.set_setpoint(setpoint_mw).await
    }

    /// Change the operator jog size (degrees)
    pub async fn set_jog_size(&self, step_deg: f64) -> AppResult<()> {
        if !(step_deg.is_finite() && step_deg > 0.0) {
            return Err(PolarizerError::Configuration(format!(
                "jog size must be positive, got {step_deg}"
            )));
        }
        *self.jog_size.write().await = step_deg;
        Ok(())
    }

    /// Start a background zero-offset calibration.
    ///
    /// Progress and the result are posted to the status board. The returned task
    /// resolves to the stored offset once the run ends.
    ///
    /// # Errors
    /// `Busy` when a seek or sweep is running.
    pub async fn start_calibration(&self) -> AppResult<JoinHandle<AppResult<f64>>> {
        let guard = self.lock.try_acquire(Operation::Calibration)?;
        let handle = Calibrator::new(
            self.devices.sensor.clone(),
            self.offset.clone(),
            self.config.calibration.clone(),
        )
        .with_guard(guard)
        .spawn();
        let (mut events, cancel, task) = handle.into_parts();
        *self.calibration_cancel.lock().await = Some(cancel);

        let status = self.status.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event {
                    CalibrationEvent::Failed(_) => status.error(event.message()),
                    _ => status.info(event.message()),
                }
            }
            match task.await {
                Ok(result) => result,
                Err(join) => Err(PolarizerError::unreachable(
                    "calibrator",
                    format!("calibration task ended abnormally: {join}"),
                )),
            }
        }))
    }

    /// Cancel a running calibration; false when none was running
    pub async fn cancel_calibration(&self) -> bool {
        match self.calibration_cancel.lock().await.take() {
            Some(cancel) if self.lock.active() == Some(Operation::Calibration) => {
                cancel.send(true).is_ok()
            }
            _ => false,
        }
    }

    /// Start seeking the setpoint; `None` keeps the current setpoint
    pub async fn seek_setpoint(&self, setpoint_mw: Option<f64>) -> AppResult<u64> {
        if let Some(setpoint) = setpoint_mw {
            if !setpoint.is_finite() {
                return Err(PolarizerError::Configuration(format!(
                    "setpoint must be a finite number, got {setpoint}"
                )));
            }
        }
        self.scheduler.seek_setpoint(setpoint_mw).await
    }

    /// Stop a running seek; false when none was running
    pub async fn cancel_seek(&self) -> AppResult<bool> {
        self.scheduler.cancel_seek().await
    }

    fn sweep_source(&self) -> AppResult<PowerSource> {
        match self.config.sweep.source {
            SweepSource::PowerSensor => Ok(PowerSource::Sensor(self.devices.sensor.clone())),
            SweepSource::Optical => match &self.devices.optical {
                Some(optical) if optical.is_connected() => {
                    Ok(PowerSource::Optical(optical.clone()))
                }
                _ => Err(PolarizerError::OpticalContextUnavailable),
            },
        }
    }

    /// Sweep for the transmission minimum and re-home on it.
    ///
    /// Sampling is suspended for the whole sweep and resumed afterwards, also on error.
    pub async fn find_minimum(&self) -> AppResult<MinimumReport> {
        let source = self.sweep_source()?;
        let _guard = self.lock.try_acquire(Operation::MinimumSearch)?;

        self.scheduler.suspend().await?;
        self.status.info("Searching for the power minimum");
        let result = MinimumFinder::new(self.config.sweep.clone())
            .run(self.devices.rotator.as_ref(), &source)
            .await;

        if let Err(err) = self.scheduler.resume().await {
            warn!(error = %err, "could not resume sampling after the sweep");
        }
        match self.devices.rotator.angle().await {
            Ok(angle) => {
                if let Err(err) = self.scheduler.report_angle(angle).await {
                    warn!(error = %err, "could not publish the angle after the sweep");
                }
            }
            Err(err) => warn!(error = %err, "could not read the angle after the sweep"),
        }

        match &result {
            Ok(report) => self
                .status
                .info(format!("New home offset: {}", report.new_home_offset)),
            Err(err) => self.status.error(format!("Minimum search aborted: {err}")),
        }
        result
    }

    /// Connect or disconnect the optical context; returns the new connection state.
    ///
    /// # Errors
    /// - `OpticalContextUnavailable` in rotator-only mode
    /// - `ConfigurationIncomplete` while placeholders remain in the optical settings
    /// - `ConnectionFailed` / `ConnectionRefused` from the server
    pub async fn toggle_optical(&self) -> AppResult<bool> {
        let optical = self
            .devices
            .optical
            .as_ref()
            .ok_or(PolarizerError::OpticalContextUnavailable)?;

        if optical.is_connected() {
            optical.disconnect().await?;
            self.status.info("Disconnected from microscope");
            return Ok(false);
        }

        self.config.optical.ensure_complete()?;
        match optical.connect(&self.config.optical).await {
            Ok(()) => {
                self.status.info("Connected to microscope");
                Ok(true)
            }
            Err(err) => {
                self.status.error(format!("Microscope connection failed: {err}"));
                Err(err)
            }
        }
    }

    /// Read the optical context's energy sensor
    pub async fn energy_sensor(&self) -> AppResult<f64> {
        match &self.devices.optical {
            Some(optical) if optical.is_connected() => optical.energy_sensor().await,
            _ => Err(PolarizerError::OpticalContextUnavailable),
        }
    }

    /// Stop the scheduler and close every device.
    ///
    /// Each device is closed independently. `AlreadyClosed` is logged; other failures
    /// are collected into `ShutdownFailed`. Calling this again is a no-op.
    pub async fn shutdown(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("shutdown already done");
            return Ok(());
        }
        info!("shutting down");

        if let Some(cancel) = self.calibration_cancel.lock().await.take() {
            let _ = cancel.send(true);
        }
        if self.scheduler.shutdown().await.is_ok() {
            if let Some(task) = self.scheduler_task.lock().await.take() {
                if let Err(err) = task.await {
                    warn!(error = %err, "scheduler task ended abnormally");
                }
            }
        }

        let mut failures = Vec::new();
        for (device, result) in [
            ("rotator", self.devices.rotator.close().await),
            ("power sensor", self.devices.sensor.close().await),
        ] {
            match result {
                Ok(()) => info!(device, "closed"),
                Err(err) if err.is_already_closed() => info!(device, "{err}"),
                Err(err) => {
                    warn!(device, error = %err, "could not be closed");
                    failures.push(err);
                }
            }
        }

        if let Some(optical) = &self.devices.optical {
            if optical.is_connected() {
                if let Err(err) = optical.disconnect().await {
                    warn!(error = %err, "microscope disconnect failed");
                    failures.push(err);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PolarizerError::ShutdownFailed(failures))
        }
    }
}

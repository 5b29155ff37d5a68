//! Periodic scheduler for sampling and setpoint correction.
//!
//! A single tokio task owns the periodic slot. On every tick it dispatches to the handler
//! of the active [`ControllerMode`]:
//!
//! - `Idle`: one offset-corrected sensor poll (sampler period, 1 s by default)
//! - `ProportionalCorrecting`: one controller step (controller period, 2 s by default),
//!   followed by a single-shot settle deadline and a fresh convergence check
//!
//! Ticks are handled one at a time inside the task, so device I/O never overlaps; a tick
//! that comes due while the previous one is still talking to a device is skipped
//! (`MissedTickBehavior::Skip`), never queued.
//!
//! # Message Flow
//!
//! ```text
//! SchedulerHandle ──SchedulerCommand──▶ scheduler task ──Telemetry (watch)──▶ observers
//!                                             │
//!                                             └──StatusMessage (broadcast)──▶ operator
//! ```

use crate::config::ControllerConfig;
use crate::controller::{ControllerState, ProportionalController, SettleCheck};
use crate::error::{AppResult, PolarizerError};
use crate::exclusive::{Operation, OperationGuard, OperationLock};
use crate::hardware::Rotator;
use crate::sampler::{Sampler, SensorReading};
use crate::status::StatusBoard;
use serde::Serialize;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, instrument, warn};

/// Which handler owns the periodic slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ControllerMode {
    /// Plain sampling at the sampler period
    #[default]
    Idle,
    /// Stepping toward the setpoint at the controller period
    ProportionalCorrecting,
}

/// How a setpoint seek ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SeekOutcome {
    /// Post-settle |error| fell below the threshold
    Converged {
        /// Corrected reading at convergence (mW)
        reading_mw: f64,
        /// Angle at convergence (degrees)
        angle_deg: f64,
        /// Steps applied
        steps: u32,
    },
    /// Stopped by the operator (or by a suspend)
    Cancelled {
        /// Steps applied before stopping
        steps: u32,
    },
    /// A device failed during a step or check
    Failed {
        /// Failure description
        reason: String,
        /// Steps applied before the failure
        steps: u32,
    },
}

/// Latest state published by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    /// Active mode
    pub mode: ControllerMode,
    /// Controller sub-state
    pub controller_state: ControllerState,
    /// Current setpoint (mW)
    pub setpoint_mw: f64,
    /// Most recent successful reading
    pub reading: Option<SensorReading>,
    /// Most recently reported stage angle (degrees)
    pub angle_deg: Option<f64>,
    /// Steps applied in the current or last seek
    pub steps_taken: u32,
    /// Seeks started since start-up
    pub seeks_started: u64,
    /// Seeks finished since start-up
    pub seeks_finished: u64,
    /// Outcome of the last finished seek
    pub last_seek: Option<SeekOutcome>,
    /// Ticks issue no device I/O while true
    pub suspended: bool,
    /// Last failed sample, cleared by the next good one
    pub last_error: Option<String>,
}

/// Scheduler timing and tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of plain sampling
    pub sampler_period: Duration,
    /// Controller tuning and its cadence
    pub controller: ControllerConfig,
    /// Initial setpoint (mW)
    pub setpoint_mw: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sampler_period: Duration::from_millis(1000),
            controller: ControllerConfig::default(),
            setpoint_mw: 0.0,
        }
    }
}

/// Commands accepted by the scheduler task.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Change the setpoint; a running seek picks it up on its next step
    SetSetpoint(f64),
    /// Start a setpoint seek
    ///
    /// # Response
    /// - `Ok(n)`: seek number `n` started
    /// - `Err(Busy)`: another operation holds the stage
    SeekSetpoint {
        /// Setpoint to use, or keep the current one
        setpoint_mw: Option<f64>,
        /// Response channel
        response: oneshot::Sender<AppResult<u64>>,
    },
    /// Return to Idle; replies whether a seek was running
    Cancel {
        /// Response channel
        response: oneshot::Sender<bool>,
    },
    /// Stop issuing device I/O; replies once the in-flight tick has finished
    Suspend {
        /// Response channel
        response: oneshot::Sender<()>,
    },
    /// Resume sampling at the sampler period
    Resume,
    /// Record an angle read back after a manual move
    AngleChanged(f64),
    /// Stop the task
    Shutdown,
}

/// Cloneable handle for talking to the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    telemetry: watch::Receiver<Telemetry>,
}

impl SchedulerHandle {
    async fn send(&self, command: SchedulerCommand) -> AppResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PolarizerError::SchedulerStopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> AppResult<T> {
        let (response, reply) = oneshot::channel();
        self.send(build(response)).await?;
        reply.await.map_err(|_| PolarizerError::SchedulerStopped)
    }

    /// Change the setpoint
    pub async fn set_setpoint(&self, setpoint_mw: f64) -> AppResult<()> {
        self.send(SchedulerCommand::SetSetpoint(setpoint_mw)).await
    }

    /// Start a seek and return its sequence number
    pub async fn seek_setpoint(&self, setpoint_mw: Option<f64>) -> AppResult<u64> {
        self.request(|response| SchedulerCommand::SeekSetpoint {
            setpoint_mw,
            response,
        })
        .await?
    }

    /// Cancel a running seek; false when none was running
    pub async fn cancel_seek(&self) -> AppResult<bool> {
        self.request(|response| SchedulerCommand::Cancel { response })
            .await
    }

    /// Stop device I/O until [`resume`](Self::resume)
    pub async fn suspend(&self) -> AppResult<()> {
        self.request(|response| SchedulerCommand::Suspend { response })
            .await
    }

    /// Resume sampling
    pub async fn resume(&self) -> AppResult<()> {
        self.send(SchedulerCommand::Resume).await
    }

    /// Publish an angle read after a manual move
    pub async fn report_angle(&self, angle_deg: f64) -> AppResult<()> {
        self.send(SchedulerCommand::AngleChanged(angle_deg)).await
    }

    /// Ask the task to stop
    pub async fn shutdown(&self) -> AppResult<()> {
        self.send(SchedulerCommand::Shutdown).await
    }

    /// Latest telemetry snapshot
    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.borrow().clone()
    }

    /// Watch telemetry updates
    pub fn subscribe(&self) -> watch::Receiver<Telemetry> {
        self.telemetry.clone()
    }

    /// Wait until seek number `seek` has finished and return its outcome
    pub async fn wait_for_seek(&self, seek: u64) -> AppResult<SeekOutcome> {
        let mut telemetry = self.telemetry.clone();
        let snapshot = telemetry
            .wait_for(|t| t.seeks_finished >= seek && t.last_seek.is_some())
            .await
            .map_err(|_| PolarizerError::SchedulerStopped)?;
        snapshot
            .last_seek
            .clone()
            .ok_or(PolarizerError::SchedulerStopped)
    }

    /// Whether the task is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Timer changes requested by a handler.
enum Timing {
    Keep,
    Sampling,
    Correcting,
    Settle,
}

/// Spawns the scheduler task.
pub struct Scheduler;

impl Scheduler {
    /// Start sampling `sampler` and return the handle plus the task.
    pub fn spawn(
        sampler: Sampler,
        rotator: Arc<dyn Rotator>,
        config: SchedulerConfig,
        lock: OperationLock,
        status: StatusBoard,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (telemetry_tx, telemetry_rx) = watch::channel(Telemetry {
            setpoint_mw: config.setpoint_mw,
            ..Telemetry::default()
        });

        let task = SchedulerTask {
            sampler,
            rotator,
            controller: ProportionalController::new(config.controller.clone()),
            config,
            lock,
            status,
            telemetry: telemetry_tx,
            seek_guard: None,
        };
        let handle = tokio::spawn(task.run(command_rx));

        (
            SchedulerHandle {
                commands: command_tx,
                telemetry: telemetry_rx,
            },
            handle,
        )
    }
}

struct SchedulerTask {
    sampler: Sampler,
    rotator: Arc<dyn Rotator>,
    controller: ProportionalController,
    config: SchedulerConfig,
    lock: OperationLock,
    status: StatusBoard,
    telemetry: watch::Sender<Telemetry>,
    seek_guard: Option<OperationGuard>,
}

fn periodic(period: Duration, first_tick: Instant) -> Interval {
    let mut ticker = interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn settle_elapsed(settle: &mut Option<Pin<Box<Sleep>>>) {
    match settle {
        Some(deadline) => deadline.as_mut().await,
        None => pending().await,
    }
}

impl SchedulerTask {
    fn mode(&self) -> ControllerMode {
        self.telemetry.borrow().mode
    }

    fn setpoint(&self) -> f64 {
        self.telemetry.borrow().setpoint_mw
    }

    fn suspended(&self) -> bool {
        self.telemetry.borrow().suspended
    }

    #[instrument(skip_all, name = "scheduler")]
    async fn run(mut self, mut commands: mpsc::Receiver<SchedulerCommand>) {
        let sampler_period = self.config.sampler_period;
        let controller_period = self.config.controller.period;
        let mut ticker = periodic(sampler_period, Instant::now());
        let mut settle: Option<Pin<Box<Sleep>>> = None;
        info!(period = ?sampler_period, "sampling started");

        loop {
            let timing = tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(SchedulerCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                _ = settle_elapsed(&mut settle) => {
                    settle = None;
                    self.on_settled().await
                }
                _ = ticker.tick() => self.on_tick().await,
            };

            match timing {
                Timing::Keep => {}
                Timing::Sampling => {
                    settle = None;
                    ticker = periodic(sampler_period, Instant::now() + sampler_period);
                }
                Timing::Correcting => {
                    settle = None;
                    ticker = periodic(controller_period, Instant::now() + controller_period);
                }
                Timing::Settle => {
                    settle = Some(Box::pin(sleep(self.config.controller.settle)));
                }
            }
        }

        if self.mode() == ControllerMode::ProportionalCorrecting {
            self.finish_seek(SeekOutcome::Cancelled {
                steps: self.controller.steps_taken(),
            });
        }
        info!("scheduler stopped");
    }

    async fn handle_command(&mut self, command: SchedulerCommand) -> Timing {
        match command {
            SchedulerCommand::SetSetpoint(setpoint_mw) => {
                self.telemetry.send_modify(|t| t.setpoint_mw = setpoint_mw);
                debug!(setpoint_mw, "setpoint changed");
                Timing::Keep
            }
            SchedulerCommand::SeekSetpoint {
                setpoint_mw,
                response,
            } => {
                let (result, timing) = self.start_seek(setpoint_mw);
                let _ = response.send(result);
                timing
            }
            SchedulerCommand::Cancel { response } => {
                let was_seeking = self.mode() == ControllerMode::ProportionalCorrecting;
                if was_seeking {
                    self.finish_seek(SeekOutcome::Cancelled {
                        steps: self.controller.steps_taken(),
                    });
                    self.status.info("Setpoint seek cancelled");
                }
                let _ = response.send(was_seeking);
                if was_seeking {
                    Timing::Sampling
                } else {
                    Timing::Keep
                }
            }
            SchedulerCommand::Suspend { response } => {
                let timing = if self.mode() == ControllerMode::ProportionalCorrecting {
                    self.finish_seek(SeekOutcome::Cancelled {
                        steps: self.controller.steps_taken(),
                    });
                    self.status.warn("Setpoint seek interrupted");
                    Timing::Sampling
                } else {
                    Timing::Keep
                };
                self.telemetry.send_modify(|t| t.suspended = true);
                debug!("sampling suspended");
                let _ = response.send(());
                timing
            }
            SchedulerCommand::Resume => {
                if !self.suspended() {
                    return Timing::Keep;
                }
                self.telemetry.send_modify(|t| t.suspended = false);
                debug!("sampling resumed");
                Timing::Sampling
            }
            SchedulerCommand::AngleChanged(angle_deg) => {
                self.telemetry.send_modify(|t| t.angle_deg = Some(angle_deg));
                Timing::Keep
            }
            // Handled by the loop
            SchedulerCommand::Shutdown => Timing::Keep,
        }
    }

    fn start_seek(&mut self, setpoint_mw: Option<f64>) -> (AppResult<u64>, Timing) {
        if self.suspended() {
            let active = self.lock.active().unwrap_or(Operation::MinimumSearch);
            return (
                Err(PolarizerError::Busy {
                    requested: Operation::SetpointSeek,
                    active,
                }),
                Timing::Keep,
            );
        }
        let guard = match self.lock.try_acquire(Operation::SetpointSeek) {
            Ok(guard) => guard,
            Err(err) => return (Err(err), Timing::Keep),
        };
        self.seek_guard = Some(guard);
        self.controller.begin();

        let mut seek = 0;
        self.telemetry.send_modify(|t| {
            if let Some(setpoint_mw) = setpoint_mw {
                t.setpoint_mw = setpoint_mw;
            }
            t.mode = ControllerMode::ProportionalCorrecting;
            t.controller_state = ControllerState::Stepping;
            t.steps_taken = 0;
            t.seeks_started += 1;
            seek = t.seeks_started;
        });
        info!(seek, setpoint_mw = self.setpoint(), "setpoint seek started");
        self.status
            .info(format!("Seeking setpoint {} mW", self.setpoint()));
        (Ok(seek), Timing::Correcting)
    }

    fn finish_seek(&mut self, outcome: SeekOutcome) {
        self.controller.cancel();
        self.seek_guard = None;
        self.telemetry.send_modify(|t| {
            t.mode = ControllerMode::Idle;
            t.controller_state = ControllerState::Idle;
            t.seeks_finished = t.seeks_started;
            t.last_seek = Some(outcome);
        });
    }

    async fn on_tick(&mut self) -> Timing {
        if self.suspended() {
            return Timing::Keep;
        }
        match self.mode() {
            ControllerMode::Idle => {
                self.sample().await;
                Timing::Keep
            }
            ControllerMode::ProportionalCorrecting => self.step().await,
        }
    }

    async fn sample(&mut self) {
        match self.sampler.sample(self.setpoint()).await {
            Ok(reading) => self.telemetry.send_modify(|t| {
                t.reading = Some(reading);
                t.last_error = None;
            }),
            Err(err) => {
                warn!(error = %err, "sample failed");
                let message = err.to_string();
                let changed =
                    self.telemetry.borrow().last_error.as_deref() != Some(message.as_str());
                if changed {
                    self.status.error(format!("Sensor read failed: {message}"));
                }
                self.telemetry.send_modify(|t| t.last_error = Some(message));
            }
        }
    }

    async fn step(&mut self) -> Timing {
        let setpoint = self.setpoint();
        match self
            .controller
            .on_tick(&self.sampler, self.rotator.as_ref(), setpoint)
            .await
        {
            Ok(Some(report)) => {
                let steps = self.controller.steps_taken();
                self.telemetry.send_modify(|t| {
                    t.reading = Some(report.reading);
                    t.angle_deg = Some(report.angle_deg);
                    t.steps_taken = steps;
                    t.controller_state = ControllerState::Settling;
                });
                Timing::Settle
            }
            Ok(None) => Timing::Keep,
            Err(err) => self.abort_seek(err),
        }
    }

    async fn on_settled(&mut self) -> Timing {
        if self.mode() != ControllerMode::ProportionalCorrecting {
            return Timing::Keep;
        }
        let setpoint = self.setpoint();
        match self
            .controller
            .on_settled(&self.sampler, self.rotator.as_ref(), setpoint)
            .await
        {
            Ok(SettleCheck::Converged { reading, angle_deg }) => {
                self.telemetry.send_modify(|t| {
                    t.reading = Some(reading);
                    t.angle_deg = Some(angle_deg);
                });
                self.finish_seek(SeekOutcome::Converged {
                    reading_mw: reading.corrected_mw,
                    angle_deg,
                    steps: self.controller.steps_taken(),
                });
                self.status
                    .info(format!("Setpoint reached! P={}", reading.corrected_mw));
                Timing::Sampling
            }
            Ok(SettleCheck::Continue { reading, angle_deg }) => {
                self.telemetry.send_modify(|t| {
                    t.reading = Some(reading);
                    t.angle_deg = Some(angle_deg);
                    t.controller_state = ControllerState::Stepping;
                });
                Timing::Keep
            }
            Err(err) => self.abort_seek(err),
        }
    }

    fn abort_seek(&mut self, err: PolarizerError) -> Timing {
        warn!(error = %err, "setpoint seek aborted");
        self.status.error(format!("Setpoint seek aborted: {err}"));
        self.finish_seek(SeekOutcome::Failed {
            reason: err.to_string(),
            steps: self.controller.steps_taken(),
        });
        Timing::Sampling
    }
}

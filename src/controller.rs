//! Proportional setpoint controller.
//!
//! Alternates between stepping the stage by a clamped proportional correction and
//! re-checking the error after a settle delay:
//!
//! ```text
//!   Idle ──begin──▶ Stepping ──tick: shift stage──▶ Settling
//!                      ▲                               │
//!                      └──── |error| ≥ threshold ──────┤ settle expired: fresh read
//!   Idle ◀──────────────── |error| < threshold ────────┘
//! ```
//!
//! The controller owns no timers; [`crate::scheduler`] drives it from its tick and
//! settle deadlines. Convergence is only ever judged from the read taken after settling.

use crate::config::{ClampMode, ControllerConfig};
use crate::error::{AppResult, PolarizerError};
use crate::hardware::Rotator;
use crate::sampler::{Sampler, SensorReading};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, trace};

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ControllerState {
    /// Not correcting
    #[default]
    Idle,
    /// Waiting for the next periodic tick to apply a step
    Stepping,
    /// A step was applied; waiting for the settle deadline
    Settling,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Idle => f.write_str("idle"),
            ControllerState::Stepping => f.write_str("stepping"),
            ControllerState::Settling => f.write_str("settling"),
        }
    }
}

/// Clamped proportional step in degrees for an error in milliwatts.
///
/// `Symmetric` bounds the magnitude to `max_step_deg` in both directions; `UpperOnly`
/// caps positive steps and lets negative ones through unbounded.
pub fn proportional_step(error_mw: f64, gain: f64, max_step_deg: f64, clamp: ClampMode) -> f64 {
    let raw = error_mw * gain;
    match clamp {
        ClampMode::Symmetric => raw.clamp(-max_step_deg, max_step_deg),
        ClampMode::UpperOnly => raw.min(max_step_deg),
    }
}

/// What one step did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Reading the step was computed from
    pub reading: SensorReading,
    /// Commanded relative move (degrees)
    pub step_deg: f64,
    /// Angle reported after the move (degrees)
    pub angle_deg: f64,
}

/// Result of the post-settle check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettleCheck {
    /// |error| fell below the threshold; the controller is Idle
    Converged {
        /// Post-settle reading
        reading: SensorReading,
        /// Angle at convergence (degrees)
        angle_deg: f64,
    },
    /// Still outside the threshold; another step follows on the next tick
    Continue {
        /// Post-settle reading
        reading: SensorReading,
        /// Current angle (degrees)
        angle_deg: f64,
    },
}

/// Stepping state machine for one seek at a time.
#[derive(Debug, Clone)]
pub struct ProportionalController {
    config: ControllerConfig,
    state: ControllerState,
    steps_taken: u32,
}

impl ProportionalController {
    /// Controller with the given tuning
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            state: ControllerState::Idle,
            steps_taken: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Tuning in use
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Steps applied in the current (or last) seek
    pub fn steps_taken(&self) -> u32 {
        self.steps_taken
    }

    /// Whether the threshold test passes for `error_mw`
    pub fn is_converged(&self, error_mw: f64) -> bool {
        error_mw.abs() < self.config.threshold_mw
    }

    /// Idle → Stepping. Restarts the step count.
    pub fn begin(&mut self) {
        self.state = ControllerState::Stepping;
        self.steps_taken = 0;
        debug!(
            gain = self.config.gain,
            max_step_deg = self.config.max_step_deg,
            "proportional correction started"
        );
    }

    /// Back to Idle from any state. Nothing is commanded.
    pub fn cancel(&mut self) {
        if self.state != ControllerState::Idle {
            debug!(state = %self.state, "proportional correction stopped");
        }
        self.state = ControllerState::Idle;
    }

    /// Apply one step on a periodic tick.
    ///
    /// Returns `Ok(None)` when the tick is not for stepping (Idle, or still Settling).
    ///
    /// # Errors
    /// A failed read or move aborts the seek and leaves the controller Idle.
    pub async fn on_tick(
        &mut self,
        sampler: &Sampler,
        rotator: &dyn Rotator,
        setpoint_mw: f64,
    ) -> AppResult<Option<StepReport>> {
        if self.state != ControllerState::Stepping {
            trace!(state = %self.state, "tick ignored");
            return Ok(None);
        }

        let result = self.step(sampler, rotator, setpoint_mw).await;
        if result.is_err() {
            self.cancel();
        }
        result.map(Some)
    }

    async fn step(
        &mut self,
        sampler: &Sampler,
        rotator: &dyn Rotator,
        setpoint_mw: f64,
    ) -> AppResult<StepReport> {
        let reading = sampler.sample(setpoint_mw).await?;
        let step_deg = proportional_step(
            reading.error_mw,
            self.config.gain,
            self.config.max_step_deg,
            self.config.clamp,
        );
        let angle_deg = rotator.shift_angle(step_deg).await?;

        self.steps_taken += 1;
        self.state = ControllerState::Settling;
        debug!(
            step = self.steps_taken,
            error_mw = reading.error_mw,
            step_deg,
            angle_deg,
            "proportional step"
        );
        Ok(StepReport {
            reading,
            step_deg,
            angle_deg,
        })
    }

    /// Settle deadline expired: take a fresh reading and decide.
    ///
    /// # Errors
    /// `Cancelled` if the controller is not Settling; a failed read aborts the seek.
    pub async fn on_settled(
        &mut self,
        sampler: &Sampler,
        rotator: &dyn Rotator,
        setpoint_mw: f64,
    ) -> AppResult<SettleCheck> {
        if self.state != ControllerState::Settling {
            return Err(PolarizerError::Cancelled);
        }

        let checked = async {
            let reading = sampler.sample(setpoint_mw).await?;
            let angle_deg = rotator.angle().await?;
            Ok::<_, PolarizerError>((reading, angle_deg))
        }
        .await;

        let (reading, angle_deg) = match checked {
            Ok(values) => values,
            Err(err) => {
                self.cancel();
                return Err(err);
            }
        };

        if self.is_converged(reading.error_mw) {
            self.state = ControllerState::Idle;
            info!(
                reading_mw = reading.corrected_mw,
                angle_deg,
                steps = self.steps_taken,
                "setpoint reached"
            );
            Ok(SettleCheck::Converged { reading, angle_deg })
        } else {
            self.state = ControllerState::Stepping;
            Ok(SettleCheck::Continue { reading, angle_deg })
        }
    }
}

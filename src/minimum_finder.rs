//! Transmission-minimum search.
//!
//! Blocking sweep that re-zeroes the stage on the angle of lowest power:
//!
//! 1. reset the home offset to 0, home, dwell `settle_dwell`
//! 2. for each commanded angle (0°, 2°, ... 178° by default): move, dwell `step_dwell`,
//!    read the power source, record `(commanded, achieved, power)`
//! 3. pick the first index of minimum power, add its achieved angle to the home offset,
//!    store it, re-home and dwell `settle_dwell` again
//!
//! Any device failure aborts the sweep where it stands; the stage is not rolled back.
//! The caller is responsible for keeping other users off the stage and sensor meanwhile.

use crate::config::SweepConfig;
use crate::error::{AppResult, PolarizerError};
use crate::hardware::{PowerSource, Rotator};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// One sampled sweep position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepPoint {
    /// Angle that was commanded (degrees)
    pub commanded_deg: f64,
    /// Angle the stage reported reaching (degrees)
    pub achieved_deg: f64,
    /// Reading at that angle
    pub power: f64,
}

/// Ordered samples of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepResult {
    /// Points in sweep order
    pub points: Vec<SweepPoint>,
}

impl SweepResult {
    /// Index of the lowest reading
    pub fn minimum_index(&self) -> Option<usize> {
        argmin(self.points.iter().map(|p| p.power))
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether nothing was sampled
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// First index of the smallest value. NaN never wins.
pub fn argmin(values: impl IntoIterator<Item = f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, value) in values.into_iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, lowest)) if value >= lowest => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

/// Result of a completed search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinimumReport {
    /// All sampled points
    pub sweep: SweepResult,
    /// Index of the selected point
    pub minimum_index: usize,
    /// Home offset in effect while sweeping (degrees)
    pub start_home_offset: f64,
    /// Home offset stored on the stage (degrees)
    pub new_home_offset: f64,
    /// Angle reported after re-homing (degrees)
    pub final_angle: f64,
}

impl MinimumReport {
    /// The selected sweep point
    pub fn minimum(&self) -> Option<&SweepPoint> {
        self.sweep.points.get(self.minimum_index)
    }
}

/// Runs the sweep with a fixed configuration.
#[derive(Debug, Clone)]
pub struct MinimumFinder {
    config: SweepConfig,
}

impl MinimumFinder {
    /// Finder with the given sweep range and dwells
    pub fn new(config: SweepConfig) -> Self {
        Self { config }
    }

    /// Sweep configuration
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Run the full search against `rotator`, minimising `source`.
    ///
    /// # Errors
    /// - `DeviceUnreachable` from any move or read; the stage stays where it was
    /// - `Configuration` when the sweep range is invalid or no reading is usable
    pub async fn run(&self, rotator: &dyn Rotator, source: &PowerSource) -> AppResult<MinimumReport> {
        let angles = self.config.angles()?;
        info!(points = angles.len(), source = source.label(), "minimum search started");

        rotator.set_home_offset(0.0).await?;
        rotator.home().await?;
        sleep(self.config.settle_dwell).await;
        let start_home_offset = rotator.home_offset().await?;

        let mut sweep = SweepResult {
            points: Vec::with_capacity(angles.len()),
        };
        for commanded_deg in angles {
            let achieved_deg = rotator.set_angle(commanded_deg).await.map_err(|err| {
                warn!(commanded_deg, error = %err, "sweep aborted");
                err
            })?;
            sleep(self.config.step_dwell).await;
            let power = source.read().await.map_err(|err| {
                warn!(commanded_deg, error = %err, "sweep aborted");
                err
            })?;
            debug!(commanded_deg, achieved_deg, power, "sweep point");
            sweep.points.push(SweepPoint {
                commanded_deg,
                achieved_deg,
                power,
            });
        }

        let minimum_index = sweep.minimum_index().ok_or_else(|| {
            PolarizerError::Configuration("sweep produced no usable readings".to_string())
        })?;
        let shift = sweep.points[minimum_index].achieved_deg;
        let new_home_offset = rotator.home_offset().await? + shift;
        info!(minimum_index, new_home_offset, "minimum found");

        rotator.set_home_offset(new_home_offset).await?;
        rotator.home().await?;
        sleep(self.config.settle_dwell).await;
        let final_angle = rotator.angle().await?;
        info!(final_angle, "re-homed on minimum");

        Ok(MinimumReport {
            sweep,
            minimum_index,
            start_home_offset,
            new_home_offset,
            final_angle,
        })
    }
}

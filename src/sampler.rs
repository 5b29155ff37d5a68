//! Single-shot sensor polls.
//!
//! A sample is one `get_power` call corrected by the calibration offset. The periodic
//! scheduling lives in [`crate::scheduler`]; this module only knows how to take one
//! reading and what it means relative to the setpoint.

use crate::error::AppResult;
use crate::hardware::PowerSensor;
use crate::offset::CalibrationOffset;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::trace;

/// Latest-value sensor reading. No history is kept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    /// Power as reported by the device (mW)
    pub raw_mw: f64,
    /// Offset in effect when the sample was taken (mW)
    pub offset_mw: f64,
    /// `raw_mw - offset_mw`
    pub corrected_mw: f64,
    /// `setpoint - corrected_mw`
    pub error_mw: f64,
    /// Acquisition time
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    /// Build a reading from a raw value
    pub fn new(raw_mw: f64, offset_mw: f64, setpoint_mw: f64) -> Self {
        let corrected_mw = raw_mw - offset_mw;
        Self {
            raw_mw,
            offset_mw,
            corrected_mw,
            error_mw: control_error(setpoint_mw, corrected_mw),
            timestamp: Utc::now(),
        }
    }
}

/// `setpoint - corrected`
pub fn control_error(setpoint_mw: f64, corrected_mw: f64) -> f64 {
    setpoint_mw - corrected_mw
}

/// Takes offset-corrected readings from the shared power sensor.
#[derive(Clone)]
pub struct Sampler {
    sensor: Arc<dyn PowerSensor>,
    offset: CalibrationOffset,
}

impl Sampler {
    /// Sampler over a sensor and the shared offset
    pub fn new(sensor: Arc<dyn PowerSensor>, offset: CalibrationOffset) -> Self {
        Self { sensor, offset }
    }

    /// The sensor being polled
    pub fn sensor(&self) -> &Arc<dyn PowerSensor> {
        &self.sensor
    }

    /// The offset applied to each sample
    pub fn offset(&self) -> &CalibrationOffset {
        &self.offset
    }

    /// Acquire one reading and compute its error against `setpoint_mw`.
    ///
    /// # Errors
    /// Propagates the sensor failure; nothing is produced for a failed read.
    pub async fn sample(&self, setpoint_mw: f64) -> AppResult<SensorReading> {
        let raw = self.sensor.get_power().await?;
        let reading = SensorReading::new(raw, self.offset.load(), setpoint_mw);
        trace!(
            raw_mw = reading.raw_mw,
            corrected_mw = reading.corrected_mw,
            error_mw = reading.error_mw,
            "sample"
        );
        Ok(reading)
    }
}

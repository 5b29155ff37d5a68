//! Process-wide zero-offset shared between the calibrator and the sampling loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Baseline power subtracted from every live reading (mW).
///
/// The value is stored as raw `f64` bits in one atomic word, so a reader sees either the
/// old or the new offset, never a mix. Only a completed calibration writes it.
#[derive(Debug, Clone)]
pub struct CalibrationOffset {
    bits: Arc<AtomicU64>,
}

impl CalibrationOffset {
    /// Offset starting at `value_mw`
    pub fn new(value_mw: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(value_mw.to_bits())),
        }
    }

    /// Current offset
    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Replace the offset in one atomic store
    pub fn store(&self, value_mw: f64) {
        self.bits.store(value_mw.to_bits(), Ordering::Release);
    }

    /// Apply the offset to a raw reading
    pub fn correct(&self, raw_mw: f64) -> f64 {
        raw_mw - self.load()
    }
}

impl Default for CalibrationOffset {
    fn default() -> Self {
        Self::new(0.0)
    }
}

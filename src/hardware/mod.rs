//! Hardware layer
//!
//! Capability traits for the rotation mount, the power meter and the microscope, the
//! simulated bench used when no vendor drivers are linked, and USB discovery of the
//! rotator's serial adapter.

pub mod capabilities;
#[cfg(feature = "instrument_serial")]
pub mod discovery;
pub mod mock;

pub use capabilities::{JogDirection, OpticalContext, PowerSensor, PowerSource, Rotator};

//! Hardware Capabilities
//!
//! Small capability traits the control core is written against. Vendor drivers (the
//! Elliptec serial protocol, the power meter DLL, the microscope SDK) live behind these
//! seams; the core never talks to a device any other way.
//!
//! - A rotation mount implements [`Rotator`]
//! - A power meter implements [`PowerSensor`]
//! - The microscope server implements [`OpticalContext`]
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses [`AppResult`] so callers see the device error taxonomy
//! - Takes `&self`; implementations use interior mutability for state
//!
//! # Example
//!
//! ```rust,ignore
//! async fn center_on_home<R>(rotator: &R) -> AppResult<f64>
//! where
//!     R: Rotator + ?Sized,
//! {
//!     rotator.home().await?;
//!     rotator.angle().await
//! }
//! ```

use crate::config::OpticalConfig;
use crate::error::AppResult;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Direction of a jog move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogDirection {
    /// Increasing angle
    Forward,
    /// Decreasing angle
    Backward,
}

impl JogDirection {
    /// +1.0 for forward, -1.0 for backward.
    pub fn sign(self) -> f64 {
        match self {
            JogDirection::Forward => 1.0,
            JogDirection::Backward => -1.0,
        }
    }
}

impl fmt::Display for JogDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JogDirection::Forward => f.write_str("forward"),
            JogDirection::Backward => f.write_str("backward"),
        }
    }
}

impl FromStr for JogDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "forward" | "fwd" | "fw" | "+" => Ok(JogDirection::Forward),
            "backward" | "back" | "bw" | "-" => Ok(JogDirection::Backward),
            other => Err(format!("unknown jog direction '{other}'")),
        }
    }
}

/// Capability: Rotation Stage
///
/// A motorized rotation mount addressed in degrees relative to its home position.
///
/// # Contract
/// - Every method blocks for the whole physical move (hundreds of ms to seconds)
/// - Callers must not issue overlapping commands to one instance
/// - The angle is always read back from the device, never cached by callers
/// - `close` releases the link once; later calls return `AlreadyClosed`, and
///   commands issued after close fail with `DeviceUnreachable`
#[async_trait]
pub trait Rotator: Send + Sync {
    /// Current angle relative to home (degrees)
    async fn angle(&self) -> AppResult<f64>;

    /// Move to an absolute angle and return the angle actually reached
    async fn set_angle(&self, target_deg: f64) -> AppResult<f64>;

    /// Move by a relative amount and return the angle reached
    async fn shift_angle(&self, delta_deg: f64) -> AppResult<f64>;

    /// Configure the jog size (degrees)
    async fn set_jog_step(&self, step_deg: f64) -> AppResult<()>;

    /// Currently configured jog size (degrees)
    async fn jog_step(&self) -> AppResult<f64>;

    /// Move one jog step in `direction` and return the angle reached
    async fn jog(&self, direction: JogDirection) -> AppResult<f64>;

    /// Move to the position defined by the home offset and return the angle reached
    async fn home(&self) -> AppResult<f64>;

    /// Home offset stored in device memory (degrees)
    async fn home_offset(&self) -> AppResult<f64>;

    /// Store a new home offset in device memory (degrees)
    async fn set_home_offset(&self, offset_deg: f64) -> AppResult<()>;

    /// Release the underlying connection
    async fn close(&self) -> AppResult<()>;
}

/// Capability: Optical Power Sensor
///
/// A scalar instantaneous power reading in milliwatts.
///
/// # Contract
/// - `get_power` blocks for exactly one acquisition and is self-contained, so reads
///   from different tasks may interleave without corrupting each other
/// - Repeated reads at 1 Hz or faster need no warm-up
#[async_trait]
pub trait PowerSensor: Send + Sync {
    /// Human-readable device name (used in logs and status messages)
    fn name(&self) -> &str;

    /// Set the calibration wavelength (nanometres)
    async fn set_wavelength(&self, wavelength_nm: f64) -> AppResult<()>;

    /// Acquire one power reading (milliwatts)
    async fn get_power(&self) -> AppResult<f64>;

    /// Release the underlying connection
    async fn close(&self) -> AppResult<()>;
}

/// Capability: Optical Context
///
/// The microscope server that supplies an alternative energy-sensor reading.
#[async_trait]
pub trait OpticalContext: Send + Sync {
    /// Open the link using the configured host, fingerprint and driver path
    ///
    /// # Errors
    /// `ConnectionFailed` or `ConnectionRefused` when the server cannot be reached
    async fn connect(&self, config: &OpticalConfig) -> AppResult<()>;

    /// Close the link (no-op when not connected)
    async fn disconnect(&self) -> AppResult<()>;

    /// Whether the link is currently up
    fn is_connected(&self) -> bool;

    /// Current energy-sensor reading
    async fn energy_sensor(&self) -> AppResult<f64>;
}

/// Reading a sweep or monitor can be driven from.
#[derive(Clone)]
pub enum PowerSource {
    /// The attached power sensor (milliwatts)
    Sensor(Arc<dyn PowerSensor>),
    /// The microscope energy sensor
    Optical(Arc<dyn OpticalContext>),
}

impl PowerSource {
    /// Acquire one reading from the selected source
    pub async fn read(&self) -> AppResult<f64> {
        match self {
            PowerSource::Sensor(sensor) => sensor.get_power().await,
            PowerSource::Optical(context) => context.energy_sensor().await,
        }
    }

    /// Short label for logs
    pub fn label(&self) -> &str {
        match self {
            PowerSource::Sensor(sensor) => sensor.name(),
            PowerSource::Optical(_) => "energy sensor",
        }
    }
}

impl fmt::Debug for PowerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PowerSource").field(&self.label()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PolarizerError;
    use tokio::sync::Mutex;

    struct FixedSensor {
        value: Mutex<f64>,
    }

    #[async_trait]
    impl PowerSensor for FixedSensor {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn set_wavelength(&self, _wavelength_nm: f64) -> AppResult<()> {
            Ok(())
        }

        async fn get_power(&self) -> AppResult<f64> {
            Ok(*self.value.lock().await)
        }

        async fn close(&self) -> AppResult<()> {
            Err(PolarizerError::AlreadyClosed("fixed".into()))
        }
    }

    #[test]
    fn jog_direction_parses_aliases() {
        assert_eq!("fwd".parse::<JogDirection>(), Ok(JogDirection::Forward));
        assert_eq!("Backward".parse::<JogDirection>(), Ok(JogDirection::Backward));
        assert!("sideways".parse::<JogDirection>().is_err());
        assert_eq!(JogDirection::Backward.sign(), -1.0);
    }

    #[tokio::test]
    async fn power_source_reads_sensor() {
        let sensor: Arc<dyn PowerSensor> = Arc::new(FixedSensor {
            value: Mutex::new(3.25),
        });
        let source = PowerSource::Sensor(sensor);
        assert_eq!(source.read().await.unwrap(), 3.25);
        assert_eq!(source.label(), "fixed");
    }
}

//! Configuration System using Figment
//!
//! Strongly-typed configuration for the polarizer controller. Configuration is loaded from:
//! 1. a TOML file (default `config/polarizer.toml`)
//! 2. environment variables prefixed with `POLARIZER_`, using `__` between nested keys
//!    (e.g. `POLARIZER_CONTROLLER__GAIN=2.5`)
//!
//! Every section carries serde defaults, so a partial file (or no file at all) yields a
//! usable configuration. Durations are written in humantime form (`"1s"`, `"500ms"`).
//!
//! # Example
//! ```no_run
//! use polarizer_control::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Controller gain: {}", config.controller.gain);
//! # Ok::<(), polarizer_control::error::PolarizerError>(())
//! ```

use crate::error::{AppResult, PolarizerError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Value shipped in the template config for settings that must be filled in on site.
pub const PLACEHOLDER: &str = "CHANGEMEE";

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/polarizer.toml";

/// Upper bound on the points of one sweep (0.1° over a full turn).
pub const MAX_SWEEP_POINTS: usize = 3600;

/// Upper bound on the samples of one zero-offset calibration.
pub const MAX_CALIBRATION_AVERAGES: u32 = 10_000;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Periodic sensor sampling
    pub sampler: SamplerConfig,
    /// Proportional setpoint controller
    pub controller: ControllerConfig,
    /// Zero-offset calibration
    pub calibration: CalibrationConfig,
    /// Minimum-finding sweep
    pub sweep: SweepConfig,
    /// Rotation stage settings
    pub rotator: RotatorConfig,
    /// Power sensor settings
    pub sensor: SensorConfig,
    /// Microscope / optical-context connection
    pub optical: OpticalConfig,
    /// Simulated bench used when no hardware drivers are linked
    pub simulation: SimulationConfig,
}

/// Accepted values of `application.log_level`.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Line format of the log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, for reading a short session closely
    Pretty,
    /// One line per event, for the console
    #[default]
    Compact,
    /// One JSON object per event, for log collectors
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Polarizer Control".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

/// Sampler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Period between sensor reads while idle
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1000),
        }
    }
}

/// How the proportional step is limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampMode {
    /// Limit the magnitude in both directions
    #[default]
    Symmetric,
    /// Only cap positive steps (negative steps are unbounded)
    UpperOnly,
}

/// Proportional controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Degrees of rotation per milliwatt of error
    pub gain: f64,
    /// Largest rotation commanded in one step (degrees)
    pub max_step_deg: f64,
    /// Clamping rule applied to the raw step
    pub clamp: ClampMode,
    /// Convergence threshold on |error| (milliwatts)
    pub threshold_mw: f64,
    /// Step cadence while correcting
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Wait between a step and the convergence check
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::power_meter()
    }
}

impl ControllerConfig {
    /// Tuning used with the benchtop power meter: P=5, clamp 10°, 2 s cadence.
    pub fn power_meter() -> Self {
        Self {
            gain: 5.0,
            max_step_deg: 10.0,
            clamp: ClampMode::Symmetric,
            threshold_mw: 0.05,
            period: Duration::from_millis(2000),
            settle: Duration::from_millis(1000),
        }
    }

    /// Tuning used against the microscope energy sensor: P=10, clamp 20°, 1 s cadence.
    pub fn microscope() -> Self {
        Self {
            gain: 10.0,
            max_step_deg: 20.0,
            period: Duration::from_millis(1000),
            ..Self::power_meter()
        }
    }
}

/// Zero-offset calibration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Number of samples averaged
    pub averages: u32,
    /// Pause after each sample
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            averages: 10,
            delay: Duration::from_millis(500),
        }
    }
}

/// Reading the minimum search sweeps against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepSource {
    /// The directly attached power sensor
    #[default]
    PowerSensor,
    /// The optical context's energy sensor
    Optical,
}

/// Minimum-finding sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// First commanded angle (degrees)
    pub start_deg: f64,
    /// Sweep end, exclusive (degrees)
    pub stop_deg: f64,
    /// Increment between commanded angles (degrees)
    pub step_deg: f64,
    /// Dwell after each move before sampling
    #[serde(with = "humantime_serde")]
    pub step_dwell: Duration,
    /// Dwell after homing
    #[serde(with = "humantime_serde")]
    pub settle_dwell: Duration,
    /// Which reading is minimised
    pub source: SweepSource,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start_deg: 0.0,
            stop_deg: 180.0,
            step_deg: 2.0,
            step_dwell: Duration::from_secs(1),
            settle_dwell: Duration::from_secs(3),
            source: SweepSource::PowerSensor,
        }
    }
}

impl SweepConfig {
    /// Number of commanded angles.
    ///
    /// # Errors
    /// `Configuration` for a non-finite or empty range, a non-positive step, or more
    /// than [`MAX_SWEEP_POINTS`] points.
    pub fn point_count(&self) -> AppResult<usize> {
        if !(self.start_deg.is_finite() && self.stop_deg.is_finite()) {
            return Err(invalid("sweep.start_deg and sweep.stop_deg must be finite"));
        }
        if !positive(self.step_deg) {
            return Err(invalid("sweep.step_deg must be positive"));
        }
        let span = self.stop_deg - self.start_deg;
        if span <= 0.0 {
            return Err(invalid("sweep range is empty (stop_deg must exceed start_deg)"));
        }
        let count = (span / self.step_deg - 1e-9).ceil();
        if !count.is_finite() || count > MAX_SWEEP_POINTS as f64 {
            return Err(PolarizerError::Configuration(format!(
                "sweep has too many points ({count}); at most {MAX_SWEEP_POINTS} are allowed"
            )));
        }
        Ok(count as usize)
    }

    /// Commanded angles in sweep order.
    ///
    /// # Errors
    /// See [`point_count`](Self::point_count).
    pub fn angles(&self) -> AppResult<Vec<f64>> {
        let count = self.point_count()?;
        Ok((0..count)
            .map(|i| self.start_deg + i as f64 * self.step_deg)
            .collect())
    }
}

/// Rotation stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotatorConfig {
    /// Initial jog size (degrees)
    pub jog_step_deg: f64,
    /// Multiplier applied to the jog size for fast jogs
    pub fast_jog_factor: f64,
    /// USB vendor id of the serial adapter
    pub usb_vid: u16,
    /// USB product id of the serial adapter
    pub usb_pid: u16,
    /// Optional adapter serial number to pick one device among several
    pub serial_number: Option<String>,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            jog_step_deg: 1.0,
            fast_jog_factor: 3.0,
            usb_vid: 0x0403,
            usb_pid: 0x6015,
            serial_number: None,
        }
    }
}

/// Power sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Calibration wavelength (nanometres)
    pub wavelength_nm: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            wavelength_nm: 10_000.0,
        }
    }
}

/// Optical-context (microscope server) connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticalConfig {
    /// Server host name
    pub host: String,
    /// Authentication fingerprint
    pub fingerprint: String,
    /// Location of the client driver files
    pub path_to_dll: String,
}

impl Default for OpticalConfig {
    fn default() -> Self {
        Self {
            host: "nea-server".to_string(),
            fingerprint: PLACEHOLDER.to_string(),
            path_to_dll: PLACEHOLDER.to_string(),
        }
    }
}

impl OpticalConfig {
    /// Keys that still hold the placeholder (or nothing at all).
    pub fn placeholder_keys(&self) -> Vec<String> {
        [
            ("optical.host", &self.host),
            ("optical.fingerprint", &self.fingerprint),
            ("optical.path_to_dll", &self.path_to_dll),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty() || value.as_str() == PLACEHOLDER)
        .map(|(key, _)| key.to_string())
        .collect()
    }

    /// Refuse optical features until every connection parameter is filled in.
    ///
    /// # Errors
    /// `ConfigurationIncomplete` naming the offending keys.
    pub fn ensure_complete(&self) -> AppResult<()> {
        let missing = self.placeholder_keys();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PolarizerError::ConfigurationIncomplete(missing))
        }
    }
}

/// Parameters of the simulated bench
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Peak transmitted power (milliwatts)
    pub max_power_mw: f64,
    /// Power with the polarizer crossed (milliwatts)
    pub background_mw: f64,
    /// Physical angle of minimum transmission (degrees)
    pub extinction_deg: f64,
    /// Peak-to-peak reading noise (milliwatts)
    pub noise_mw: f64,
    /// Physical angle the stage starts at (degrees)
    pub start_deg: f64,
    /// Whether the simulated microscope is attached
    pub microscope: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_power_mw: 100.0,
            background_mw: 0.5,
            extinction_deg: 37.0,
            noise_mw: 0.01,
            start_deg: 60.0,
            microscope: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment overrides still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("POLARIZER_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML string (defaults fill the gaps)
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(PolarizerError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.sampler.period.is_zero() {
            return Err(invalid("sampler.period must be positive"));
        }

        let controller = &self.controller;
        if !positive(controller.gain) {
            return Err(invalid("controller.gain must be positive"));
        }
        if !positive(controller.max_step_deg) {
            return Err(invalid("controller.max_step_deg must be positive"));
        }
        if !positive(controller.threshold_mw) {
            return Err(invalid("controller.threshold_mw must be positive"));
        }
        if controller.period.is_zero() || controller.settle.is_zero() {
            return Err(invalid("controller.period and controller.settle must be positive"));
        }

        if !(1..=MAX_CALIBRATION_AVERAGES).contains(&self.calibration.averages) {
            return Err(PolarizerError::Configuration(format!(
                "calibration.averages must be between 1 and {MAX_CALIBRATION_AVERAGES}"
            )));
        }

        self.sweep.point_count()?;

        if !positive(self.rotator.jog_step_deg) || !positive(self.rotator.fast_jog_factor) {
            return Err(invalid("rotator.jog_step_deg and rotator.fast_jog_factor must be positive"));
        }

        Ok(())
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn invalid(message: &str) -> PolarizerError {
    PolarizerError::Configuration(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampler.period, Duration::from_millis(1000));
        assert_eq!(config.controller.clamp, ClampMode::Symmetric);
    }

    #[test]
    fn default_sweep_is_ninety_angles() {
        let angles = SweepConfig::default().angles().unwrap();
        assert_eq!(angles.len(), 90);
        assert_eq!(angles[0], 0.0);
        assert_eq!(angles[45], 90.0);
        assert_eq!(angles[89], 178.0);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [controller]
            gain = 10.0
            period = "1s"
            clamp = "upper_only"

            [calibration]
            delay = "250ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.controller.gain, 10.0);
        assert_eq!(config.controller.period, Duration::from_secs(1));
        assert_eq!(config.controller.clamp, ClampMode::UpperOnly);
        assert_eq!(config.controller.max_step_deg, 10.0);
        assert_eq!(config.calibration.delay, Duration::from_millis(250));
        assert_eq!(config.calibration.averages, 10);
    }

    #[test]
    fn microscope_profile_matches_energy_sensor_tuning() {
        let profile = ControllerConfig::microscope();
        assert_eq!(profile.gain, 10.0);
        assert_eq!(profile.max_step_deg, 20.0);
        assert_eq!(profile.period, Duration::from_millis(1000));
        assert_eq!(profile.settle, Duration::from_millis(1000));
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = AppConfig::default();
        config.application.log_level = "chatty".to_string();
        assert!(matches!(
            config.validate(),
            Err(PolarizerError::Configuration(_))
        ));
    }

    #[test]
    fn zero_averages_rejected() {
        let mut config = AppConfig::default();
        config.calibration.averages = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_sweeps_rejected_without_allocating() {
        let cases = [
            SweepConfig {
                stop_deg: f64::INFINITY,
                ..SweepConfig::default()
            },
            SweepConfig {
                start_deg: f64::NAN,
                ..SweepConfig::default()
            },
            SweepConfig {
                step_deg: 1e-12,
                ..SweepConfig::default()
            },
            SweepConfig {
                start_deg: -f64::MAX,
                stop_deg: f64::MAX,
                ..SweepConfig::default()
            },
        ];
        for sweep in cases {
            assert!(
                matches!(sweep.angles(), Err(PolarizerError::Configuration(_))),
                "accepted {sweep:?}"
            );
        }

        let finest = SweepConfig {
            start_deg: 0.0,
            stop_deg: 360.0,
            step_deg: 0.1,
            ..SweepConfig::default()
        };
        assert_eq!(finest.point_count().unwrap(), MAX_SWEEP_POINTS);
    }

    #[test]
    fn calibration_averages_are_bounded() {
        let mut config = AppConfig::default();
        config.calibration.averages = u32::MAX;
        assert!(matches!(
            config.validate(),
            Err(PolarizerError::Configuration(_))
        ));
        config.calibration.averages = MAX_CALIBRATION_AVERAGES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_sweep_rejected() {
        let mut config = AppConfig::default();
        config.sweep.stop_deg = config.sweep.start_deg;
        assert!(config.validate().is_err());
    }

    #[test]
    fn template_optical_config_is_incomplete() {
        let optical = OpticalConfig::default();
        match optical.ensure_complete() {
            Err(PolarizerError::ConfigurationIncomplete(keys)) => {
                assert_eq!(keys, vec!["optical.fingerprint", "optical.path_to_dll"]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn filled_optical_config_is_complete() {
        let optical = OpticalConfig {
            host: "nea-server".into(),
            fingerprint: "af3b0d0f".into(),
            path_to_dll: "/opt/nea/client".into(),
        };
        assert!(optical.ensure_complete().is_ok());
    }
}

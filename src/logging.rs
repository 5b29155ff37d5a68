//! Log output.
//!
//! One global `tracing` subscriber is installed at start-up. Its level and line format
//! come from the `[application]` section; a `RUST_LOG` variable, when present, replaces
//! the level filter. Operator notifications are logged on target `status`, so
//! `RUST_LOG=status=info` shows the status board and nothing else.
//!
//! ```no_run
//! use polarizer_control::{config::AppConfig, logging};
//!
//! # fn main() -> Result<(), polarizer_control::error::PolarizerError> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("controller started");
//! # Ok(())
//! # }
//! ```

use crate::config::{AppConfig, LogFormat, LOG_LEVELS};
use crate::error::{AppResult, PolarizerError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Subscriber settings derived from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Line format
    pub format: LogFormat,
    /// Colour escapes in the human-readable formats
    pub ansi: bool,
}

impl TracingConfig {
    /// Settings for `config.application`.
    ///
    /// # Errors
    /// `Configuration` for an unknown log level.
    pub fn from_app_config(config: &AppConfig) -> AppResult<Self> {
        let level = config.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(PolarizerError::Configuration(format!(
                "unknown log level '{}'",
                config.application.log_level
            )));
        }
        let format = config.application.log_format;
        Ok(Self {
            filter: level,
            format,
            ansi: format != LogFormat::Json,
        })
    }
}

/// Install the subscriber described by `config.application`.
pub fn init_from_config(config: &AppConfig) -> AppResult<()> {
    init(&TracingConfig::from_app_config(config)?)
}

/// Install a subscriber.
///
/// A subscriber that is already installed (an earlier call, a test harness) is left in
/// place and this returns `Ok`.
pub fn init(config: &TracingConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer().pretty().with_ansi(config.ansi).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_ansi(config.ansi).boxed(),
        LogFormat::Json => fmt::layer().json().flatten_event(true).boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(err) => Err(PolarizerError::Configuration(format!(
            "could not install the log subscriber: {err}"
        ))),
    }
}

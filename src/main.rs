//! CLI Entry Point for polarizer-control
//!
//! Provides a command-line interface for:
//! - An interactive operator console (jog, home, seek, calibrate, find minimum)
//! - One-shot runs of the long operations (seek, calibration, minimum search)
//! - Monitoring the sensor reading
//! - Listing USB serial adapters that look like the rotator
//! - Printing the effective configuration
//!
//! # Architecture
//!
//! The console and the one-shot commands all drive a `PolarizerApp`. Vendor drivers are
//! not linked into this binary; the app runs against the simulated bench configured in
//! the `[simulation]` section.
//!
//! # Usage
//!
//! ```bash
//! polarizer-control --config config/polarizer.toml interactive
//! polarizer-control seek --setpoint 5.0
//! polarizer-control calibrate --averages 20 --delay-ms 250
//! polarizer-control find-minimum --report sweep.json
//! polarizer-control --log-format json monitor --json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use polarizer_control::app::{Devices, PolarizerApp};
use polarizer_control::config::{AppConfig, LogFormat, DEFAULT_CONFIG_PATH};
use polarizer_control::error::{AppResult, PolarizerError};
use polarizer_control::hardware::mock::SimulatedBench;
use polarizer_control::hardware::{OpticalContext, PowerSensor, Rotator};
use polarizer_control::logging;
use polarizer_control::operator::{self, OperatorCommand};
use polarizer_control::scheduler::SeekOutcome;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

/// Connection attempts before giving up on a device
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "polarizer-control")]
#[command(about = "Closed-loop polarizer angle control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log line format, overriding `application.log_format`
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Operator console reading commands from stdin
    Interactive,

    /// Print the live reading
    Monitor {
        /// How long to monitor (seconds)
        #[arg(long, default_value_t = 10)]
        duration: u64,

        /// One JSON telemetry object per line instead of text
        #[arg(long)]
        json: bool,
    },

    /// Rotate until the reading matches the setpoint
    Seek {
        /// Target power (mW)
        #[arg(long)]
        setpoint: f64,
    },

    /// Measure the zero offset
    Calibrate {
        /// Number of samples to average
        #[arg(long)]
        averages: Option<u32>,

        /// Pause between samples (milliseconds)
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Sweep for the transmission minimum and re-home on it
    FindMinimum {
        /// Write the sweep report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List serial adapters matching the rotator's USB id
    Discover,

    /// Print the effective configuration (file plus environment) as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    config.validate().context("invalid configuration")?;
    logging::init_from_config(&config).context("initialising logging")?;

    println!("🔭 {}", config.application.name);
    println!();

    match cli.command {
        Commands::Discover => discover(&config),
        Commands::ShowConfig => {
            let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Commands::Interactive => {
            let app = start_app(config).await?;
            let result = interactive(&app).await;
            finish(&app, result).await
        }
        Commands::Monitor { duration, json } => {
            let app = start_app(config).await?;
            let result = monitor(&app, Duration::from_secs(duration), json).await;
            finish(&app, result).await
        }
        Commands::Seek { setpoint } => {
            let app = start_app(config).await?;
            let result = seek(&app, setpoint).await;
            finish(&app, result).await
        }
        Commands::Calibrate { averages, delay_ms } => {
            if let Some(averages) = averages {
                config.calibration.averages = averages;
            }
            if let Some(delay_ms) = delay_ms {
                config.calibration.delay = Duration::from_millis(delay_ms);
            }
            config.validate().context("invalid calibration parameters")?;
            let app = start_app(config).await?;
            let result = calibrate(&app).await;
            finish(&app, result).await
        }
        Commands::FindMinimum { report } => {
            let app = start_app(config).await?;
            let result = find_minimum(&app, report).await;
            finish(&app, result).await
        }
    }
}

/// Try `connect` a few times; the caller decides what a final miss means.
async fn connect_with_retry<T>(
    device: &str,
    mut connect: impl FnMut() -> AppResult<T>,
) -> AppResult<T> {
    let mut attempt = 1;
    loop {
        match connect() {
            Ok(connected) => return Ok(connected),
            Err(PolarizerError::DeviceNotFound(reason)) if attempt < CONNECT_ATTEMPTS => {
                warn!(device, attempt, %reason, "device not found, retrying");
                println!("⚠️  No {device} found, connect it to the PC (attempt {attempt}/{CONNECT_ATTEMPTS})");
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn start_app(config: AppConfig) -> Result<PolarizerApp> {
    println!("🔧 Initializing simulated bench...");
    let bench = SimulatedBench::new(&config.simulation);

    let rotator: Arc<dyn Rotator> =
        Arc::new(connect_with_retry("rotator", || bench.connect_rotator()).await?);
    let sensor: Arc<dyn PowerSensor> =
        Arc::new(connect_with_retry("power sensor", || bench.connect_power_sensor()).await?);
    let optical = bench
        .microscope()
        .map(|microscope| Arc::new(microscope) as Arc<dyn OpticalContext>);

    let app = PolarizerApp::start(
        config,
        Devices {
            rotator,
            sensor,
            optical,
        },
    )
    .await
    .context("starting the controller")?;

    spawn_status_printer(&app);
    println!("✅ Controller ready");
    println!();
    Ok(app)
}

fn spawn_status_printer(app: &PolarizerApp) {
    let mut messages = app.subscribe_status();
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => println!("   {message}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    println!("   ({missed} status messages skipped)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn finish(app: &PolarizerApp, result: Result<()>) -> Result<()> {
    let shutdown = app.shutdown().await;
    println!("\n👋 Shut down");
    result?;
    shutdown.context("closing devices")?;
    Ok(())
}

async fn interactive(app: &PolarizerApp) -> Result<()> {
    println!("{}", operator::HELP);
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<OperatorCommand>() {
            Ok(command) => command,
            Err(err) => {
                println!("❌ {err}");
                continue;
            }
        };
        if command == OperatorCommand::Quit {
            break;
        }
        match operator::execute(app, command).await {
            Ok(Some(reply)) => println!("{reply}"),
            Ok(None) => {}
            Err(err) => println!("{}", operator::report_failure(err)?),
        }
    }
    Ok(())
}

async fn monitor(app: &PolarizerApp, duration: Duration, json: bool) -> Result<()> {
    println!("📡 Monitoring for {}s - Press Ctrl+C to stop", duration.as_secs());
    let mut telemetry = app.scheduler().subscribe();
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            changed = telemetry.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = telemetry.borrow_and_update().clone();
                if json {
                    println!("{}", serde_json::to_string(&snapshot)?);
                } else {
                    println!("{}", operator::describe(&snapshot));
                }
            }
        }
    }
    Ok(())
}

async fn seek(app: &PolarizerApp, setpoint: f64) -> Result<()> {
    println!("🎯 Seeking {setpoint} mW - Press Ctrl+C to cancel");
    let seek = app.seek_setpoint(Some(setpoint)).await?;

    let outcome = tokio::select! {
        outcome = app.scheduler().wait_for_seek(seek) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            app.cancel_seek().await?;
            app.scheduler().wait_for_seek(seek).await?
        }
    };

    match outcome {
        SeekOutcome::Converged {
            reading_mw,
            angle_deg,
            steps,
        } => {
            println!("✅ Setpoint reached: {reading_mw:.4} mW at {angle_deg:.3}° after {steps} steps");
            Ok(())
        }
        SeekOutcome::Cancelled { steps } => {
            println!("⏹️  Cancelled after {steps} steps");
            Ok(())
        }
        SeekOutcome::Failed { reason, steps } => {
            anyhow::bail!("seek failed after {steps} steps: {reason}")
        }
    }
}

async fn calibrate(app: &PolarizerApp) -> Result<()> {
    let params = &app.config().calibration;
    println!(
        "⚖️  Zero-offset calibration: {} samples, {:?} apart",
        params.averages, params.delay
    );
    let run = app.start_calibration().await?;
    let offset = run.await.context("calibration task")??;
    println!("✅ Offset: {offset} mW");
    Ok(())
}

async fn find_minimum(app: &PolarizerApp, report_path: Option<PathBuf>) -> Result<()> {
    println!("🔍 Sweeping for the transmission minimum...");
    let report = app.find_minimum().await?;
    if let Some(point) = report.minimum() {
        println!(
            "✅ Minimum {:.4} at {:.3}° (sweep point {} of {})",
            point.power,
            point.achieved_deg,
            report.minimum_index + 1,
            report.sweep.len()
        );
    }
    println!("   New home offset: {:.3}°", report.new_home_offset);
    println!("   Angle after homing: {:.3}°", report.final_angle);

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        println!("💾 Sweep written to {}", path.display());
    }
    Ok(())
}

#[cfg(feature = "instrument_serial")]
fn discover(config: &AppConfig) -> Result<()> {
    use polarizer_control::hardware::discovery::discover_rotator_ports;

    println!(
        "🔌 Looking for USB {:04x}:{:04x}...",
        config.rotator.usb_vid, config.rotator.usb_pid
    );
    match discover_rotator_ports(&config.rotator) {
        Ok(ports) => {
            for port in ports {
                println!(
                    "   {} (serial {})",
                    port.port_name,
                    port.serial_number.as_deref().unwrap_or("unknown")
                );
            }
            Ok(())
        }
        Err(PolarizerError::DeviceNotFound(reason)) => {
            println!("❌ {reason}");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(not(feature = "instrument_serial"))]
fn discover(_config: &AppConfig) -> Result<()> {
    Err(PolarizerError::FeatureNotEnabled("instrument_serial".to_string()).into())
}

//! Integration tests for loading and validating configuration files.

use polarizer_control::config::{AppConfig, ClampMode, LogFormat, SweepSource, PLACEHOLDER};
use polarizer_control::error::PolarizerError;
use polarizer_control::logging;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
fn test_load_full_file() {
    let file = write_config(
        r#"
        [application]
        name = "Bench 2"
        log_level = "debug"

        [sampler]
        period = "500ms"

        [controller]
        gain = 10.0
        max_step_deg = 20.0
        clamp = "upper_only"
        threshold_mw = 0.02
        period = "1s"
        settle = "750ms"

        [calibration]
        averages = 20
        delay = "250ms"

        [sweep]
        step_deg = 1.0
        step_dwell = "500ms"
        settle_dwell = "2s"
        source = "optical"

        [rotator]
        jog_step_deg = 0.5
        serial_number = "DK0BIUIAA"

        [optical]
        host = "nea-server"
        fingerprint = "af3b0d0f"
        path_to_dll = "/opt/nea/client"
        "#,
    );

    let config = AppConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.name, "Bench 2");
    assert_eq!(config.sampler.period, Duration::from_millis(500));
    assert_eq!(config.controller.clamp, ClampMode::UpperOnly);
    assert_eq!(config.controller.settle, Duration::from_millis(750));
    assert_eq!(config.calibration.averages, 20);
    assert_eq!(config.sweep.source, SweepSource::Optical);
    assert_eq!(config.sweep.angles().unwrap().len(), 180);
    assert_eq!(config.rotator.serial_number.as_deref(), Some("DK0BIUIAA"));
    assert_eq!(config.rotator.usb_pid, 0x6015);
    assert!(config.optical.ensure_complete().is_ok());
}

#[test]
fn test_shipped_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/polarizer.toml");
    let config = AppConfig::load_from(path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.rotator.usb_vid, 0x0403);
    assert_eq!(config.controller.period, Duration::from_secs(2));
    match config.optical.ensure_complete() {
        Err(PolarizerError::ConfigurationIncomplete(keys)) => assert_eq!(keys.len(), 2),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();

    assert!(config.validate().is_ok());
    assert_eq!(config.controller.gain, 5.0);
    assert_eq!(config.optical.fingerprint, PLACEHOLDER);
}

#[test]
fn test_malformed_toml_is_a_config_error() {
    let file = write_config("[controller\ngain = ");
    assert!(matches!(
        AppConfig::load_from(file.path()),
        Err(PolarizerError::Config(_))
    ));
}

#[test]
fn test_wrong_type_is_a_config_error() {
    let file = write_config("[calibration]\naverages = \"ten\"\n");
    assert!(matches!(
        AppConfig::load_from(file.path()),
        Err(PolarizerError::Config(_))
    ));
}

#[test]
fn test_validation_catches_bad_values() {
    let cases = [
        "[controller]\ngain = 0.0\n",
        "[controller]\nmax_step_deg = -1.0\n",
        "[controller]\nthreshold_mw = 0.0\n",
        "[sampler]\nperiod = \"0s\"\n",
        "[sweep]\nstep_deg = 0.0\n",
        "[sweep]\nstart_deg = 90.0\nstop_deg = 90.0\n",
        "[rotator]\nfast_jog_factor = 0.0\n",
        "[application]\nlog_level = \"loud\"\n",
        "[sweep]\nstop_deg = inf\n",
        "[sweep]\nstart_deg = nan\n",
        "[sweep]\nstep_deg = 1e-12\n",
        "[calibration]\naverages = 4294967295\n",
    ];
    for case in cases {
        let config = AppConfig::from_toml_str(case).unwrap();
        assert!(
            matches!(config.validate(), Err(PolarizerError::Configuration(_))),
            "accepted: {case}"
        );
    }
}

#[test]
fn test_environment_overrides_file() {
    figment::Jail::expect_with(|jail| {
        jail.create_file(
            "polarizer.toml",
            "[sensor]\nwavelength_nm = 1064.0\n\n[rotator]\nfast_jog_factor = 2.0\n",
        )?;
        // Keys no other test in this file asserts on, since the environment is shared
        jail.set_env("POLARIZER_SENSOR__WAVELENGTH_NM", "1550");

        let config = AppConfig::load_from("polarizer.toml").map_err(|e| e.to_string())?;
        assert_eq!(config.sensor.wavelength_nm, 1550.0);
        assert_eq!(config.rotator.fast_jog_factor, 2.0);
        Ok(())
    });
}

#[test]
fn test_rendered_config_loads_back() {
    let mut config = AppConfig::default();
    config.rotator.serial_number = Some("DK0BIUIAA".to_string());
    config.calibration.delay = Duration::from_millis(1500);

    let rendered = toml::to_string_pretty(&config).unwrap();
    assert!(rendered.contains("delay = \"1s 500ms\""));
    let file = write_config(&rendered);
    let loaded = AppConfig::load_from(file.path()).unwrap();
    assert_eq!(loaded.calibration.delay, Duration::from_millis(1500));
    assert_eq!(loaded.rotator.serial_number.as_deref(), Some("DK0BIUIAA"));
}

#[test]
fn test_logging_initialises_from_config() {
    let config = AppConfig::from_toml_str(
        "[application]\nlog_level = \"warn\"\nlog_format = \"json\"\n",
    )
    .unwrap();
    let tracing = logging::TracingConfig::from_app_config(&config).unwrap();
    assert_eq!(tracing.format, LogFormat::Json);
    assert_eq!(tracing.filter, "warn");

    assert!(logging::init_from_config(&config).is_ok());
    // Repeated initialisation is tolerated
    assert!(logging::init_from_config(&config).is_ok());
}

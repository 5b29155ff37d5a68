//! Integration tests for zero-offset calibration.

use polarizer_control::app::{Devices, PolarizerApp};
use polarizer_control::calibrator::{CalibrationEvent, Calibrator};
use polarizer_control::config::{AppConfig, CalibrationConfig, SimulationConfig};
use polarizer_control::error::PolarizerError;
use polarizer_control::exclusive::{Operation, OperationLock};
use polarizer_control::hardware::mock::{
    MockPowerSensor, ScriptedPowerSensor, ScriptedReading, SimulatedBench,
};
use polarizer_control::offset::CalibrationOffset;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn params(averages: u32, delay_ms: u64) -> CalibrationConfig {
    CalibrationConfig {
        averages,
        delay: Duration::from_millis(delay_ms),
    }
}

async fn start_bench_app(config: AppConfig) -> (PolarizerApp, Arc<MockPowerSensor>) {
    let bench = SimulatedBench::new(&config.simulation);
    let sensor = Arc::new(bench.connect_power_sensor().unwrap());
    let devices = Devices {
        rotator: Arc::new(bench.connect_rotator().unwrap()),
        sensor: sensor.clone(),
        optical: None,
    };
    (PolarizerApp::start(config, devices).await.unwrap(), sensor)
}

#[tokio::test(start_paused = true)]
async fn stores_mean_regardless_of_delay() {
    for delay_ms in [0, 50, 500] {
        let sensor = Arc::new(ScriptedPowerSensor::from_values([0.10, 0.12, 0.08, 0.10]));
        let offset = CalibrationOffset::default();

        let started = Instant::now();
        let result = Calibrator::new(sensor, offset.clone(), params(4, delay_ms))
            .spawn()
            .wait()
            .await
            .unwrap();

        assert!((result - 0.10).abs() < 1e-12, "delay {delay_ms}: {result}");
        assert_eq!(offset.load(), result);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(4 * delay_ms));
        assert!(elapsed < Duration::from_millis(4 * delay_ms + 10));
    }
}

#[tokio::test(start_paused = true)]
async fn events_count_up_then_complete() {
    let sensor = Arc::new(ScriptedPowerSensor::from_values([1.0, 2.0, 3.0]));
    let mut handle = Calibrator::new(sensor, CalibrationOffset::default(), params(3, 100)).spawn();

    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            CalibrationEvent::Progress { count: 1, total: 3 },
            CalibrationEvent::Progress { count: 2, total: 3 },
            CalibrationEvent::Progress { count: 3, total: 3 },
            CalibrationEvent::Completed { offset_mw: 2.0 },
        ]
    );
    assert_eq!(events[3].message(), "Zero adjust done: 2 mW");
    assert!(handle.wait().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn failed_sample_leaves_offset_unchanged() {
    let sensor = Arc::new(ScriptedPowerSensor::new([
        ScriptedReading::Power(0.2),
        ScriptedReading::Failure("sensor unplugged".into()),
        ScriptedReading::Power(0.2),
    ]));
    let offset = CalibrationOffset::new(0.05);
    let lock = OperationLock::new();
    let guard = lock.try_acquire(Operation::Calibration).unwrap();

    let mut handle = Calibrator::new(sensor, offset.clone(), params(3, 10))
        .with_guard(guard)
        .spawn();

    let mut last = None;
    while let Some(event) = handle.next_event().await {
        last = Some(event);
    }
    assert!(matches!(last, Some(CalibrationEvent::Failed(ref reason)) if reason.contains("sensor unplugged")));
    assert!(matches!(
        handle.wait().await,
        Err(PolarizerError::DeviceUnreachable { .. })
    ));
    assert_eq!(offset.load(), 0.05);
    assert_eq!(lock.active(), None);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_between_samples() {
    let sensor = Arc::new(ScriptedPowerSensor::constant(0.3));
    let offset = CalibrationOffset::default();
    let handle = Calibrator::new(sensor.clone(), offset.clone(), params(10, 1000)).spawn();

    sleep(Duration::from_millis(2500)).await;
    handle.cancel();
    assert!(matches!(handle.wait().await, Err(PolarizerError::Cancelled)));

    assert_eq!(sensor.read_count(), 3);
    assert_eq!(offset.load(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn scheduler_keeps_sampling_during_calibration() {
    let mut config = AppConfig::default();
    config.calibration = params(5, 1000);
    config.simulation = SimulationConfig {
        noise_mw: 0.0,
        ..SimulationConfig::default()
    };
    let (app, sensor) = start_bench_app(config).await;
    let mut telemetry = app.scheduler().subscribe();
    let mut status = app.subscribe_status();

    let reads_before = sensor.read_count();
    let run = app.start_calibration().await.unwrap();
    assert_eq!(app.active_operation(), Some(Operation::Calibration));

    let offset = run.await.unwrap().unwrap();
    // Five calibration samples plus one idle sample per second alongside them
    assert!(sensor.read_count() - reads_before >= 5 + 4);
    assert_eq!(app.active_operation(), None);
    assert_eq!(app.offset().load(), offset);

    let mut texts = Vec::new();
    while let Ok(message) = status.try_recv() {
        texts.push(message.text);
    }
    assert_eq!(texts.first().map(String::as_str), Some("Zero adjust step: 1"));
    assert_eq!(texts.last(), Some(&format!("Zero adjust done: {offset} mW")));

    // Live readings are now corrected by the stored offset
    let _ = telemetry.borrow_and_update();
    telemetry.changed().await.unwrap();
    let reading = telemetry.borrow().reading.unwrap();
    assert!((reading.offset_mw - offset).abs() < 1e-12);
    assert!(reading.corrected_mw.abs() < 1e-9);

    app.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn app_cancel_reports_on_status_board() {
    let mut config = AppConfig::default();
    config.calibration = params(10, 500);
    let (app, _) = start_bench_app(config).await;
    let mut status = app.subscribe_status();

    assert!(!app.cancel_calibration().await);
    let run = app.start_calibration().await.unwrap();
    sleep(Duration::from_millis(1200)).await;
    assert!(app.cancel_calibration().await);
    assert!(matches!(run.await.unwrap(), Err(PolarizerError::Cancelled)));
    assert_eq!(app.offset().load(), 0.0);

    let mut texts = Vec::new();
    while let Ok(message) = status.try_recv() {
        texts.push(message.text);
    }
    assert_eq!(texts.last().map(String::as_str), Some("Zero adjust cancelled"));
    assert_eq!(app.active_operation(), None);

    app.shutdown().await.unwrap();
}

//! Integration tests for the transmission-minimum sweep.

use polarizer_control::app::{Devices, PolarizerApp};
use polarizer_control::config::{AppConfig, OpticalConfig, SimulationConfig, SweepConfig, SweepSource};
use polarizer_control::error::PolarizerError;
use polarizer_control::hardware::mock::{
    MockPowerSensor, MockRotator, ScriptedPowerSensor, ScriptedReading, SimulatedBench,
    PULSES_PER_DEGREE,
};
use polarizer_control::hardware::{OpticalContext, PowerSource, Rotator};
use polarizer_control::minimum_finder::MinimumFinder;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn v_shaped_sensor() -> ScriptedPowerSensor {
    ScriptedPowerSensor::from_values((0..90).map(|i| (i as f64 - 45.0).abs() + 1.0))
}

fn quiet_simulation() -> SimulationConfig {
    SimulationConfig {
        noise_mw: 0.0,
        ..SimulationConfig::default()
    }
}

struct BenchApp {
    app: PolarizerApp,
    bench: SimulatedBench,
    rotator: Arc<MockRotator>,
    sensor: Arc<MockPowerSensor>,
}

async fn start_bench_app(config: AppConfig) -> BenchApp {
    let bench = SimulatedBench::new(&config.simulation);
    let rotator = Arc::new(bench.connect_rotator().unwrap());
    let sensor = Arc::new(bench.connect_power_sensor().unwrap());
    let optical = bench
        .microscope()
        .map(|microscope| Arc::new(microscope) as Arc<dyn OpticalContext>);
    let app = PolarizerApp::start(
        config,
        Devices {
            rotator: rotator.clone(),
            sensor: sensor.clone(),
            optical,
        },
    )
    .await
    .unwrap();
    BenchApp {
        app,
        bench,
        rotator,
        sensor,
    }
}

#[tokio::test(start_paused = true)]
async fn rehomes_on_scripted_minimum() {
    let rotator = MockRotator::at(0.0);
    // A previous home offset is discarded before sweeping
    rotator.set_home_offset(10.0).await.unwrap();
    let source = PowerSource::Sensor(Arc::new(v_shaped_sensor()));

    let report = MinimumFinder::new(SweepConfig::default())
        .run(&rotator, &source)
        .await
        .unwrap();

    assert_eq!(report.sweep.len(), 90);
    assert_eq!(report.minimum_index, 45);
    let minimum = report.minimum().unwrap();
    assert_eq!(minimum.commanded_deg, 90.0);
    assert_eq!(minimum.power, 1.0);

    assert_eq!(report.start_home_offset, 0.0);
    assert_eq!(report.new_home_offset, minimum.achieved_deg);
    assert!(report.final_angle.abs() < 1.0 / PULSES_PER_DEGREE);
    assert_eq!(rotator.home_offset().await.unwrap(), report.new_home_offset);
}

#[tokio::test(start_paused = true)]
async fn sweep_points_follow_the_commanded_grid() {
    let rotator = MockRotator::at(0.0);
    let source = PowerSource::Sensor(Arc::new(v_shaped_sensor()));
    let config = SweepConfig {
        step_deg: 30.0,
        ..SweepConfig::default()
    };

    let report = MinimumFinder::new(config).run(&rotator, &source).await.unwrap();
    let commanded: Vec<f64> = report.sweep.points.iter().map(|p| p.commanded_deg).collect();
    assert_eq!(commanded, vec![0.0, 30.0, 60.0, 90.0, 120.0, 150.0]);
    for point in &report.sweep.points {
        assert!((point.achieved_deg - point.commanded_deg).abs() <= 0.5 / PULSES_PER_DEGREE);
    }
    // Scripted values fall toward index 45, so the last of six points is lowest
    assert_eq!(report.minimum_index, 5);
}

#[tokio::test(start_paused = true)]
async fn finds_extinction_on_simulated_bench() {
    let bench = SimulatedBench::new(&quiet_simulation());
    let rotator = bench.connect_rotator().unwrap();
    let source = PowerSource::Sensor(Arc::new(bench.connect_power_sensor().unwrap()));

    let report = MinimumFinder::new(SweepConfig::default())
        .run(&rotator, &source)
        .await
        .unwrap();

    let extinction = bench.model().extinction_deg;
    assert!(
        (report.new_home_offset - extinction).abs() <= 2.0,
        "offset {} too far from extinction {}",
        report.new_home_offset,
        extinction
    );
    assert!((bench.physical_angle().await - report.new_home_offset).abs() <= 1.0 / PULSES_PER_DEGREE);
    assert!(report.final_angle.abs() <= 1.0 / PULSES_PER_DEGREE);
}

#[tokio::test(start_paused = true)]
async fn rotator_failure_aborts_where_it_stands() {
    let rotator = MockRotator::at(0.0);
    // Homing plus four sweep moves succeed; the move to 8° fails
    rotator.fail_after_moves(5).await;
    let source = PowerSource::Sensor(Arc::new(v_shaped_sensor()));

    let err = MinimumFinder::new(SweepConfig::default())
        .run(&rotator, &source)
        .await
        .unwrap_err();
    assert!(matches!(err, PolarizerError::DeviceUnreachable { .. }));

    assert!((rotator.angle().await.unwrap() - 6.0).abs() < 0.01);
    assert_eq!(rotator.home_offset().await.unwrap(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn sensor_failure_aborts_without_rehoming() {
    let rotator = MockRotator::at(20.0);
    let sensor = ScriptedPowerSensor::new([
        ScriptedReading::Power(3.0),
        ScriptedReading::Power(2.0),
        ScriptedReading::Failure("detector saturated".into()),
    ]);
    let source = PowerSource::Sensor(Arc::new(sensor));

    let err = MinimumFinder::new(SweepConfig::default())
        .run(&rotator, &source)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("detector saturated"));
    assert!((rotator.angle().await.unwrap() - 4.0).abs() < 0.01);
    assert_eq!(rotator.home_offset().await.unwrap(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn app_suspends_sampling_during_sweep() {
    let mut config = AppConfig::default();
    config.simulation = quiet_simulation();
    let bench = start_bench_app(config).await;
    let app = &bench.app;

    let reads_before = bench.sensor.read_count();
    let report = app.find_minimum().await.unwrap();

    // Every read during the call belongs to the sweep
    assert_eq!(bench.sensor.read_count() - reads_before, report.sweep.len());

    let mut telemetry = app.scheduler().subscribe();
    let rehomed = |angle: Option<f64>| angle.is_some_and(|a| a.abs() <= 1.0 / PULSES_PER_DEGREE);
    timeout(
        Duration::from_secs(1),
        telemetry.wait_for(|t| !t.suspended && rehomed(t.angle_deg)),
    )
    .await
    .expect("sampling was not resumed")
    .unwrap();
    assert_eq!(app.active_operation(), None);

    let physical = bench.bench.physical_angle().await;
    assert!((physical - report.new_home_offset).abs() <= 1.0 / PULSES_PER_DEGREE);

    app.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn app_resumes_sampling_after_failed_sweep() {
    let mut config = AppConfig::default();
    config.simulation = quiet_simulation();
    let bench = start_bench_app(config).await;
    let app = &bench.app;
    let mut status = app.subscribe_status();

    bench.rotator.fail_after_moves(3).await;
    let err = app.find_minimum().await.unwrap_err();
    assert!(matches!(err, PolarizerError::DeviceUnreachable { .. }));

    let mut telemetry = app.scheduler().subscribe();
    timeout(Duration::from_secs(1), telemetry.wait_for(|t| !t.suspended))
        .await
        .expect("sampling was not resumed")
        .unwrap();
    assert_eq!(app.active_operation(), None);

    let mut aborted = false;
    while let Ok(message) = status.try_recv() {
        aborted |= message.text.starts_with("Minimum search aborted");
    }
    assert!(aborted);

    // Sampling carries on after the failure
    let reads = bench.sensor.read_count();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(bench.sensor.read_count() > reads);

    app.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn optical_sweep_requires_a_connection() {
    let mut config = AppConfig::default();
    config.simulation = quiet_simulation();
    config.sweep.source = SweepSource::Optical;
    config.optical = OpticalConfig {
        host: "nea-server".into(),
        fingerprint: "0f1e2d3c".into(),
        path_to_dll: "/opt/nea/client".into(),
    };
    let bench = start_bench_app(config).await;
    let app = &bench.app;

    assert!(matches!(
        app.find_minimum().await,
        Err(PolarizerError::OpticalContextUnavailable)
    ));
    assert_eq!(app.active_operation(), None);

    assert!(app.toggle_optical().await.unwrap());
    let reads_before = bench.sensor.read_count();
    let report = app.find_minimum().await.unwrap();

    // The microscope's energy sensor supplied the sweep, not the power meter
    assert_eq!(bench.sensor.read_count(), reads_before);
    let extinction = bench.bench.model().extinction_deg;
    assert!((report.new_home_offset - extinction).abs() <= 2.0);

    app.shutdown().await.unwrap();
    assert!(!app.optical_connected());
}

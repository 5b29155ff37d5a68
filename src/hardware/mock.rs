//! Mock Hardware Implementations
//!
//! Simulated devices for running the controller without a bench attached.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep),
//! so tests running with a paused clock advance through moves instantly.
//!
//! # Available Mocks
//!
//! - [`SimulatedBench`] - shared polariser model; hands out the devices below
//! - [`MockRotator`] - rotation mount quantised to the ELL14 pulse resolution
//! - [`MockPowerSensor`] - power meter reading the Malus-law transmission
//! - [`SimulatedMicroscope`] - optical context whose energy sensor follows the same model
//! - [`ScriptedPowerSensor`] - replays a fixed queue of readings and failures
//!
//! # Performance Characteristics
//!
//! - MockRotator: 180°/sec plus 50ms per move
//! - MockPowerSensor: 20ms per acquisition

use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::config::{OpticalConfig, SimulationConfig};
use crate::error::{AppResult, PolarizerError};
use crate::hardware::capabilities::{JogDirection, OpticalContext, PowerSensor, Rotator};

/// ELL14 resolution: 143360 pulses per revolution.
pub const PULSES_PER_DEGREE: f64 = 143_360.0 / 360.0;

const MOVE_OVERHEAD: Duration = Duration::from_millis(50);
const ACQUISITION_TIME: Duration = Duration::from_millis(20);

/// Round an angle to the nearest whole motor pulse.
pub fn quantize(angle_deg: f64) -> f64 {
    (angle_deg * PULSES_PER_DEGREE).round() / PULSES_PER_DEGREE
}

// =============================================================================
// PolarizerModel - Malus law transmission
// =============================================================================

/// Transmitted power through a rotating polariser.
///
/// `power(θ) = background + max · sin²(θ − θ_min)`, so the minimum sits at `θ_min`
/// and repeats every 180°.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolarizerModel {
    /// Peak transmitted power (mW)
    pub max_power_mw: f64,
    /// Floor at extinction (mW)
    pub background_mw: f64,
    /// Physical angle of minimum transmission (degrees)
    pub extinction_deg: f64,
}

impl PolarizerModel {
    /// Noise-free power at a physical angle
    pub fn power_at(&self, physical_deg: f64) -> f64 {
        let theta = (physical_deg - self.extinction_deg).to_radians();
        self.background_mw + self.max_power_mw * theta.sin().powi(2)
    }
}

impl From<&SimulationConfig> for PolarizerModel {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            max_power_mw: config.max_power_mw,
            background_mw: config.background_mw,
            extinction_deg: config.extinction_deg,
        }
    }
}

// =============================================================================
// SimulatedBench - shared physical state
// =============================================================================

/// One optical bench: a polariser on a rotation mount in front of a power meter.
///
/// Every device handed out shares the physical angle, so a move on the rotator shows up
/// in the next sensor reading.
///
/// # Example
///
/// ```rust,ignore
/// let bench = SimulatedBench::new(&SimulationConfig::default());
/// let rotator = bench.connect_rotator()?;
/// let sensor = bench.connect_power_sensor()?;
/// rotator.set_angle(bench.model().extinction_deg).await?;
/// assert!(sensor.get_power().await? < 1.0);
/// ```
#[derive(Clone)]
pub struct SimulatedBench {
    model: PolarizerModel,
    noise_mw: f64,
    physical_deg: Arc<RwLock<f64>>,
    sensor_attached: bool,
    microscope_attached: bool,
}

impl SimulatedBench {
    /// Create a bench from the simulation settings
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            model: PolarizerModel::from(config),
            noise_mw: config.noise_mw.max(0.0),
            physical_deg: Arc::new(RwLock::new(quantize(config.start_deg))),
            sensor_attached: true,
            microscope_attached: config.microscope,
        }
    }

    /// Bench with the power meter unplugged
    pub fn without_sensor(mut self) -> Self {
        self.sensor_attached = false;
        self
    }

    /// Transmission model
    pub fn model(&self) -> PolarizerModel {
        self.model
    }

    /// Absolute mechanical angle of the mount (degrees)
    pub async fn physical_angle(&self) -> f64 {
        *self.physical_deg.read().await
    }

    /// Open the rotation mount
    pub fn connect_rotator(&self) -> AppResult<MockRotator> {
        Ok(MockRotator::new(self.physical_deg.clone()))
    }

    /// Open the power meter
    ///
    /// # Errors
    /// `DeviceNotFound` when the bench was built [`without_sensor`](Self::without_sensor).
    pub fn connect_power_sensor(&self) -> AppResult<MockPowerSensor> {
        if !self.sensor_attached {
            return Err(PolarizerError::DeviceNotFound(
                "no power meter on the bench".to_string(),
            ));
        }
        Ok(MockPowerSensor {
            name: "Simulated power meter".to_string(),
            model: self.model,
            noise_mw: self.noise_mw,
            physical_deg: self.physical_deg.clone(),
            wavelength_nm: RwLock::new(0.0),
            closed: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        })
    }

    /// Microscope sharing this bench, if one is attached
    pub fn microscope(&self) -> Option<SimulatedMicroscope> {
        self.microscope_attached.then(|| SimulatedMicroscope {
            model: self.model,
            physical_deg: self.physical_deg.clone(),
            connected: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
        })
    }
}

// =============================================================================
// MockRotator - Simulated ELL14 rotation mount
// =============================================================================

/// Mock rotation mount with realistic timing
///
/// Simulates an ELL14 with:
/// - 180°/sec rotation plus 50ms per move
/// - Angles quantised to whole motor pulses
/// - A home offset kept in "device memory"; reported angles are relative to it
/// - Failure injection and a log of relative moves for tests
pub struct MockRotator {
    physical_deg: Arc<RwLock<f64>>,
    home_offset: RwLock<f64>,
    jog_step: RwLock<f64>,
    speed_deg_per_sec: f64,
    closed: AtomicBool,
    /// Remaining moves before the link drops; `None` means never
    moves_until_failure: Mutex<Option<usize>>,
    shifts: Mutex<Vec<f64>>,
    moves: AtomicUsize,
}

impl MockRotator {
    /// Mount driving the given shared physical angle
    pub fn new(physical_deg: Arc<RwLock<f64>>) -> Self {
        Self {
            physical_deg,
            home_offset: RwLock::new(0.0),
            jog_step: RwLock::new(1.0),
            speed_deg_per_sec: 180.0,
            closed: AtomicBool::new(false),
            moves_until_failure: Mutex::new(None),
            shifts: Mutex::new(Vec::new()),
            moves: AtomicUsize::new(0),
        }
    }

    /// Stand-alone mount at a physical angle (no bench)
    pub fn at(physical_deg: f64) -> Self {
        Self::new(Arc::new(RwLock::new(quantize(physical_deg))))
    }

    /// Let `moves` more moves succeed, then fail every command with `DeviceUnreachable`
    pub async fn fail_after_moves(&self, moves: usize) {
        *self.moves_until_failure.lock().await = Some(moves);
    }

    /// Relative moves received through `shift_angle`, in order
    pub async fn shifts(&self) -> Vec<f64> {
        self.shifts.lock().await.clone()
    }

    /// Number of completed moves of any kind
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.is_closed() {
            Err(PolarizerError::unreachable("rotator", "serial port is closed"))
        } else {
            Ok(())
        }
    }

    async fn consume_move(&self) -> AppResult<()> {
        let mut budget = self.moves_until_failure.lock().await;
        match budget.as_mut() {
            Some(0) => Err(PolarizerError::unreachable(
                "rotator",
                "no reply from the mount",
            )),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Move to a logical angle and report where the mount ended up
    async fn move_to(&self, target_deg: f64) -> AppResult<f64> {
        self.ensure_open()?;
        self.consume_move().await?;

        let offset = *self.home_offset.read().await;
        let current = *self.physical_deg.read().await;
        let target_physical = quantize(target_deg + offset);
        let travel = (target_physical - current).abs();

        sleep(MOVE_OVERHEAD + Duration::from_secs_f64(travel / self.speed_deg_per_sec)).await;

        *self.physical_deg.write().await = target_physical;
        self.moves.fetch_add(1, Ordering::SeqCst);
        let achieved = target_physical - offset;
        debug!(target_deg, achieved_deg = achieved, "MockRotator: move complete");
        Ok(achieved)
    }
}

#[async_trait]
impl Rotator for MockRotator {
    async fn angle(&self) -> AppResult<f64> {
        self.ensure_open()?;
        let offset = *self.home_offset.read().await;
        Ok(*self.physical_deg.read().await - offset)
    }

    async fn set_angle(&self, target_deg: f64) -> AppResult<f64> {
        self.move_to(target_deg).await
    }

    async fn shift_angle(&self, delta_deg: f64) -> AppResult<f64> {
        let current = self.angle().await?;
        let achieved = self.move_to(current + delta_deg).await?;
        self.shifts.lock().await.push(delta_deg);
        Ok(achieved)
    }

    async fn set_jog_step(&self, step_deg: f64) -> AppResult<()> {
        self.ensure_open()?;
        *self.jog_step.write().await = step_deg;
        Ok(())
    }

    async fn jog_step(&self) -> AppResult<f64> {
        self.ensure_open()?;
        Ok(*self.jog_step.read().await)
    }

    async fn jog(&self, direction: JogDirection) -> AppResult<f64> {
        let step = self.jog_step().await?;
        let current = self.angle().await?;
        self.move_to(current + direction.sign() * step).await
    }

    async fn home(&self) -> AppResult<f64> {
        self.move_to(0.0).await
    }

    async fn home_offset(&self) -> AppResult<f64> {
        self.ensure_open()?;
        Ok(*self.home_offset.read().await)
    }

    async fn set_home_offset(&self, offset_deg: f64) -> AppResult<()> {
        self.ensure_open()?;
        *self.home_offset.write().await = quantize(offset_deg);
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(PolarizerError::AlreadyClosed("rotator".to_string()));
        }
        info!("MockRotator: port closed");
        Ok(())
    }
}

// =============================================================================
// MockPowerSensor - Simulated power meter
// =============================================================================

/// Mock power meter reading the bench transmission
///
/// Adds uniform noise of `±noise_mw / 2` to each acquisition.
pub struct MockPowerSensor {
    name: String,
    model: PolarizerModel,
    noise_mw: f64,
    physical_deg: Arc<RwLock<f64>>,
    wavelength_nm: RwLock<f64>,
    closed: AtomicBool,
    failing: AtomicBool,
    reads: AtomicUsize,
}

impl MockPowerSensor {
    /// Make every following acquisition fail (or recover)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of acquisitions attempted
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Last wavelength set (nm)
    pub async fn wavelength(&self) -> f64 {
        *self.wavelength_nm.read().await
    }
}

#[async_trait]
impl PowerSensor for MockPowerSensor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_wavelength(&self, wavelength_nm: f64) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PolarizerError::unreachable(&self.name, "sensor is closed"));
        }
        *self.wavelength_nm.write().await = wavelength_nm;
        Ok(())
    }

    async fn get_power(&self) -> AppResult<f64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(PolarizerError::unreachable(&self.name, "sensor is closed"));
        }
        sleep(ACQUISITION_TIME).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(PolarizerError::unreachable(&self.name, "acquisition failed"));
        }

        let physical = *self.physical_deg.read().await;
        let mut power = self.model.power_at(physical);
        if self.noise_mw > 0.0 {
            let half = self.noise_mw / 2.0;
            power += rand::thread_rng().gen_range(-half..=half);
        }
        Ok(power)
    }

    async fn close(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(PolarizerError::AlreadyClosed(self.name.clone()));
        }
        info!(sensor = %self.name, "power sensor closed");
        Ok(())
    }
}

// =============================================================================
// ScriptedPowerSensor - fixed sequence of readings
// =============================================================================

/// One scripted acquisition result.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReading {
    /// Successful reading (mW)
    Power(f64),
    /// Acquisition failure with a reason
    Failure(String),
}

/// Sensor that replays a queue of readings, then repeats the last successful value.
pub struct ScriptedPowerSensor {
    script: Mutex<VecDeque<ScriptedReading>>,
    last: Mutex<f64>,
    acquisition_time: Duration,
    closed: AtomicBool,
    reads: AtomicUsize,
}

impl ScriptedPowerSensor {
    /// Replay `readings` in order
    pub fn new(readings: impl IntoIterator<Item = ScriptedReading>) -> Self {
        Self {
            script: Mutex::new(readings.into_iter().collect()),
            last: Mutex::new(0.0),
            acquisition_time: Duration::ZERO,
            closed: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        }
    }

    /// Replay plain power values
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        Self::new(values.into_iter().map(ScriptedReading::Power))
    }

    /// Sensor stuck at one value
    pub fn constant(value: f64) -> Self {
        Self::from_values([value])
    }

    /// Simulate a non-zero acquisition time
    pub fn with_acquisition_time(mut self, duration: Duration) -> Self {
        self.acquisition_time = duration;
        self
    }

    /// Queue more readings behind the current script
    pub async fn push(&self, reading: ScriptedReading) {
        self.script.lock().await.push_back(reading);
    }

    /// Number of acquisitions attempted
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PowerSensor for ScriptedPowerSensor {
    fn name(&self) -> &str {
        "Scripted power sensor"
    }

    async fn set_wavelength(&self, _wavelength_nm: f64) -> AppResult<()> {
        Ok(())
    }

    async fn get_power(&self) -> AppResult<f64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.acquisition_time.is_zero() {
            sleep(self.acquisition_time).await;
        }
        let next = self.script.lock().await.pop_front();
        let mut last = self.last.lock().await;
        match next {
            Some(ScriptedReading::Power(value)) => {
                *last = value;
                Ok(value)
            }
            Some(ScriptedReading::Failure(reason)) => {
                Err(PolarizerError::unreachable(self.name(), reason))
            }
            None => Ok(*last),
        }
    }

    async fn close(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(PolarizerError::AlreadyClosed(self.name().to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// SimulatedMicroscope - optical context
// =============================================================================

/// Optical context whose energy sensor sees the bench transmission.
pub struct SimulatedMicroscope {
    model: PolarizerModel,
    physical_deg: Arc<RwLock<f64>>,
    connected: AtomicBool,
    refuse: AtomicBool,
}

impl SimulatedMicroscope {
    /// Make the next connection attempts fail with `ConnectionRefused`
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl OpticalContext for SimulatedMicroscope {
    async fn connect(&self, config: &OpticalConfig) -> AppResult<()> {
        if config.host.trim().is_empty() {
            return Err(PolarizerError::ConnectionFailed(
                "no microscope host configured".to_string(),
            ));
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(PolarizerError::ConnectionRefused(format!(
                "{} did not answer, retry to connect again",
                config.host
            )));
        }
        sleep(MOVE_OVERHEAD).await;
        self.connected.store(true, Ordering::SeqCst);
        info!(host = %config.host, "connected to microscope");
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("disconnected from microscope");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn energy_sensor(&self) -> AppResult<f64> {
        if !self.is_connected() {
            return Err(PolarizerError::OpticalContextUnavailable);
        }
        sleep(ACQUISITION_TIME).await;
        Ok(self.model.power_at(*self.physical_deg.read().await))
    }
}

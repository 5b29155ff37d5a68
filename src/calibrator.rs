//! Zero-offset calibration.
//!
//! Averages `averages` power samples taken `delay` apart on its own tokio task, so the
//! scheduler keeps ticking while it runs. Progress flows back over an mpsc channel:
//! `Progress` once per sample, then exactly one terminal event (`Completed`, `Failed` or
//! `Cancelled`). The shared [`CalibrationOffset`] is written once, on completion only.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut handle = Calibrator::new(sensor, offset.clone(), config.calibration.clone()).spawn();
//! while let Some(event) = handle.next_event().await {
//!     println!("{}", event.message());
//! }
//! ```

use crate::config::CalibrationConfig;
use crate::error::{AppResult, PolarizerError};
use crate::exclusive::OperationGuard;
use crate::hardware::PowerSensor;
use crate::offset::CalibrationOffset;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Notifications emitted by a calibration run.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    /// `count` of `total` samples collected
    Progress {
        /// Samples collected so far
        count: u32,
        /// Samples requested
        total: u32,
    },
    /// Run finished; the offset has been stored
    Completed {
        /// Mean of all samples (mW)
        offset_mw: f64,
    },
    /// A sample failed; the offset is unchanged
    Failed(String),
    /// Cancelled between samples; the offset is unchanged
    Cancelled,
}

impl CalibrationEvent {
    /// Operator-facing status text
    pub fn message(&self) -> String {
        match self {
            CalibrationEvent::Progress { count, .. } => format!("Zero adjust step: {count}"),
            CalibrationEvent::Completed { offset_mw } => {
                format!("Zero adjust done: {offset_mw} mW")
            }
            CalibrationEvent::Failed(reason) => format!("Zero adjust failed: {reason}"),
            CalibrationEvent::Cancelled => "Zero adjust cancelled".to_string(),
        }
    }

    /// Whether no further events follow
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CalibrationEvent::Progress { .. })
    }
}

/// Progress events buffered ahead of a slow consumer.
const EVENT_BUFFER: usize = 64;

/// One calibration run, configured and ready to spawn.
pub struct Calibrator {
    sensor: Arc<dyn PowerSensor>,
    offset: CalibrationOffset,
    averages: u32,
    delay: Duration,
    guard: Option<OperationGuard>,
}

impl Calibrator {
    /// Calibrate `sensor` into `offset`
    pub fn new(
        sensor: Arc<dyn PowerSensor>,
        offset: CalibrationOffset,
        config: CalibrationConfig,
    ) -> Self {
        Self {
            sensor,
            offset,
            averages: config.averages,
            delay: config.delay,
            guard: None,
        }
    }

    /// Hold an operation slot until the run ends
    pub fn with_guard(mut self, guard: OperationGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Start the run on its own task.
    pub fn spawn(self) -> CalibrationHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(events_tx, cancel_rx));
        CalibrationHandle {
            events: events_rx,
            cancel: cancel_tx,
            task,
        }
    }

    async fn run(
        self,
        events: mpsc::Sender<CalibrationEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> AppResult<f64> {
        // Released when the run ends, whatever the outcome
        let _guard = self.guard;
        let total = self.averages;
        if total == 0 {
            let reason = "calibration needs at least one sample".to_string();
            emit(&events, CalibrationEvent::Failed(reason.clone())).await;
            return Err(PolarizerError::Configuration(reason));
        }

        info!(averages = total, delay = ?self.delay, "zero-offset calibration started");
        let mut sum = 0.0;

        for count in 1..=total {
            if *cancel.borrow() {
                return cancelled(&events).await;
            }

            match self.sensor.get_power().await {
                Ok(value) => sum += value,
                Err(err) => {
                    warn!(error = %err, "calibration sample failed, offset unchanged");
                    emit(&events, CalibrationEvent::Failed(err.to_string())).await;
                    return Err(err);
                }
            }

            if pause(self.delay, &mut cancel).await {
                return cancelled(&events).await;
            }

            debug!(count, total, "calibration sample");
            emit(&events, CalibrationEvent::Progress { count, total }).await;
        }

        let offset_mw = sum / f64::from(total);
        self.offset.store(offset_mw);
        info!(offset_mw, "zero-offset calibration finished");
        emit(&events, CalibrationEvent::Completed { offset_mw }).await;
        Ok(offset_mw)
    }
}

async fn emit(events: &mpsc::Sender<CalibrationEvent>, event: CalibrationEvent) {
    // Nobody listening is fine; the offset is still stored.
    let _ = events.send(event).await;
}

async fn cancelled(events: &mpsc::Sender<CalibrationEvent>) -> AppResult<f64> {
    info!("zero-offset calibration cancelled");
    emit(events, CalibrationEvent::Cancelled).await;
    Err(PolarizerError::Cancelled)
}

/// Sleep for `delay`; true when cancellation was requested meanwhile.
async fn pause(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    let sleeper = sleep(delay);
    tokio::pin!(sleeper);
    loop {
        tokio::select! {
            _ = &mut sleeper => return *cancel.borrow(),
            changed = cancel.changed() => match changed {
                Ok(()) if *cancel.borrow_and_update() => return true,
                Ok(()) => continue,
                Err(_) => {
                    // Handle dropped: nobody can cancel any more
                    (&mut sleeper).await;
                    return false;
                }
            },
        }
    }
}

/// Caller's side of a running calibration.
pub struct CalibrationHandle {
    events: mpsc::Receiver<CalibrationEvent>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<AppResult<f64>>,
}

impl CalibrationHandle {
    /// Next progress or terminal event; `None` once the run is over and drained
    pub async fn next_event(&mut self) -> Option<CalibrationEvent> {
        self.events.recv().await
    }

    /// Request cancellation; honoured before the next sample
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Whether the task has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Split into the event stream, a cancel sender and the task
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<CalibrationEvent>,
        watch::Sender<bool>,
        JoinHandle<AppResult<f64>>,
    ) {
        (self.events, self.cancel, self.task)
    }

    /// Wait for the run to end and return the stored offset
    pub async fn wait(self) -> AppResult<f64> {
        match self.task.await {
            Ok(result) => result,
            Err(join) => Err(PolarizerError::unreachable(
                "calibrator",
                format!("calibration task ended abnormally: {join}"),
            )),
        }
    }
}

//! # Polarizer Control Library
//!
//! Closed-loop control of a motorized polarizer: the stage is rotated until a power-sensor
//! reading matches an operator setpoint, and the angle of minimum transmission can be
//! located automatically. By organizing the project as a library, the console binary
//! (`main.rs`) and the integration tests share one implementation.
//!
//! ## Crate Structure
//!
//! - **`app`**: `PolarizerApp`, the facade wiring devices, scheduler and status board and
//!   exposing one method per operator command.
//! - **`calibrator`**: background zero-offset averaging reporting over a channel.
//! - **`config`**: figment-based configuration (`AppConfig`) with validation.
//! - **`controller`**: the proportional stepping state machine and its clamp rule.
//! - **`error`**: the `PolarizerError` enum for centralized error handling.
//! - **`exclusive`**: mutual exclusion between calibration, seek and minimum search.
//! - **`hardware`**: capability traits for the rotator, power sensor and microscope, the
//!   simulated bench, and USB discovery.
//! - **`logging`**: tracing-subscriber initialisation.
//! - **`minimum_finder`**: the angular sweep that re-homes on the transmission minimum.
//! - **`offset`**: the atomically shared calibration offset.
//! - **`operator`**: the line-oriented command language of the console.
//! - **`sampler`**: single offset-corrected sensor polls.
//! - **`scheduler`**: the periodic task dispatching between sampling and correcting.
//! - **`status`**: free-text operator notifications.

pub mod app;
pub mod calibrator;
pub mod config;
pub mod controller;
pub mod error;
pub mod exclusive;
pub mod hardware;
pub mod logging;
pub mod minimum_finder;
pub mod offset;
pub mod operator;
pub mod sampler;
pub mod scheduler;
pub mod status;

pub use app::{Devices, JogSpeed, PolarizerApp};
pub use error::{AppResult, PolarizerError};

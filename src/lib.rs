//! # UV Exposure Controller
//!
//! Drives a multi-channel UV LED exposure device through timed procedures: a
//! list of `(duration, intensity)` steps applied to a chosen set of channels,
//! cancellable at any point, with the LEDs always switched off on the way out.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the [`hardware::HardwareLink`] capability trait, the serial
//!   driver link, and a mock link for tests and hardware-free runs.
//! - **`procedures`**: procedure steps and requests, the cooperative stop signal,
//!   and the single-slot [`procedures::ProcedureExecutor`].
//! - **`controller`**: the facade the boundary layers talk to; handshakes with the device
//!   once at startup and falls back to safe mode.
//! - **`api`**: the axum HTTP boundary.
//! - **`config`**: layered settings (defaults, TOML file, `UVX_` environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: error types for every layer.

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod procedures;

pub use controller::{Controller, StopOutcome};
pub use error::{AppError, AppResult};

//! Custom error types for the application.
//!
//! Errors are split by who observes them:
//!
//! - **`HardwareError`**: a command to the LED driver failed. Inside a running procedure
//!   this aborts the run to cleanup; it never reaches the caller that started the run.
//! - **`RejectionReason`**: a control request was refused synchronously (a procedure is
//!   already running, a control switch holds the slot, or the system is in safe mode).
//!   No state changes on rejection.
//! - **`RequestError`**: a procedure request failed validation before reaching the
//!   executor.
//! - **`ControlError`**: a direct control command was refused or the driver failed it.
//! - **`ConnectionError`**: the startup handshake could not bring the device up. The
//!   controller logs it and continues in safe mode.
//! - **`AppError`**: process-level failures (configuration, I/O, binding the listener).
//!   These are the only errors that end the process, and only during startup.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// A command to the LED driver failed
#[derive(Error, Debug)]
pub enum HardwareError {
    /// The link has no open port
    #[error("LED driver not connected")]
    NotConnected,

    /// Reading or writing the port failed
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply line arrived in time
    #[error("No reply from LED driver within {0:?}")]
    Timeout(std::time::Duration),

    /// The driver answered with an error reply
    #[error("LED driver rejected command '{command}': {reply}")]
    Rejected {
        /// Command as sent, without terminator
        command: String,
        /// Reply line as received
        reply: String,
    },

    /// A command template references an unknown placeholder
    #[error("Invalid command template: {0}")]
    Template(String),

    /// Built without the `instrument_serial` feature
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

/// Why a start (or manual/program control switch) was refused.
///
/// No state changes on rejection.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// The slot holds a running or stopping procedure
    #[error("A procedure is already running")]
    AlreadyRunning,

    /// The startup handshake failed
    #[error("Controller is in safe mode: no hardware connected")]
    SafeMode,

    /// A manual/program control switch holds the slot
    #[error("A control command is in progress")]
    ControlInProgress,
}

/// A procedure request failed validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Some step is lit but no channel is selected
    #[error("At least one channel must be selected when any step has non-zero intensity")]
    MissingChannels,

    /// Channel id outside `1..=channel_count`
    #[error("Invalid channel {0}: channels are numbered from 1 to {1}")]
    InvalidChannel(i64, u8),

    /// Step time that parses to no duration
    #[error("Invalid step duration '{0}'")]
    InvalidDuration(String),

    /// Step durations sum past `Duration::MAX`
    #[error("Total procedure duration is too long")]
    ProcedureTooLong,
}

/// Failure of a direct control command (manual/program control switch).
#[derive(Error, Debug)]
pub enum ControlError {
    /// Refused before reaching the driver
    #[error(transparent)]
    Rejected(#[from] RejectionReason),

    /// The driver failed the command
    #[error("LED driver command failed: {0}")]
    Hardware(#[from] HardwareError),
}

/// The startup handshake could not bring the device up
#[derive(Error, Debug)]
#[error("Failed to connect to LED driver on {port}: {source}")]
pub struct ConnectionError {
    /// Link description, usually the port path
    pub port: String,
    /// What the handshake hit
    #[source]
    pub source: HardwareError,
}

/// Process-level failure
#[derive(Error, Debug)]
pub enum AppError {
    /// Loading or merging configuration sources
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Loaded configuration failed validation
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Binding the listener or reading a file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Procedure file is neither valid JSON nor TOML
    #[error("Failed to parse procedure file: {0}")]
    ProcedureFile(String),

    /// Procedure file failed validation
    #[error("Invalid procedure: {0}")]
    Request(#[from] RequestError),

    /// The executor refused the run
    #[error("Procedure rejected: {0}")]
    Rejected(#[from] RejectionReason),

    /// Installing the global subscriber failed
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

impl From<figment::Error> for AppError {
    fn from(value: figment::Error) -> Self {
        AppError::Config(Box::new(value))
    }
}

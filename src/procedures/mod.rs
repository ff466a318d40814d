//! Exposure Procedures
//!
//! A procedure energizes a set of channels, walks an ordered list of
//! `(duration, intensity)` steps, and always de-energizes on the way out.
//!
//! # Key Concepts
//!
//! - **ProcedureStep / ProcedureRequest**: validated, immutable inputs
//! - **ProcedureExecutor**: the single procedure slot; runs one request at a time
//!   on a supervised background task
//! - **StopSignal**: cooperative cancellation, raced against every timed wait
//!
//! # State Machine
//!
//! ```text
//!         start (accepted)              stop
//! Idle ─────────────────────> Running ──────────> StopRequested
//!  ▲                             │                     │
//!  │   completed / failed        │                     │ stopped
//!  └─────────────────────────────┴─────────────────────┘
//!                 (cleanup: de-energize all channels)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let timing = ExecutorTiming::default();
//! let executor = ProcedureExecutor::new(link, ConnectionState::Connected, timing);
//! let request = ProcedureRequest::new(
//!     vec![ProcedureStep::new(Duration::from_secs(5), 50)],
//!     ChannelSet::new([1, 2, 3, 4])?,
//! )?;
//!
//! let accepted = executor.start(request)?;   // returns immediately
//! executor.stop();                          // cooperative, takes effect at the next wait
//! executor.wait_idle().await;
//! ```

pub mod executor;
pub mod step;
pub mod stop_signal;

pub use executor::{Accepted, ExecutorTiming, ProcedureExecutor};
pub use step::{parse_step_time, ProcedureRequest, ProcedureStep};
pub use stop_signal::{StopSignal, WaitOutcome};

use crate::hardware::Intensity;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// State of the single procedure slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No procedure running; a start will be accepted
    #[default]
    Idle,
    /// A procedure is executing
    Running,
    /// Stop was signaled; the task is on its way to cleanup
    StopRequested,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Running => write!(f, "Running"),
            RunState::StopRequested => write!(f, "StopRequested"),
        }
    }
}

impl RunState {
    /// Whether a procedure task is alive
    pub fn is_active(&self) -> bool {
        !matches!(self, RunState::Idle)
    }
}

/// Result of the startup handshake. Fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// The device answered the handshake
    Connected,
    /// No usable device: all hardware-mutating operations are rejected
    SafeMode,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::SafeMode => write!(f, "SafeMode"),
        }
    }
}

/// Live position within a running procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcedureProgress {
    /// 1-based index of the executing step
    pub current_step: usize,
    /// Steps in the request, skipped ones included
    pub total_steps: usize,
    /// Output level of the current step
    pub intensity: Intensity,
    /// Time left in the current step
    #[serde(with = "humantime_serde")]
    pub remaining: Duration,
}

/// How the most recent run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step ran to the end
    Completed,
    /// A stop request cut the run short
    Stopped,
    /// A hardware error or panic aborted the run
    Failed {
        /// Rendered cause
        reason: String,
    },
}

impl RunOutcome {
    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        RunOutcome::Failed {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Stopped => write!(f, "stopped"),
            RunOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Point-in-time view of the executor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorStatus {
    /// Slot state
    pub state: RunState,
    /// Fixed at startup
    pub connection: ConnectionState,
    /// Id of the active run, if any
    pub run_id: Option<Uuid>,
    /// Position within the active run
    pub progress: Option<ProcedureProgress>,
    /// Outcome of the last finished run; survives until the next one ends
    pub last_outcome: Option<RunOutcome>,
}

/// Out-of-band notifications from the procedure task
///
/// Every variant carries the `run_id` of the run it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    /// Channels are about to be energized
    Started {
        /// Run the event belongs to
        run_id: Uuid,
        /// Steps in the request
        total_steps: usize,
    },
    /// A step's intensity was applied
    StepStarted {
        /// Run the event belongs to
        run_id: Uuid,
        /// 1-based step index
        step: usize,
        /// Level just applied
        intensity: Intensity,
        /// How long the step holds
        duration: Duration,
    },
    /// Cleanup has run and the slot is idle again
    Finished {
        /// Run the event belongs to
        run_id: Uuid,
        /// How the run ended
        outcome: RunOutcome,
    },
}

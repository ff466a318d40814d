//! Procedure Steps and Requests
//!
//! A procedure is an ordered list of `(duration, intensity)` steps applied to one
//! set of channels. Both types are immutable once built and validate their
//! invariants at construction, so the executor never re-checks them.

use crate::error::RequestError;
use crate::hardware::{ChannelSet, Intensity};
use serde::Serialize;
use std::time::Duration;

// =============================================================================
// ProcedureStep
// =============================================================================

/// One exposure instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcedureStep {
    #[serde(with = "humantime_serde")]
    duration: Duration,
    intensity: Intensity,
}

impl ProcedureStep {
    /// Create a step; `intensity` is clamped into `0..=100`.
    pub fn new(duration: Duration, intensity: i64) -> Self {
        Self {
            duration,
            intensity: Intensity::clamped(intensity),
        }
    }

    /// Parse a step from its textual time (see [`parse_step_time`]).
    pub fn parse(time: &str, intensity: i64) -> Result<Self, RequestError> {
        Ok(Self::new(parse_step_time(time)?, intensity))
    }

    /// How long the step holds its intensity
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Output level for the step
    pub fn intensity(&self) -> Intensity {
        self.intensity
    }

    /// A zero-length, zero-intensity step is skipped without touching hardware.
    pub fn is_noop(&self) -> bool {
        self.duration.is_zero() && self.intensity.is_off()
    }
}

/// Parse a step time.
///
/// Accepted forms: `HH:MM:SS`, `MM:SS`, or plain seconds (fractional allowed).
/// Components must be non-negative; minutes and seconds in the colon forms are
/// not range-checked, so `00:90:00` is ninety minutes.
pub fn parse_step_time(time: &str) -> Result<Duration, RequestError> {
    let invalid = || RequestError::InvalidDuration(time.to_string());
    let trimmed = time.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    if trimmed.contains(':') {
        let parts: Vec<&str> = trimmed.split(':').collect();
        if parts.len() > 3 {
            return Err(invalid());
        }
        let mut total: u64 = 0;
        for part in parts {
            let value: u64 = part.trim().parse().map_err(|_| invalid())?;
            total = total
                .checked_mul(60)
                .and_then(|t| t.checked_add(value))
                .ok_or_else(invalid)?;
        }
        return Ok(Duration::from_secs(total));
    }

    let seconds: f64 = trimmed.parse().map_err(|_| invalid())?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

// =============================================================================
// ProcedureRequest
// =============================================================================

/// A complete procedure: steps in execution order plus the channels to energize.
///
/// Invariants: `channels` is non-empty whenever any step has non-zero intensity,
/// and the summed step durations fit in a `Duration`. An empty step list is a
/// valid no-op run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcedureRequest {
    steps: Vec<ProcedureStep>,
    channels: ChannelSet,
    #[serde(with = "humantime_serde")]
    total_duration: Duration,
}

impl ProcedureRequest {
    /// Validate and build a request.
    pub fn new(steps: Vec<ProcedureStep>, channels: ChannelSet) -> Result<Self, RequestError> {
        let lights_anything = steps.iter().any(|step| !step.intensity().is_off());
        if lights_anything && channels.is_empty() {
            return Err(RequestError::MissingChannels);
        }
        let total_duration = steps
            .iter()
            .try_fold(Duration::ZERO, |total, step| total.checked_add(step.duration()))
            .ok_or(RequestError::ProcedureTooLong)?;
        Ok(Self {
            steps,
            channels,
            total_duration,
        })
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[ProcedureStep] {
        &self.steps
    }

    /// Channels energized for the whole run
    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Sum of all step durations
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }
}

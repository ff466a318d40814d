//! Mock LED Driver
//!
//! A simulated exposure device for testing without hardware. Every call is
//! recorded with the (tokio) instant it arrived, so tests running on a paused
//! clock can assert both ordering and timing.
//!
//! Failures can be injected per operation, either as a `HardwareError` or as a
//! panic (to exercise task supervision).
//!
//! # Example
//!
//! ```rust,ignore
//! let link = MockLedLink::new().failing_on(LinkOp::SetIntensity);
//! assert!(link.set_intensity(Intensity::clamped(10)).await.is_err());
//! assert_eq!(link.calls(), vec![LinkCall::SetIntensity(10)]);
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::error::HardwareError;
use crate::hardware::capabilities::HardwareLink;
use crate::hardware::{ChannelSet, Intensity};

/// A recorded call, with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    /// `set_intensity`, in percent
    SetIntensity(u8),
    /// `energize_channels`, ids ascending
    EnergizeChannels(Vec<u8>),
    /// `deenergize_all`
    DeenergizeAll,
    /// `enable_manual_control`
    ManualControl,
    /// `enable_program_control`
    ProgramControl,
}

impl LinkCall {
    /// Kind of this call, without arguments
    pub fn op(&self) -> LinkOp {
        match self {
            LinkCall::SetIntensity(_) => LinkOp::SetIntensity,
            LinkCall::EnergizeChannels(_) => LinkOp::EnergizeChannels,
            LinkCall::DeenergizeAll => LinkOp::DeenergizeAll,
            LinkCall::ManualControl => LinkOp::ManualControl,
            LinkCall::ProgramControl => LinkOp::ProgramControl,
        }
    }
}

/// Operation kind, used to target failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkOp {
    /// Matches [`LinkCall::SetIntensity`]
    SetIntensity,
    /// Matches [`LinkCall::EnergizeChannels`]
    EnergizeChannels,
    /// Matches [`LinkCall::DeenergizeAll`]
    DeenergizeAll,
    /// Matches [`LinkCall::ManualControl`]
    ManualControl,
    /// Matches [`LinkCall::ProgramControl`]
    ProgramControl,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Error,
    Panic,
}

/// Mock LED driver
///
/// - Connected by default; [`MockLedLink::disconnected`] simulates an absent device
/// - Optional per-call latency (uses `tokio::time::sleep`, never blocks the runtime)
/// - Calls recorded even when they fail
pub struct MockLedLink {
    connected: AtomicBool,
    latency: Duration,
    faults: Mutex<HashMap<LinkOp, Fault>>,
    timeline: Mutex<Vec<(Instant, LinkCall)>>,
}

impl MockLedLink {
    /// Create a connected mock with no latency
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            latency: Duration::ZERO,
            faults: Mutex::new(HashMap::new()),
            timeline: Mutex::new(Vec::new()),
        }
    }

    /// A mock whose device never answered: every mutating call fails
    pub fn disconnected() -> Self {
        let link = Self::new();
        link.connected.store(false, Ordering::SeqCst);
        link
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every call of `op` fail with a `HardwareError`
    pub fn failing_on(self, op: LinkOp) -> Self {
        self.inject(op, Fault::Error);
        self
    }

    /// Make every call of `op` panic
    pub fn panicking_on(self, op: LinkOp) -> Self {
        self.inject(op, Fault::Panic);
        self
    }

    /// Remove any injected fault for `op`
    pub fn heal(&self, op: LinkOp) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.remove(&op);
        }
    }

    fn inject(&self, op: LinkOp, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(op, fault);
        }
    }

    /// Calls received so far, in order
    pub fn calls(&self) -> Vec<LinkCall> {
        self.timeline()
            .into_iter()
            .map(|(_, call)| call)
            .collect()
    }

    /// Calls received so far, with arrival instants
    pub fn timeline(&self) -> Vec<(Instant, LinkCall)> {
        self.timeline
            .lock()
            .map(|timeline| timeline.clone())
            .unwrap_or_default()
    }

    /// Number of calls of the given kind
    pub fn count(&self, op: LinkOp) -> usize {
        self.calls().iter().filter(|call| call.op() == op).count()
    }

    /// Forget recorded calls
    pub fn clear(&self) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.clear();
        }
    }

    async fn record(&self, call: LinkCall) -> Result<(), HardwareError> {
        let op = call.op();
        debug!(?call, "MockLedLink call");
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.push((Instant::now(), call));
        }

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        if !self.is_connected() {
            return Err(HardwareError::NotConnected);
        }

        let fault = self
            .faults
            .lock()
            .ok()
            .and_then(|faults| faults.get(&op).copied());
        match fault {
            None => Ok(()),
            Some(Fault::Error) => Err(HardwareError::Rejected {
                command: format!("{:?}", op),
                reply: "injected failure".to_string(),
            }),
            #[allow(clippy::panic)]
            Some(Fault::Panic) => panic!("MockLedLink: injected panic in {:?}", op),
        }
    }
}

impl Default for MockLedLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareLink for MockLedLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        "mock LED driver".to_string()
    }

    async fn set_intensity(&self, value: Intensity) -> Result<(), HardwareError> {
        self.record(LinkCall::SetIntensity(value.percent())).await
    }

    async fn energize_channels(&self, channels: &ChannelSet) -> Result<(), HardwareError> {
        self.record(LinkCall::EnergizeChannels(channels.iter().collect()))
            .await
    }

    async fn deenergize_all(&self) -> Result<(), HardwareError> {
        self.record(LinkCall::DeenergizeAll).await
    }

    async fn enable_manual_control(&self) -> Result<(), HardwareError> {
        self.record(LinkCall::ManualControl).await
    }

    async fn enable_program_control(&self) -> Result<(), HardwareError> {
        self.record(LinkCall::ProgramControl).await
    }
}

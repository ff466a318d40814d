//! Controller facade
//!
//! The one object the boundary layers (HTTP, CLI) talk to. It owns the hardware
//! link and the procedure executor, and fixes the connection state once, at
//! construction, by probing the device.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::error::{ConnectionError, ControlError, HardwareError, RejectionReason};
use crate::hardware::HardwareLink;
use crate::procedures::{
    Accepted, ConnectionState, ExecutorEvent, ExecutorStatus, ExecutorTiming, ProcedureExecutor,
    ProcedureRequest, RunState,
};

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// A running procedure was told to stop
    Signaled,
    /// Nothing was running
    NotRunning,
}

/// Owns the hardware link and the executor that drives it
pub struct Controller {
    link: Arc<dyn HardwareLink>,
    executor: ProcedureExecutor,
}

impl Controller {
    /// Handshake with the device and build the controller.
    ///
    /// The handshake requires the link to report connected and to accept a switch
    /// to program control. A failed handshake is logged and leaves the controller
    /// in safe mode; it never fails construction.
    #[instrument(skip_all, fields(link = %link.describe()))]
    pub async fn connect(link: Arc<dyn HardwareLink>, timing: ExecutorTiming) -> Self {
        let connection = match handshake(link.as_ref()).await {
            Ok(()) => {
                info!("LED driver connected, program control enabled");
                ConnectionState::Connected
            }
            Err(error) => {
                warn!(%error, "Entering safe mode");
                ConnectionState::SafeMode
            }
        };
        Self::with_connection(link, connection, timing)
    }

    /// Build a controller with a known connection state, skipping the handshake
    pub fn with_connection(
        link: Arc<dyn HardwareLink>,
        connection: ConnectionState,
        timing: ExecutorTiming,
    ) -> Self {
        let executor = ProcedureExecutor::new(link.clone(), connection, timing);
        Self { link, executor }
    }

    /// Validate the slot and run `request` in the background.
    pub fn start_procedure(&self, request: ProcedureRequest) -> Result<Accepted, RejectionReason> {
        self.executor.start(request)
    }

    /// Ask the running procedure, if any, to stop.
    pub fn stop_procedure(&self) -> StopOutcome {
        if self.executor.stop() {
            StopOutcome::Signaled
        } else {
            StopOutcome::NotRunning
        }
    }

    /// Connected or safe mode, as fixed by the handshake
    pub fn connection_status(&self) -> ConnectionState {
        self.executor.connection()
    }

    /// Current executor state
    pub fn run_status(&self) -> RunState {
        self.executor.status()
    }

    /// Full status for reporting
    pub fn status_snapshot(&self) -> ExecutorStatus {
        self.executor.snapshot()
    }

    /// Receive run events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.executor.subscribe()
    }

    /// Human-readable name of the hardware link
    pub fn link_description(&self) -> String {
        self.link.describe()
    }

    /// Hand the device to its front panel.
    ///
    /// Holds the executor slot until the device answers, so a procedure cannot
    /// start halfway through the switch.
    pub async fn enable_manual_control(&self) -> Result<(), ControlError> {
        self.executor
            .with_slot_reserved(self.link.enable_manual_control())
            .await??;
        info!("Manual control enabled");
        Ok(())
    }

    /// Take the device back from its front panel.
    pub async fn enable_program_control(&self) -> Result<(), ControlError> {
        self.executor
            .with_slot_reserved(self.link.enable_program_control())
            .await??;
        info!("Program control enabled");
        Ok(())
    }

    /// Resolve once no procedure is running.
    pub async fn wait_idle(&self) {
        self.executor.wait_idle().await;
    }

    /// Stop any running procedure and wait until the channels are off.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }
}

async fn handshake(link: &dyn HardwareLink) -> Result<(), ConnectionError> {
    let fail = |source| ConnectionError {
        port: link.describe(),
        source,
    };
    if !link.is_connected() {
        return Err(fail(HardwareError::NotConnected));
    }
    link.enable_program_control().await.map_err(fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{LinkCall, LinkOp, MockLedLink};
    use crate::hardware::ChannelSet;
    use crate::procedures::ProcedureStep;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn handshake_enables_program_control() {
        let link = Arc::new(MockLedLink::new());
        let controller = Controller::connect(link.clone(), ExecutorTiming::default()).await;

        assert_eq!(controller.connection_status(), ConnectionState::Connected);
        assert_eq!(link.calls(), vec![LinkCall::ProgramControl]);
    }

    #[tokio::test]
    #[traced_test]
    async fn unreachable_device_means_safe_mode() {
        let controller =
            Controller::connect(Arc::new(MockLedLink::disconnected()), ExecutorTiming::default())
                .await;

        assert_eq!(controller.connection_status(), ConnectionState::SafeMode);
        assert!(logs_contain("Entering safe mode"));
    }

    #[tokio::test]
    async fn rejected_handshake_means_safe_mode() {
        let link = Arc::new(MockLedLink::new().failing_on(LinkOp::ProgramControl));
        let controller = Controller::connect(link, ExecutorTiming::default()).await;
        assert_eq!(controller.connection_status(), ConnectionState::SafeMode);
    }

    #[tokio::test]
    async fn stop_outcome_reflects_executor() {
        let link = Arc::new(MockLedLink::new());
        let controller = Controller::connect(link, ExecutorTiming::default()).await;
        assert_eq!(controller.stop_procedure(), StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn manual_control_rejected_in_safe_mode() {
        let link = Arc::new(MockLedLink::disconnected());
        let controller = Controller::connect(link.clone(), ExecutorTiming::default()).await;
        link.clear();

        assert!(matches!(
            controller.enable_manual_control().await,
            Err(ControlError::Rejected(RejectionReason::SafeMode))
        ));
        assert!(link.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_control_rejected_while_running() {
        let link = Arc::new(MockLedLink::new());
        let controller = Controller::connect(link.clone(), ExecutorTiming::default()).await;
        let steps = vec![ProcedureStep::new(Duration::from_secs(5), 50)];
        let request = ProcedureRequest::new(steps, ChannelSet::new([1]).unwrap()).unwrap();
        controller.start_procedure(request).unwrap();

        assert!(matches!(
            controller.enable_program_control().await,
            Err(ControlError::Rejected(RejectionReason::AlreadyRunning))
        ));
        controller.shutdown().await;
        assert_eq!(link.count(LinkOp::ProgramControl), 1);
    }

    #[tokio::test]
    async fn manual_control_surfaces_hardware_failure() {
        let link = Arc::new(MockLedLink::new().failing_on(LinkOp::ManualControl));
        let controller = Controller::connect(link, ExecutorTiming::default()).await;

        assert!(matches!(
            controller.enable_manual_control().await,
            Err(ControlError::Hardware(_))
        ));
    }
}

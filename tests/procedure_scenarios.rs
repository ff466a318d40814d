//! Integration tests for procedure execution through the controller
//!
//! All tests run on tokio's paused clock, so timings are exact and the tests
//! finish instantly regardless of procedure length. `MockLedLink` records the
//! instant of every call.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use uv_exposure::error::RejectionReason;
use uv_exposure::hardware::{ChannelSet, LinkCall, LinkOp, MockLedLink};
use uv_exposure::procedures::{
    ConnectionState, ExecutorEvent, ExecutorTiming, ProcedureRequest, ProcedureStep, RunOutcome,
    RunState,
};
use uv_exposure::{Controller, StopOutcome};

async fn controller(link: Arc<MockLedLink>) -> Controller {
    let controller = Controller::connect(link.clone(), ExecutorTiming::default()).await;
    assert_eq!(controller.connection_status(), ConnectionState::Connected);
    // Drop the handshake's program-control call so timelines start at the run
    link.clear();
    controller
}

fn request(steps: &[(u64, i64)], channels: &[u8]) -> ProcedureRequest {
    let steps = steps
        .iter()
        .map(|&(secs, intensity)| ProcedureStep::new(Duration::from_secs(secs), intensity))
        .collect();
    ProcedureRequest::new(steps, ChannelSet::new(channels.iter().copied()).unwrap()).unwrap()
}

/// Offsets of each recorded call from `t0`
fn offsets(link: &MockLedLink, t0: Instant) -> Vec<(Duration, LinkCall)> {
    link.timeline()
        .into_iter()
        .map(|(at, call)| (at - t0, call))
        .collect()
}

fn assert_near(actual: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= Duration::from_millis(5),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}

// =============================================================================
// Full runs
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_step_run_timeline() {
    let link = Arc::new(MockLedLink::new());
    let controller = controller(link.clone()).await;
    let t0 = Instant::now();

    controller
        .start_procedure(request(&[(5, 50)], &[1, 2, 3, 4]))
        .unwrap();
    controller.wait_idle().await;

    let timeline = offsets(&link, t0);
    assert_eq!(timeline.len(), 3);

    assert_eq!(timeline[0].1, LinkCall::EnergizeChannels(vec![1, 2, 3, 4]));
    assert_near(timeline[0].0, 0);
    assert_eq!(timeline[1].1, LinkCall::SetIntensity(50));
    assert_near(timeline[1].0, 500);
    assert_eq!(timeline[2].1, LinkCall::DeenergizeAll);
    assert_near(timeline[2].0, 5500);

    assert_eq!(controller.run_status(), RunState::Idle);
    assert_eq!(
        controller.status_snapshot().last_outcome,
        Some(RunOutcome::Completed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_intensity_over_range_is_clamped() {
    let link = Arc::new(MockLedLink::new());
    let controller = controller(link.clone()).await;

    controller
        .start_procedure(request(&[(1, 150), (1, -20)], &[2]))
        .unwrap();
    controller.wait_idle().await;

    assert_eq!(
        link.calls(),
        vec![
            LinkCall::EnergizeChannels(vec![2]),
            LinkCall::SetIntensity(100),
            LinkCall::SetIntensity(0),
            LinkCall::DeenergizeAll,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_zero_intensity_does_not_end_the_run() {
    let link = Arc::new(MockLedLink::new());
    let controller = controller(link.clone()).await;
    let t0 = Instant::now();

    controller
        .start_procedure(request(&[(2, 40), (2, 0), (2, 60)], &[1]))
        .unwrap();
    controller.wait_idle().await;

    let timeline = offsets(&link, t0);
    let sets: Vec<_> = timeline
        .iter()
        .filter(|(_, call)| call.op() == LinkOp::SetIntensity)
        .collect();
    assert_eq!(sets.len(), 3);
    assert_eq!(sets[2].1, LinkCall::SetIntensity(60));
    assert_near(sets[2].0, 4500);
    assert_near(timeline.last().unwrap().0, 6500);
}

#[tokio::test(start_paused = true)]
async fn test_empty_procedure_still_cleans_up() {
    let link = Arc::new(MockLedLink::new());
    let controller = controller(link.clone()).await;

    let empty = ProcedureRequest::new(Vec::new(), ChannelSet::default()).unwrap();
    controller.start_procedure(empty).unwrap();
    controller.wait_idle().await;

    assert_eq!(
        link.calls(),
        vec![LinkCall::EnergizeChannels(vec![]), LinkCall::DeenergizeAll]
    );
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_mid_step_deenergizes_immediately() {
    let link = Arc::new(MockLedLink::new());
    let controller = controller(link.clone()).await;
    let t0 = Instant::now();

    controller
        .start_procedure(request(&[(10, 80)], &[1]))
        .unwrap();
    sleep(Duration::from_secs(2)).await;
    assert_eq!(controller.stop_procedure(), StopOutcome::Signaled);
    controller.wait_idle().await;

    let timeline = offsets(&link, t0);
    assert_eq!(link.count(LinkOp::SetIntensity), 1);
    assert_eq!(link.count(LinkOp::DeenergizeAll), 1);
    let (at, last) = timeline.last().unwrap();
    assert_eq!(*last, LinkCall::DeenergizeAll);
    assert_near(*at, 2000);

    assert_eq!(
        controller.status_snapshot().last_outcome,
        Some(RunOutcome::Stopped)
    );
}

#[tokio::test(start_paused = true)]
async fn test_finished_event_reports_stop() {
    let link = Arc::new(MockLedLink::new());
    let controller = controller(link.clone()).await;
    let mut events = controller.subscribe();

    let accepted = controller.start_procedure(request(&[(30, 80)], &[2])).unwrap();
    sleep(Duration::from_secs(3)).await;
    controller.stop_procedure();

    let finished = loop {
        match events.recv().await.unwrap() {
            ExecutorEvent::Finished { run_id, outcome } => break (run_id, outcome),
            _ => continue,
        }
    };
    assert_eq!(finished, (accepted.run_id, RunOutcome::Stopped));
    assert_eq!(link.calls().last(), Some(&LinkCall::DeenergizeAll));
}

#[tokio::test(start_paused = true)]
async fn test_stop_skips_remaining_steps() {
    let link = Arc::new(MockLedLink::new());
    let controller = controller(link.clone()).await;

    controller
        .start_procedure(request(&[(3, 10), (3, 20), (3, 30)], &[1, 2]))
        .unwrap();
    // settle 0.5s + step 1 (3s) + 1s into step 2
    sleep(Duration::from_millis(4500)).await;
    controller.stop_procedure();
    controller.wait_idle().await;

    assert_eq!(
        link.calls(),
        vec![
            LinkCall::EnergizeChannels(vec![1, 2]),
            LinkCall::SetIntensity(10),
            LinkCall::SetIntensity(20),
            LinkCall::DeenergizeAll,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_settle_delay() {
    let link = Arc::new(MockLedLink::new());
    let controller = controller(link.clone()).await;

    controller.start_procedure(request(&[(5, 50)], &[3])).unwrap();
    sleep(Duration::from_millis(100)).await;
    controller.stop_procedure();
    controller.wait_idle().await;

    assert_eq!(link.count(LinkOp::SetIntensity), 0);
    assert_eq!(link.count(LinkOp::DeenergizeAll), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_when_idle_reports_not_running() {
    let link = Arc::new(MockLedLink::new());
    let controller = controller(link.clone()).await;

    assert_eq!(controller.stop_procedure(), StopOutcome::NotRunning);
    assert!(link.calls().is_empty());
}

// =============================================================================
// Single slot and safe mode
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_rejected_until_cleanup_finishes() {
    let link = Arc::new(MockLedLink::new().with_latency(Duration::from_millis(200)));
    let controller = controller(link.clone()).await;

    controller.start_procedure(request(&[(5, 20)], &[1])).unwrap();
    sleep(Duration::from_secs(1)).await;
    controller.stop_procedure();
    assert_eq!(controller.run_status(), RunState::StopRequested);

    assert_eq!(
        controller.start_procedure(request(&[(1, 90)], &[1])),
        Err(RejectionReason::AlreadyRunning)
    );

    controller.wait_idle().await;
    assert!(controller
        .start_procedure(request(&[(1, 90)], &[1]))
        .is_ok());
    controller.wait_idle().await;
    assert_eq!(link.count(LinkOp::DeenergizeAll), 2);
}

#[tokio::test(start_paused = true)]
async fn test_safe_mode_rejects_everything() {
    let link = Arc::new(MockLedLink::disconnected());
    let controller = Controller::connect(link.clone(), ExecutorTiming::default()).await;
    link.clear();

    assert_eq!(controller.connection_status(), ConnectionState::SafeMode);
    assert_eq!(
        controller.start_procedure(request(&[(1, 10)], &[1])),
        Err(RejectionReason::SafeMode)
    );
    assert!(controller.enable_program_control().await.is_err());
    assert_eq!(controller.run_status(), RunState::Idle);
    assert!(link.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hardware_failure_mid_run_recovers_to_idle() {
    let link = Arc::new(MockLedLink::new().failing_on(LinkOp::EnergizeChannels));
    let controller = controller(link.clone()).await;

    controller.start_procedure(request(&[(5, 50)], &[1])).unwrap();
    controller.wait_idle().await;

    assert_eq!(link.count(LinkOp::SetIntensity), 0);
    assert_eq!(link.count(LinkOp::DeenergizeAll), 1);
    assert!(matches!(
        controller.status_snapshot().last_outcome,
        Some(RunOutcome::Failed { .. })
    ));

    link.heal(LinkOp::EnergizeChannels);
    assert!(controller.start_procedure(request(&[(1, 5)], &[1])).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_manual_control_blocked_while_running() {
    let link = Arc::new(MockLedLink::new());
    let controller = controller(link.clone()).await;

    controller.start_procedure(request(&[(5, 50)], &[1])).unwrap();
    assert!(controller.enable_manual_control().await.is_err());

    controller.wait_idle().await;
    controller.enable_manual_control().await.unwrap();
    assert_eq!(link.calls().last(), Some(&LinkCall::ManualControl));
}

#[tokio::test(start_paused = true)]
async fn test_start_rejected_while_control_switch_in_flight() {
    let link = Arc::new(MockLedLink::new().with_latency(Duration::from_millis(200)));
    let controller = Arc::new(controller(link.clone()).await);
    let t0 = Instant::now();

    let switching = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.enable_manual_control().await })
    };
    while link.count(LinkOp::ManualControl) == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        controller.start_procedure(request(&[(1, 50)], &[1])),
        Err(RejectionReason::ControlInProgress)
    );
    assert!(controller.enable_program_control().await.is_err());

    switching.await.unwrap().unwrap();
    controller.start_procedure(request(&[(1, 50)], &[1])).unwrap();
    controller.wait_idle().await;

    let timeline = offsets(&link, t0);
    assert_eq!(timeline[0], (Duration::ZERO, LinkCall::ManualControl));
    assert_eq!(link.count(LinkOp::ProgramControl), 0);
    assert_eq!(timeline[1].1, LinkCall::EnergizeChannels(vec![1]));
    assert!(timeline[1].0 >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_with_connection_skips_handshake() {
    let link = Arc::new(MockLedLink::new());
    let controller = Controller::with_connection(
        link.clone(),
        ConnectionState::Connected,
        ExecutorTiming {
            settle_delay: Duration::ZERO,
            tick: Duration::from_millis(250),
        },
    );
    let t0 = Instant::now();

    controller.start_procedure(request(&[(1, 30)], &[4])).unwrap();
    sleep(Duration::from_millis(600)).await;
    let progress = controller.status_snapshot().progress.unwrap();
    assert_eq!(progress.remaining, Duration::from_millis(500));

    controller.wait_idle().await;
    let timeline = offsets(&link, t0);
    assert_eq!(timeline[0].1, LinkCall::EnergizeChannels(vec![4]));
    assert_near(timeline.last().unwrap().0, 1000);
}

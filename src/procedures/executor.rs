//! Procedure Executor
//!
//! Owns the single procedure slot. `start` validates synchronously and returns
//! as soon as the run is accepted; the steps themselves execute on a background
//! task so HTTP handlers never wait for exposure time to elapse.
//!
//! # Task layout
//!
//! ```text
//! supervisor task
//!   ├── worker task: energize → settle → steps (each wait raced against StopSignal)
//!   └── cleanup:     deenergize_all (own task, so a panic there is contained too)
//! ```
//!
//! The supervisor is the only code that returns the slot to `Idle`, and it does
//! so on every exit path: completion, stop, hardware error, or a panic in the
//! worker. If the supervisor itself is dropped (runtime shutdown), a
//! [`RunGuard`] still frees the slot.
//!
//! Slot state sits behind a `std::sync::Mutex` that is never held across an
//! `.await`. Transitions are published on a `watch` channel for `wait_idle`.
//!
//! Direct control commands (manual/program control) go through
//! [`ProcedureExecutor::with_slot_reserved`], which claims the idle slot for the
//! length of the command. A start arriving meanwhile is rejected.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::step::ProcedureRequest;
use super::stop_signal::StopSignal;
use super::{
    ConnectionState, ExecutorEvent, ExecutorStatus, ProcedureProgress, RunOutcome, RunState,
};
use crate::config::ExecutorSettings;
use crate::error::RejectionReason;
use crate::hardware::HardwareLink;

const EVENT_CAPACITY: usize = 64;

/// Timing knobs for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorTiming {
    /// Wait between energizing channels and the first step
    pub settle_delay: Duration,
    /// Granularity of step waits (progress updates and stop checks)
    pub tick: Duration,
}

impl Default for ExecutorTiming {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            tick: Duration::from_secs(1),
        }
    }
}

impl From<&ExecutorSettings> for ExecutorTiming {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            settle_delay: settings.settle_delay,
            tick: settings.tick,
        }
    }
}

/// Receipt for an accepted start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Accepted {
    /// Correlates log lines and events for this run
    pub run_id: Uuid,
}

#[derive(Default)]
struct Slot {
    state: RunState,
    run_id: Option<Uuid>,
    progress: Option<ProcedureProgress>,
    last_outcome: Option<RunOutcome>,
    supervisor: Option<JoinHandle<()>>,
    /// An idle slot claimed by a direct control command
    reserved: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    state_tx: watch::Sender<RunState>,
    stop: StopSignal,
    events: broadcast::Sender<ExecutorEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Slot updates are single assignments, so a poisoned lock still holds a
        // consistent value.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ExecutorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_progress(&self, progress: ProcedureProgress) {
        self.lock().progress = Some(progress);
    }

    fn set_remaining(&self, remaining: Duration) {
        if let Some(progress) = self.lock().progress.as_mut() {
            progress.remaining = remaining;
        }
    }

    /// Return the slot to `Idle`, recording how the run ended.
    fn finish(&self, run_id: Uuid, outcome: RunOutcome) {
        {
            let mut slot = self.lock();
            if slot.run_id != Some(run_id) {
                return;
            }
            slot.state = RunState::Idle;
            slot.run_id = None;
            slot.progress = None;
            slot.last_outcome = Some(outcome.clone());
            self.stop.reset();
            self.state_tx.send_replace(RunState::Idle);
        }
        info!(%run_id, %outcome, "Procedure finished");
        self.emit(ExecutorEvent::Finished { run_id, outcome });
    }
}

/// Frees the slot if the supervisor is dropped before it finishes.
struct RunGuard {
    shared: Arc<Shared>,
    run_id: Uuid,
    armed: bool,
}

impl RunGuard {
    fn new(shared: Arc<Shared>, run_id: Uuid) -> Self {
        Self {
            shared,
            run_id,
            armed: true,
        }
    }

    fn complete(mut self, outcome: RunOutcome) {
        self.armed = false;
        self.shared.finish(self.run_id, outcome);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(run_id = %self.run_id, "Procedure supervisor dropped before cleanup");
            self.shared
                .finish(self.run_id, RunOutcome::failed("supervisor interrupted"));
        }
    }
}

/// Releases a slot reservation, including when the command future is dropped.
struct Reservation {
    shared: Arc<Shared>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.shared.lock().reserved = false;
    }
}

/// Runs at most one exposure procedure at a time.
pub struct ProcedureExecutor {
    link: Arc<dyn HardwareLink>,
    connection: ConnectionState,
    timing: ExecutorTiming,
    shared: Arc<Shared>,
}

impl ProcedureExecutor {
    /// Create an idle executor driving `link`.
    pub fn new(
        link: Arc<dyn HardwareLink>,
        connection: ConnectionState,
        timing: ExecutorTiming,
    ) -> Self {
        let (state_tx, _) = watch::channel(RunState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            link,
            connection,
            timing,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                state_tx,
                stop: StopSignal::new(),
                events,
            }),
        }
    }

    /// Connection state fixed at construction
    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Accept a procedure and launch it in the background.
    ///
    /// Rejections leave the executor untouched. Must be called from within a
    /// Tokio runtime.
    pub fn start(&self, request: ProcedureRequest) -> Result<Accepted, RejectionReason> {
        if self.connection == ConnectionState::SafeMode {
            warn!("Start rejected: controller is in safe mode");
            return Err(RejectionReason::SafeMode);
        }

        let run_id = Uuid::new_v4();
        let mut slot = self.shared.lock();
        if slot.state != RunState::Idle {
            warn!(state = %slot.state, "Start rejected: a procedure is already running");
            return Err(RejectionReason::AlreadyRunning);
        }
        if slot.reserved {
            warn!("Start rejected: a control command is in progress");
            return Err(RejectionReason::ControlInProgress);
        }

        info!(
            %run_id,
            steps = request.steps().len(),
            channels = %request.channels(),
            total = ?request.total_duration(),
            "Procedure accepted"
        );

        slot.state = RunState::Running;
        slot.run_id = Some(run_id);
        slot.progress = None;
        self.shared.stop.reset();
        self.shared.state_tx.send_replace(RunState::Running);

        let guard = RunGuard::new(self.shared.clone(), run_id);
        let supervisor = supervise(
            guard,
            self.link.clone(),
            self.connection,
            self.timing,
            request,
        )
        .instrument(info_span!("procedure", %run_id));
        slot.supervisor = Some(tokio::spawn(supervisor));

        Ok(Accepted { run_id })
    }

    /// Request a cooperative stop.
    ///
    /// Returns `true` if a procedure was running (including one already asked to
    /// stop), `false` if the executor was idle.
    pub fn stop(&self) -> bool {
        self.request_stop("operator request")
    }

    fn request_stop(&self, reason: &str) -> bool {
        let mut slot = self.shared.lock();
        match slot.state {
            RunState::Running => {
                slot.state = RunState::StopRequested;
                self.shared.stop.trigger(reason);
                self.shared.state_tx.send_replace(RunState::StopRequested);
                info!(run_id = ?slot.run_id, reason, "Stop requested");
                true
            }
            RunState::StopRequested => {
                debug!("Stop already requested");
                true
            }
            RunState::Idle => false,
        }
    }

    /// Current slot state, without blocking on the running task
    pub fn status(&self) -> RunState {
        self.shared.lock().state
    }

    /// Position within the running procedure, if any
    pub fn progress(&self) -> Option<ProcedureProgress> {
        self.shared.lock().progress
    }

    /// How the most recent run ended
    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.shared.lock().last_outcome.clone()
    }

    /// Consistent view of the whole slot
    pub fn snapshot(&self) -> ExecutorStatus {
        let slot = self.shared.lock();
        ExecutorStatus {
            state: slot.state,
            connection: self.connection,
            run_id: slot.run_id,
            progress: slot.progress,
            last_outcome: slot.last_outcome.clone(),
        }
    }

    /// Receive run events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.shared.events.subscribe()
    }

    /// Resolve once the slot is `Idle` (immediately if it already is).
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == RunState::Idle).await;
    }

    /// Run `command` with the idle slot claimed, so no procedure can start until
    /// it finishes.
    ///
    /// Rejected with `SafeMode`, `AlreadyRunning` while a procedure is active, or
    /// `ControlInProgress` while another command holds the slot.
    pub async fn with_slot_reserved<F, T>(&self, command: F) -> Result<T, RejectionReason>
    where
        F: Future<Output = T>,
    {
        if self.connection == ConnectionState::SafeMode {
            return Err(RejectionReason::SafeMode);
        }
        let _reservation = {
            let mut slot = self.shared.lock();
            if slot.state != RunState::Idle {
                return Err(RejectionReason::AlreadyRunning);
            }
            if slot.reserved {
                return Err(RejectionReason::ControlInProgress);
            }
            slot.reserved = true;
            Reservation {
                shared: self.shared.clone(),
            }
        };
        Ok(command.await)
    }

    /// Stop any running procedure and wait for its cleanup to finish.
    pub async fn shutdown(&self) {
        if self.request_stop("process shutdown") {
            info!("Waiting for running procedure to de-energize");
        }
        let supervisor = self.shared.lock().supervisor.take();
        if let Some(handle) = supervisor {
            if let Err(error) = handle.await {
                error!(%error, "Procedure supervisor did not exit cleanly");
            }
        }
        self.wait_idle().await;
    }
}

async fn supervise(
    guard: RunGuard,
    link: Arc<dyn HardwareLink>,
    connection: ConnectionState,
    timing: ExecutorTiming,
    request: ProcedureRequest,
) {
    let shared = guard.shared.clone();
    let run_id = guard.run_id;

    if connection == ConnectionState::SafeMode {
        warn!("Safe mode detected inside procedure task, not touching hardware");
        guard.complete(RunOutcome::failed("safe mode"));
        return;
    }

    shared.emit(ExecutorEvent::Started {
        run_id,
        total_steps: request.steps().len(),
    });

    let worker = tokio::spawn(
        run_steps(shared.clone(), link.clone(), timing, request, run_id).in_current_span(),
    );
    let outcome = match worker.await {
        Ok(outcome) => outcome,
        Err(join) if join.is_panic() => {
            error!("Procedure task panicked, forcing cleanup");
            RunOutcome::failed("procedure task panicked")
        }
        Err(join) => {
            error!(error = %join, "Procedure task cancelled");
            RunOutcome::failed(join.to_string())
        }
    };

    info!("De-energizing all channels");
    let cleanup = tokio::spawn(async move { link.deenergize_all().await }.in_current_span());
    match cleanup.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => error!(%error, "Cleanup failed to de-energize channels"),
        Err(join) => error!(error = %join, "Cleanup task failed"),
    }

    guard.complete(outcome);
}

async fn run_steps(
    shared: Arc<Shared>,
    link: Arc<dyn HardwareLink>,
    timing: ExecutorTiming,
    request: ProcedureRequest,
    run_id: Uuid,
) -> RunOutcome {
    let stop = &shared.stop;

    if let Err(error) = link.energize_channels(request.channels()).await {
        error!(%error, channels = %request.channels(), "Failed to energize channels");
        return RunOutcome::failed(error.to_string());
    }
    if stop.sleep(timing.settle_delay).await.is_stopped() {
        info!(reason = ?stop.reason(), "Stopped during settle delay");
        return RunOutcome::Stopped;
    }

    let total_steps = request.steps().len();
    for (index, step) in request.steps().iter().enumerate() {
        let number = index + 1;
        if stop.is_triggered() {
            info!(step = number, reason = ?stop.reason(), "Stopped before step");
            return RunOutcome::Stopped;
        }
        if step.is_noop() {
            debug!(step = number, "Skipping empty step");
            continue;
        }

        info!(
            step = number,
            total_steps,
            intensity = %step.intensity(),
            duration = ?step.duration(),
            "Step started"
        );
        shared.set_progress(ProcedureProgress {
            current_step: number,
            total_steps,
            intensity: step.intensity(),
            remaining: step.duration(),
        });
        shared.emit(ExecutorEvent::StepStarted {
            run_id,
            step: number,
            intensity: step.intensity(),
            duration: step.duration(),
        });

        if let Err(error) = link.set_intensity(step.intensity()).await {
            error!(%error, step = number, "Failed to set intensity");
            return RunOutcome::failed(error.to_string());
        }

        let mut remaining = step.duration();
        while !remaining.is_zero() {
            let tick = remaining.min(timing.tick);
            if stop.sleep(tick).await.is_stopped() {
                info!(
                    step = number,
                    remaining = ?remaining,
                    reason = ?stop.reason(),
                    "Stopped during step"
                );
                return RunOutcome::Stopped;
            }
            remaining -= tick;
            shared.set_remaining(remaining);
        }
    }

    RunOutcome::Completed
}

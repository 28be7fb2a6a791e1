//! Workflow transmission.
//!
//! A workflow is a text script the instrument executes on its own. Starting
//! one sends the text as trailing payload on [`WORKFLOW_START`]; the firmware
//! acknowledges the start, and later signals completion with an unsolicited
//! frame (by default [`SYSTEM_STATE_IDLE`]).
//!
//! State machine:
//!
//! ```text
//! Idle ──execute──▶ Running ──completion──────▶ Completed
//!                     ├──stop─────────────────▶ Stopped
//!                     └──error / conn. lost───▶ Failed
//! Completed | Stopped | Failed ──execute──▶ Running
//! Completed | Stopped | Failed ──reset────▶ Idle
//! ```
//!
//! At most one workflow runs at a time. A second `execute` while one is
//! running fails with [`Error::WorkflowBusy`] and is not queued. Losing the
//! connection while a workflow runs moves it to `Failed`.
//!
//! [`SYSTEM_STATE_IDLE`]: lsctl_protocol::codes::SYSTEM_STATE_IDLE

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lsctl_core::error::{Error, Result};
use lsctl_core::events::InstrumentEvent;
use lsctl_core::types::WorkflowState;
use lsctl_protocol::codes::{WORKFLOW_START, WORKFLOW_STOP};

use crate::dispatcher::CommandDispatcher;

/// Largest workflow script accepted.
pub const MAX_WORKFLOW_LEN: usize = 1024 * 1024;

/// Starts, stops and tracks the instrument's workflow.
pub struct WorkflowTransmissionService {
    dispatcher: Arc<CommandDispatcher>,
    state: Arc<watch::Sender<WorkflowState>>,
    event_tx: broadcast::Sender<InstrumentEvent>,
    watcher: JoinHandle<()>,
}

impl WorkflowTransmissionService {
    /// Create the service and start watching for completion frames.
    ///
    /// `completion_codes` are the notification codes that end a running
    /// workflow. When `cancel` fires, a running workflow fails and the
    /// watcher exits.
    pub(crate) fn new(
        dispatcher: Arc<CommandDispatcher>,
        event_tx: broadcast::Sender<InstrumentEvent>,
        completion_codes: Vec<u32>,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(watch::channel(WorkflowState::Idle).0);
        let watcher = tokio::spawn(watch_completion(
            event_tx.subscribe(),
            Arc::clone(&state),
            event_tx.clone(),
            completion_codes,
            cancel,
        ));
        WorkflowTransmissionService {
            dispatcher,
            state,
            event_tx,
            watcher,
        }
    }

    /// Send `payload` to the instrument and start executing it.
    ///
    /// Returns once the instrument acknowledges the start; completion is
    /// reported later through [`InstrumentEvent::WorkflowCompleted`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] for an empty or oversized payload, with
    ///   no state change
    /// - [`Error::WorkflowBusy`] if a workflow is already running
    /// - any dispatcher error from the start command, returned unchanged
    ///   after the state moves to `Failed` and
    ///   [`InstrumentEvent::WorkflowFailed`] is emitted
    pub async fn execute(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(Error::InvalidParameter("workflow payload is empty".into()));
        }
        if payload.len() > MAX_WORKFLOW_LEN {
            return Err(Error::InvalidParameter(format!(
                "workflow payload of {} bytes exceeds {MAX_WORKFLOW_LEN}",
                payload.len()
            )));
        }

        let mut previous = WorkflowState::Idle;
        let started = self.state.send_if_modified(|s| {
            if *s == WorkflowState::Running {
                return false;
            }
            previous = *s;
            *s = WorkflowState::Running;
            true
        });
        if !started {
            tracing::warn!("workflow start rejected: one is already executing");
            return Err(Error::WorkflowBusy);
        }
        if previous.is_terminal() {
            tracing::debug!(previous = %previous, "restarting after finished workflow");
        }

        tracing::info!(bytes = payload.len(), "starting workflow");
        let request = self
            .dispatcher
            .request(WORKFLOW_START)
            .expects_response(true)
            .payload(payload);

        match self.dispatcher.send(request).await {
            Ok(_) => {
                tracing::debug!("workflow start acknowledged");
                Ok(())
            }
            Err(e) => {
                self.fail(format!("workflow execution failed: {e}"));
                Err(e)
            }
        }
    }

    /// Stop the running workflow.
    ///
    /// The stop command is sent without waiting; the firmware does not
    /// reliably acknowledge it.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if no workflow is running
    /// - [`Error::Workflow`] wrapping the dispatcher error if the stop
    ///   command could not be sent; the workflow moves to `Failed`
    pub async fn stop(&self) -> Result<()> {
        if !self.is_executing() {
            return Err(Error::InvalidState(format!(
                "cannot stop workflow in state {}",
                self.state()
            )));
        }
        self.send_stop().await
    }

    /// Stop whatever workflow the instrument is executing, including one
    /// started by another client or an earlier session.
    ///
    /// If this session's workflow is running it moves to `Stopped`;
    /// otherwise the local state is left alone.
    ///
    /// # Errors
    ///
    /// [`Error::Workflow`] wrapping the dispatcher error if the stop command
    /// could not be sent.
    pub async fn stop_remote(&self) -> Result<()> {
        self.send_stop().await
    }

    async fn send_stop(&self) -> Result<()> {
        let request = self.dispatcher.request(WORKFLOW_STOP).expects_response(false);
        if let Err(e) = self.dispatcher.send(request).await {
            let err = Error::Workflow(Box::new(e));
            self.fail(err.to_string());
            return Err(err);
        }

        let stopped = self.state.send_if_modified(|s| {
            if *s == WorkflowState::Running {
                *s = WorkflowState::Stopped;
                true
            } else {
                false
            }
        });
        if stopped {
            tracing::info!("workflow stopped");
        } else {
            tracing::info!("stop sent with no local workflow running");
        }
        Ok(())
    }

    /// Return a finished workflow to `Idle`.
    pub fn reset(&self) -> Result<()> {
        let current = self.state();
        if current == WorkflowState::Running {
            return Err(Error::InvalidState("workflow is executing".into()));
        }
        self.state.send_replace(WorkflowState::Idle);
        Ok(())
    }

    pub fn is_executing(&self) -> bool {
        *self.state.borrow() == WorkflowState::Running
    }

    pub fn state(&self) -> WorkflowState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch(&self) -> watch::Receiver<WorkflowState> {
        self.state.subscribe()
    }

    fn fail(&self, reason: String) {
        fail_running(&self.state, &self.event_tx, reason);
    }
}

/// Move a running workflow to `Failed` and report it. Does nothing in any
/// other state, so each run fails at most once.
fn fail_running(
    state: &watch::Sender<WorkflowState>,
    event_tx: &broadcast::Sender<InstrumentEvent>,
    reason: String,
) {
    let changed = state.send_if_modified(|s| {
        if *s == WorkflowState::Running {
            *s = WorkflowState::Failed;
            true
        } else {
            false
        }
    });
    if changed {
        tracing::warn!(reason = %reason, "workflow failed");
        let _ = event_tx.send(InstrumentEvent::WorkflowFailed { reason });
    }
}

impl Drop for WorkflowTransmissionService {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch_completion(
    mut events: broadcast::Receiver<InstrumentEvent>,
    state: Arc<watch::Sender<WorkflowState>>,
    event_tx: broadcast::Sender<InstrumentEvent>,
    completion_codes: Vec<u32>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                fail_running(
                    &state,
                    &event_tx,
                    "workflow execution failed: connection closed".to_string(),
                );
                break;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(InstrumentEvent::Notification(message))
                if completion_codes.contains(&message.code()) =>
            {
                let completed = state.send_if_modified(|s| {
                    if *s == WorkflowState::Running {
                        *s = WorkflowState::Completed;
                        true
                    } else {
                        false
                    }
                });
                if completed {
                    tracing::info!(code = format!("0x{:04X}", message.code()), "workflow completed");
                    let _ = event_tx.send(InstrumentEvent::WorkflowCompleted);
                } else {
                    tracing::debug!(
                        code = format!("0x{:04X}", message.code()),
                        "completion frame with no workflow running"
                    );
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "workflow watcher lagged behind events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::trace!("workflow watcher stopped");
}

// Worker unit
//
// One isolated execution context running the user handler on a single
// message at a time. Isolation is a spawned tokio task with no shared
// state: the master talks to it only over a private command channel and
// hears back only over a private report channel. A panicking handler
// kills the task without touching dispatcher state; the master observes
// the dead task handle and requeues the in-flight message.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, WarrenError};
use crate::handler::{Handler, HandlerOutcome};
use crate::message::Envelope;

/// Unique worker identity, time-ordered by spawn.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    fn generate() -> Self {
        Self(format!("worker-{}", Uuid::now_v7()))
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a worker unit, as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Ready for an assignment.
    Idle,
    /// Executing the handler on exactly one message.
    Busy,
    /// Asked to exit; finishing up.
    Terminating,
    /// Task exited; awaiting reclamation.
    Dead,
}

/// Command sent from the master over the unit's private channel.
#[derive(Debug)]
enum WorkerCommand {
    Assign(Envelope),
    Shutdown,
}

/// Outcome reported back by the worker for one assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReport {
    /// Handler completed; the message can be acknowledged.
    Done,
    /// Handler rejected the message with a reason.
    Failed(String),
}

/// Master-side handle to one spawned worker task.
///
/// Owned exclusively by the worker pool; all mutation happens on the
/// dispatcher's control task.
pub struct WorkerUnit {
    id: WorkerId,
    state: WorkerState,
    command_tx: mpsc::Sender<WorkerCommand>,
    report_rx: mpsc::UnboundedReceiver<WorkerReport>,
    handle: JoinHandle<()>,
    current: Option<Envelope>,
    last_activity: DateTime<Utc>,
    shutdown_requested: bool,
}

impl WorkerUnit {
    /// Spawn a fresh worker task bound to private channels.
    pub fn spawn(handler: Arc<dyn Handler>) -> Self {
        let id = WorkerId::generate();
        // Capacity 2 so a shutdown command can queue behind an assignment.
        let (command_tx, command_rx) = mpsc::channel(2);
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let task_id = id.clone();
        let handle = tokio::spawn(run_worker(task_id, command_rx, report_tx, handler));

        Self {
            id,
            state: WorkerState::Idle,
            command_tx,
            report_rx,
            handle,
            current: None,
            last_activity: Utc::now(),
            shutdown_requested: false,
        }
    }

    /// Worker identity.
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// The envelope currently being processed, if any.
    pub fn current(&self) -> Option<&Envelope> {
        self.current.as_ref()
    }

    /// Whether the unit can take an assignment.
    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    /// Whether the underlying task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Whether the unit was asked to exit at some point.
    pub fn exit_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Whether an outcome report is waiting to be collected.
    pub fn has_pending_report(&self) -> bool {
        !self.report_rx.is_empty()
    }

    /// Hand one envelope to the worker.
    ///
    /// Assigning while not idle is a contract breach between master and
    /// unit and returns `ProtocolViolation` without sending anything. A
    /// unit whose task already exited is marked dead with the envelope
    /// retained as unfinished, so the normal reap path requeues it.
    pub fn assign(&mut self, envelope: Envelope) -> Result<()> {
        if self.state != WorkerState::Idle {
            return Err(WarrenError::protocol(format!(
                "assign to worker {} in state {:?}",
                self.id, self.state
            )));
        }

        self.current = Some(envelope.clone());
        if self.command_tx.try_send(WorkerCommand::Assign(envelope)).is_err() {
            self.state = WorkerState::Dead;
            return Err(WarrenError::protocol(format!(
                "assign to exited worker {}",
                self.id
            )));
        }

        self.state = WorkerState::Busy;
        self.last_activity = Utc::now();
        Ok(())
    }

    /// Non-blocking poll of the report channel.
    pub fn try_report(&mut self) -> Option<WorkerReport> {
        self.report_rx.try_recv().ok()
    }

    /// Mark the current assignment finished, returning its envelope.
    pub fn finish(&mut self) -> Option<Envelope> {
        self.state = WorkerState::Idle;
        self.last_activity = Utc::now();
        self.current.take()
    }

    /// Whether a busy worker has been unresponsive beyond `timeout`.
    pub fn unresponsive(&self, timeout: Duration) -> bool {
        if self.state != WorkerState::Busy {
            return false;
        }
        Utc::now()
            .signed_duration_since(self.last_activity)
            .to_std()
            .map(|elapsed| elapsed > timeout)
            .unwrap_or(false)
    }

    /// Ask the worker to finish any in-flight message and exit.
    pub fn request_shutdown(&mut self) {
        // Channel closed means the task already exited; reap handles it.
        let _ = self.command_tx.try_send(WorkerCommand::Shutdown);
        self.shutdown_requested = true;
        if self.state == WorkerState::Idle {
            self.state = WorkerState::Terminating;
        }
    }

    /// Force-kill the task and reclaim the in-flight envelope.
    pub fn kill(&mut self) -> Option<Envelope> {
        self.handle.abort();
        self.state = WorkerState::Dead;
        self.current.take()
    }

    /// Mark the unit dead after its task exited on its own.
    pub fn mark_dead(&mut self) -> Option<Envelope> {
        self.state = WorkerState::Dead;
        self.current.take()
    }
}

/// Body of the spawned worker task.
///
/// Receives assignments one at a time and reports exactly one outcome
/// per assignment before accepting the next. Exits on shutdown command,
/// on a closed channel, or by panic inside the handler.
async fn run_worker(
    id: WorkerId,
    mut command_rx: mpsc::Receiver<WorkerCommand>,
    report_tx: mpsc::UnboundedSender<WorkerReport>,
    handler: Arc<dyn Handler>,
) {
    debug!(worker_id = %id, "Worker started");

    while let Some(command) = command_rx.recv().await {
        match command {
            WorkerCommand::Assign(envelope) => {
                let report = match handler.handle(envelope).await {
                    HandlerOutcome::Done => WorkerReport::Done,
                    HandlerOutcome::Failed(reason) => WorkerReport::Failed(reason),
                };
                if report_tx.send(report).is_err() {
                    // Master is gone; nothing left to report to.
                    break;
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }

    debug!(worker_id = %id, "Worker exited");
}

//! Backend workers: long-lived DEALER peers consuming load-balanced work.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Commands routed to a worker's connection task.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Forward this payload to the worker process.
    Deliver(Value),
    /// Liveness lapsed or the lobby is shutting down; say `QT` and hang up.
    Quit,
}

/// Liveness state of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Eligible for dispatch.
    Ready,
    /// Holding a payload, waiting for the worker to re-arm with `RD`.
    Busy,
    /// Missed its liveness window; being removed.
    Expired,
}

/// Broker-side record of a single DEALER peer. Owned and mutated by the
/// lobby under its lock.
#[derive(Debug)]
pub struct BackendWorker {
    id: String,
    sender: mpsc::UnboundedSender<WorkerCommand>,
    state: WorkerState,
    deadline: Instant,
    in_flight: Option<Value>,
}

impl BackendWorker {
    pub fn new(
        id: impl Into<String>,
        sender: mpsc::UnboundedSender<WorkerCommand>,
        liveness: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            sender,
            state: WorkerState::Ready,
            deadline: Instant::now() + liveness,
            in_flight: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn touch(&mut self, liveness: Duration) {
        self.deadline = Instant::now() + liveness;
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Hands the payload to the connection task and marks the worker busy
    /// until it re-arms. Returns false when the connection is gone.
    pub(crate) fn assign(&mut self, payload: Value) -> bool {
        self.state = WorkerState::Busy;
        self.in_flight = Some(payload.clone());
        self.sender.send(WorkerCommand::Deliver(payload)).is_ok()
    }

    /// The worker finished its payload and is eligible again.
    pub(crate) fn complete(&mut self) {
        self.state = WorkerState::Ready;
        self.in_flight = None;
    }

    /// Marks the worker expired and tells its connection to quit. Returns
    /// the payload it was holding, if any, for re-enqueueing.
    pub(crate) fn expire(&mut self) -> Option<Value> {
        self.state = WorkerState::Expired;
        let _ = self.sender.send(WorkerCommand::Quit);
        self.in_flight.take()
    }

    pub(crate) fn quit(&self) {
        let _ = self.sender.send(WorkerCommand::Quit);
    }

    pub(crate) fn take_in_flight(&mut self) -> Option<Value> {
        self.in_flight.take()
    }
}

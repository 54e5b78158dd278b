//! Per-vhost work lobby: a payload queue plus a worker pool.
//!
//! Each payload handed to `enqueue` is delivered to exactly one ready
//! worker, round-robin over the pool. Payloads arriving while no worker is
//! ready are buffered; a worker dying with a payload in flight has it
//! re-enqueued at the head of the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::{interval, Instant};
use tracing::{debug, warn};

use crate::worker::{BackendWorker, WorkerState};

/// Default worker liveness window; a worker silent for this long is sent
/// `QT` and dropped from the pool.
pub const DEFAULT_LIVENESS: Duration = Duration::from_secs(10);

const REAPER_TICK: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct LobbyInner {
    workers: HashMap<String, BackendWorker>,
    /// Dispatch order over ready workers.
    rotation: VecDeque<String>,
    backlog: VecDeque<Value>,
    liveness: Duration,
    alive: bool,
}

#[derive(Debug)]
pub struct Lobby {
    inner: Mutex<LobbyInner>,
    reaper_running: AtomicBool,
}

impl Lobby {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LobbyInner {
                workers: HashMap::new(),
                rotation: VecDeque::new(),
                backlog: VecDeque::new(),
                liveness: DEFAULT_LIVENESS,
                alive: true,
            }),
            reaper_running: AtomicBool::new(false),
        })
    }

    pub fn liveness(&self) -> Duration {
        self.inner.lock().liveness
    }

    pub fn set_liveness(&self, liveness: Duration) {
        self.inner.lock().liveness = liveness;
    }

    pub fn is_alive(&self) -> bool {
        self.inner.lock().alive
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers.len()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    /// Buffers the payload and hands it to the next ready worker, if any.
    /// Non-blocking; returns false once the lobby has been killed. A true
    /// return is a hint, not a delivery guarantee.
    pub fn enqueue(&self, payload: Value) -> bool {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return false;
        }
        inner.backlog.push_back(payload);
        Self::drain(&mut inner);
        true
    }

    /// Makes the worker eligible for dispatch and starts the liveness
    /// reaper on first use.
    pub fn add_worker(self: &Arc<Self>, worker: BackendWorker) {
        let mut inner = self.inner.lock();
        if !inner.alive {
            worker.quit();
            return;
        }
        let id = worker.id().to_string();
        debug!(worker = %id, "worker joined lobby");
        // A re-registration under the same identity replaces the old peer.
        if let Some(mut stale) = inner.workers.insert(id.clone(), worker) {
            stale.quit();
            if let Some(payload) = stale.take_in_flight() {
                inner.backlog.push_front(payload);
            }
            inner.rotation.retain(|r| r != &id);
        }
        inner.rotation.push_back(id);
        Self::drain(&mut inner);
        drop(inner);
        self.ensure_reaper();
    }

    /// Drops the worker; any payload it was holding goes back to the head
    /// of the queue.
    pub fn delete_worker(&self, id: &str) {
        let mut inner = self.inner.lock();
        if let Some(mut worker) = inner.workers.remove(id) {
            debug!(worker = %id, "worker left lobby");
            if let Some(payload) = worker.take_in_flight() {
                inner.backlog.push_front(payload);
            }
        }
        inner.rotation.retain(|r| r != id);
        Self::drain(&mut inner);
    }

    /// Refreshes the worker's liveness deadline. Returns false for unknown
    /// (already expired) workers.
    pub fn heartbeat(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        let liveness = inner.liveness;
        match inner.workers.get_mut(id) {
            Some(worker) => {
                worker.touch(liveness);
                true
            }
            None => false,
        }
    }

    /// Re-arms a worker after it finished a payload and resumes dispatch.
    pub fn worker_ready(&self, id: &str) {
        let mut inner = self.inner.lock();
        let liveness = inner.liveness;
        {
            let LobbyInner {
                workers, rotation, ..
            } = &mut *inner;
            let Some(worker) = workers.get_mut(id) else {
                return;
            };
            worker.complete();
            worker.touch(liveness);
            if rotation.iter().all(|r| r != id) {
                rotation.push_back(id.to_string());
            }
        }
        Self::drain(&mut inner);
    }

    /// Tells every worker to quit and drops pending payloads.
    pub fn kill(&self) {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return;
        }
        inner.alive = false;
        for (_, worker) in inner.workers.drain() {
            worker.quit();
        }
        inner.rotation.clear();
        let dropped = inner.backlog.len();
        inner.backlog.clear();
        if dropped > 0 {
            debug!(dropped, "lobby killed with pending payloads");
        }
    }

    fn drain(inner: &mut LobbyInner) {
        let LobbyInner {
            workers,
            rotation,
            backlog,
            ..
        } = inner;
        loop {
            if backlog.is_empty() {
                return;
            }
            let Some(id) = rotation.pop_front() else {
                return;
            };
            let Some(worker) = workers.get_mut(&id) else {
                continue;
            };
            if worker.state() != WorkerState::Ready {
                continue;
            }
            let Some(payload) = backlog.pop_front() else {
                return;
            };
            if !worker.assign(payload) {
                // Connection gone before dispatch; reclaim and move on.
                if let Some(reclaimed) = worker.take_in_flight() {
                    backlog.push_front(reclaimed);
                }
                workers.remove(&id);
            }
        }
    }

    fn ensure_reaper(self: &Arc<Self>) {
        if self.reaper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let lobby = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(REAPER_TICK);
            loop {
                tick.tick().await;
                if !lobby.reap() {
                    break;
                }
            }
        });
    }

    /// Sweeps expired workers. Returns false once the lobby is dead so the
    /// reaper can exit.
    fn reap(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return false;
        }
        let now = Instant::now();
        let expired: Vec<String> = inner
            .workers
            .iter()
            .filter(|(_, worker)| worker.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            warn!(worker = %id, "worker liveness expired, sending QT");
            let LobbyInner {
                workers,
                rotation,
                backlog,
                ..
            } = &mut *inner;
            if let Some(mut worker) = workers.remove(&id) {
                if let Some(payload) = worker.expire() {
                    backlog.push_front(payload);
                }
            }
            rotation.retain(|r| r != &id);
        }
        Self::drain(&mut inner);
        true
    }
}

// Worker pool
//
// Keeps the configured number of worker units alive, replaces crashed
// ones, and gives the dispatcher an enumeration of idle workers each
// cycle. The pool owns every unit exclusively; only the dispatcher's
// control task mutates it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::handler::Handler;
use crate::message::Envelope;

use super::unit::{WorkerId, WorkerState, WorkerUnit};

/// A worker removed from the pool during reaping.
#[derive(Debug)]
pub struct ReapedWorker {
    /// Identity of the removed worker.
    pub id: WorkerId,
    /// In-flight envelope reclaimed from the worker, if it was busy.
    pub unfinished: Option<Envelope>,
    /// True for a crash or liveness timeout, false for a requested exit.
    pub crashed: bool,
}

/// The set of live worker units, indexed by identity.
pub struct WorkerPool {
    handler: Arc<dyn Handler>,
    units: HashMap<WorkerId, WorkerUnit>,
    target_size: usize,
}

impl WorkerPool {
    /// Create an empty pool that will maintain `target_size` workers.
    pub fn new(handler: Arc<dyn Handler>, target_size: usize) -> Self {
        Self {
            handler,
            units: HashMap::new(),
            target_size,
        }
    }

    /// Spawn one worker unit bound to a fresh private channel.
    ///
    /// Spawning a tokio task cannot fail, so this currently always
    /// returns `Ok`; the `Result` is the seam for worker construction
    /// that can (handler setup, per-worker resources).
    pub fn spawn(&mut self) -> Result<WorkerId> {
        let unit = WorkerUnit::spawn(Arc::clone(&self.handler));
        let id = unit.id().clone();
        debug!(worker_id = %id, "Spawned worker");
        self.units.insert(id.clone(), unit);
        Ok(id)
    }

    /// Spawn workers until the pool reaches its target size.
    ///
    /// Returns the ids spawned. Should [`spawn`](Self::spawn) ever grow
    /// a failure mode, an error here leaves the pool under-capacity;
    /// the caller surfaces it and this is retried on the next reap
    /// cycle.
    pub fn spawn_to_target(&mut self) -> Result<Vec<WorkerId>> {
        let mut spawned = Vec::new();
        while self.count_live() < self.target_size {
            spawned.push(self.spawn()?);
        }
        Ok(spawned)
    }

    /// Configured pool size.
    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Number of live (non-dead) workers.
    pub fn count_live(&self) -> usize {
        self.units
            .values()
            .filter(|unit| unit.state() != WorkerState::Dead)
            .count()
    }

    /// Whether any worker is currently processing a message.
    pub fn any_busy(&self) -> bool {
        self.units
            .values()
            .any(|unit| unit.state() == WorkerState::Busy)
    }

    /// Ids of workers ready for an assignment.
    pub fn idle_ids(&self) -> Vec<WorkerId> {
        self.units
            .values()
            .filter(|unit| unit.is_idle())
            .map(|unit| unit.id().clone())
            .collect()
    }

    /// Mutable access to one unit.
    pub fn get_mut(&mut self, id: &WorkerId) -> Option<&mut WorkerUnit> {
        self.units.get_mut(id)
    }

    /// Mutable iteration over every unit.
    pub fn units_mut(&mut self) -> impl Iterator<Item = &mut WorkerUnit> {
        self.units.values_mut()
    }

    /// Request graceful exit of a specific worker.
    pub fn terminate(&mut self, id: &WorkerId) {
        if let Some(unit) = self.units.get_mut(id) {
            unit.request_shutdown();
        }
    }

    /// Request graceful exit of every worker.
    pub fn terminate_all(&mut self) {
        for unit in self.units.values_mut() {
            unit.request_shutdown();
        }
    }

    /// Remove workers whose task exited or stopped responding.
    ///
    /// Exited tasks are reclaimed as crashes unless their exit was
    /// requested; busy workers unresponsive beyond `response_timeout`
    /// are force-killed. Unfinished envelopes come back with each entry
    /// so the dispatcher can requeue them.
    ///
    /// A finished task with an uncollected report is skipped: its last
    /// outcome must be processed before the unit is reclaimed, or the
    /// completion would be mistaken for a crash.
    pub fn reap(&mut self, response_timeout: Duration) -> Vec<ReapedWorker> {
        let mut reaped = Vec::new();

        let dead_ids: Vec<WorkerId> = self
            .units
            .values()
            .filter(|unit| {
                (unit.is_finished() && !unit.has_pending_report())
                    || unit.unresponsive(response_timeout)
            })
            .map(|unit| unit.id().clone())
            .collect();

        for id in dead_ids {
            let Some(mut unit) = self.units.remove(&id) else {
                continue;
            };

            let requested = unit.exit_requested();
            let timed_out = !unit.is_finished();
            let unfinished = if timed_out {
                warn!(worker_id = %id, "Worker unresponsive, killing");
                unit.kill()
            } else {
                unit.mark_dead()
            };

            let crashed = !requested;
            if crashed {
                warn!(worker_id = %id, timed_out, "Reaped dead worker");
            } else {
                debug!(worker_id = %id, "Reaped terminated worker");
            }

            reaped.push(ReapedWorker {
                id,
                unfinished,
                crashed,
            });
        }

        reaped
    }

    /// Whether every remaining worker has exited.
    pub fn all_exited(&self) -> bool {
        self.units.values().all(|unit| unit.is_finished())
    }

    /// Whether every worker has been reclaimed.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Force-kill every remaining worker, reclaiming in-flight envelopes.
    pub fn kill_all(&mut self) -> Vec<ReapedWorker> {
        let ids: Vec<WorkerId> = self.units.keys().cloned().collect();
        ids.into_iter()
            .filter_map(|id| {
                let mut unit = self.units.remove(&id)?;
                let requested = unit.exit_requested();
                let unfinished = unit.kill();
                Some(ReapedWorker {
                    id,
                    unfinished,
                    crashed: !requested,
                })
            })
            .collect()
    }
}

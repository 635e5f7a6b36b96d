// Dispatcher
//
// The master control loop. One task owns the connection, the inbound
// cache, the worker pool, and the counters; every cycle it consumes
// from the broker, settles worker outcomes against the broker (ack on
// done, nack on failure or crash), reclaims dead workers, and assigns
// cached messages FIFO to idle workers. Nothing here blocks on a
// handler: slow or stuck handlers only ever cost their own worker.
//
// Phases: Init -> Running -> Draining -> Stopped. Draining stops
// consumption and assignment, lets busy workers finish (bounded by the
// drain deadline), requeues everything unassigned, and closes the
// broker session.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::InboundCache;
use crate::config::DispatcherConfig;
use crate::connection::Connection;
use crate::error::{Result, WarrenError};
use crate::events::{DispatcherEvent, EventContext, EventKind, EventRegistry};
use crate::handler::Handler;
use crate::message::Envelope;
use crate::signal::{Signal, SignalTable};
use crate::stats::{StatCounters, StatsSnapshot};
use crate::worker::{ReapedWorker, WorkerId, WorkerPool, WorkerReport};

/// Lifecycle phase of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherPhase {
    /// Constructed, not yet started.
    Init,
    /// Consuming, assigning, settling.
    Running,
    /// Shutting down; busy workers finishing, no new work.
    Draining,
    /// Run complete; final stats published.
    Stopped,
}

/// Request posted to the control loop from another task.
#[derive(Debug)]
pub(crate) enum ControlRequest {
    /// Begin a graceful drain.
    Shutdown,
    /// A registered signal fired; invoke the callback at this index.
    Signal(usize),
}

/// Cheap cloneable handle for steering a running dispatcher.
///
/// Obtained from [`Dispatcher::control_handle`] before the run starts,
/// or inside event callbacks via [`EventContext::shutdown`]. Requests
/// posted after the run ends are silently dropped.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlRequest>,
}

impl ControlHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ControlRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<ControlRequest> {
        self.tx.clone()
    }

    /// Request a graceful shutdown. Idempotent, safe from any task.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlRequest::Shutdown);
    }
}

/// Message dispatcher bridging a broker connection to a worker pool.
///
/// Create one with a [`Connection`], a [`Handler`], and a
/// [`DispatcherConfig`], register event and signal callbacks, then call
/// [`run`](Dispatcher::run). The run blocks the calling task until a
/// shutdown is requested or a fatal broker error forces a drain, and
/// returns the final stats snapshot.
pub struct Dispatcher {
    config: DispatcherConfig,
    conn: Arc<dyn Connection>,
    pool: WorkerPool,
    cache: InboundCache,
    stats: StatCounters,
    events: EventRegistry,
    signals: SignalTable,
    phase: DispatcherPhase,
    control: ControlHandle,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    drain_started: Option<Instant>,
    fatal: Option<WarrenError>,
}

impl Dispatcher {
    /// Create a dispatcher in the `Init` phase.
    pub fn new(
        conn: Arc<dyn Connection>,
        handler: Arc<dyn Handler>,
        config: DispatcherConfig,
    ) -> Self {
        let (control, control_rx) = ControlHandle::channel();
        let pool = WorkerPool::new(handler, config.num_workers);
        let cache = InboundCache::with_soft_limit(config.cache_soft_limit);

        Self {
            conn,
            pool,
            cache,
            stats: StatCounters::new(),
            events: EventRegistry::new(),
            signals: SignalTable::new(),
            phase: DispatcherPhase::Init,
            control,
            control_rx,
            drain_started: None,
            fatal: None,
            config,
        }
    }

    /// Register a callback for a lifecycle event kind.
    ///
    /// Callbacks run synchronously on the control task, in registration
    /// order, and must not block for long.
    pub fn on<F>(&mut self, kind: EventKind, callback: F)
    where
        F: FnMut(&DispatcherEvent, &EventContext<'_>) + Send + 'static,
    {
        self.events.on(kind, Box::new(callback));
    }

    /// Register a callback for an OS signal.
    ///
    /// The callback runs on the control task with a [`ControlHandle`],
    /// so reacting with a graceful shutdown is one call.
    pub fn add_signal_handler<F>(&mut self, signal: Signal, callback: F)
    where
        F: FnMut(Signal, &ControlHandle) + Send + 'static,
    {
        self.signals.register(signal, Box::new(callback));
    }

    /// Handle for steering the dispatcher from another task.
    pub fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> DispatcherPhase {
        self.phase
    }

    /// Snapshot of the dispatch counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of live workers.
    pub fn count_workers(&self) -> usize {
        self.pool.count_live()
    }

    /// Run the dispatch loop until stopped.
    ///
    /// Blocks the calling task through startup, running, and draining.
    /// Returns the final stats snapshot, or the fatal error that forced
    /// the drain; the `shutdown` event fires with the same snapshot in
    /// either case.
    pub async fn run(mut self) -> Result<StatsSnapshot> {
        if self.phase != DispatcherPhase::Init {
            return Err(WarrenError::AlreadyRunning);
        }

        info!(
            queues = ?self.config.queues,
            num_workers = self.config.num_workers,
            prefetch = self.config.prefetch,
            "Dispatcher starting"
        );

        let startup = match self.connect_broker().await {
            Ok(()) => self.pool.spawn_to_target().map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = startup {
            // Even an aborted start closes the broker session and ends
            // with a shutdown event carrying a consistent snapshot.
            self.emit(DispatcherEvent::error(e.to_string(), true));
            self.pool.kill_all();
            self.finish().await;
            return Err(e);
        }
        self.stats.observe_workers(self.pool.count_live());

        let watchers = self.signals.spawn_watchers(self.control.sender());
        self.phase = DispatcherPhase::Running;
        info!("Dispatcher running");

        loop {
            self.drain_control_queue();

            match self.phase {
                DispatcherPhase::Running => {
                    let polled = match self.consume_cycle().await {
                        Ok(polled) => polled,
                        Err(e) => {
                            self.note_broker_error(e);
                            0
                        }
                    };
                    let completed = self.collect_reports().await;
                    self.reap_cycle(true).await;
                    self.assign_cycle();
                    self.stats.observe_cached(self.cache.len());
                    self.stats.observe_workers(self.pool.count_live());

                    if polled == 0 && completed == 0 {
                        self.tick().await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
                DispatcherPhase::Draining => {
                    let completed = self.collect_reports().await;
                    self.reap_cycle(false).await;

                    if self.pool.is_empty() {
                        break;
                    }
                    if self.drain_deadline_passed() {
                        warn!("Drain deadline exceeded, force-killing remaining workers");
                        self.emit(DispatcherEvent::error(
                            WarrenError::DrainDeadline.to_string(),
                            true,
                        ));
                        if self.fatal.is_none() {
                            self.fatal = Some(WarrenError::DrainDeadline);
                        }
                        let killed = self.pool.kill_all();
                        self.settle_reaped(killed).await;
                        break;
                    }

                    if completed == 0 {
                        self.tick().await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
                _ => break,
            }
        }

        let snapshot = self.finish().await;
        for watcher in watchers {
            watcher.abort();
        }

        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(snapshot),
        }
    }

    async fn connect_broker(&self) -> Result<()> {
        self.conn.subscribe(&self.config.queues).await?;
        self.conn.set_prefetch(self.config.prefetch).await?;
        Ok(())
    }

    /// Poll the broker up to `poll_batch` times, caching each delivery.
    ///
    /// Stops early when the broker has nothing deliverable (queue empty
    /// or prefetch window full) or the local soft limit is reached.
    async fn consume_cycle(&mut self) -> Result<usize> {
        let mut polled = 0;
        for _ in 0..self.config.poll_batch {
            if self.cache.over_limit() {
                break;
            }
            match self.conn.poll_message().await? {
                Some(envelope) => {
                    self.stats.record_consumed(envelope.len());
                    self.cache.push(envelope);
                    polled += 1;
                }
                None => break,
            }
        }
        Ok(polled)
    }

    /// Settle every pending worker outcome against the broker.
    ///
    /// Done means ack and a `processed` event; a clean failure means
    /// nack (requeue per policy) and an `error` event, with the worker
    /// kept alive for the next assignment.
    async fn collect_reports(&mut self) -> usize {
        let mut completed: Vec<(WorkerId, WorkerReport, Option<Envelope>)> = Vec::new();
        for unit in self.pool.units_mut() {
            if let Some(report) = unit.try_report() {
                let envelope = unit.finish();
                completed.push((unit.id().clone(), report, envelope));
            }
        }
        let count = completed.len();

        for (id, report, envelope) in completed {
            let Some(envelope) = envelope else {
                self.emit(DispatcherEvent::error(
                    format!("report from worker {id} with no assignment"),
                    false,
                ));
                continue;
            };

            match report {
                WorkerReport::Done => match self.conn.ack(envelope.delivery_tag).await {
                    Ok(()) => {
                        self.stats.record_processed();
                        debug!(worker_id = %id, tag = %envelope.delivery_tag, "Processed message");
                        self.emit(DispatcherEvent::processed(
                            id.as_str(),
                            envelope.delivery_tag,
                            envelope.redelivered,
                        ));
                    }
                    Err(e) => self.note_broker_error(e),
                },
                WorkerReport::Failed(reason) => {
                    if let Err(e) = self
                        .conn
                        .nack(envelope.delivery_tag, self.config.requeue_on_failure)
                        .await
                    {
                        self.note_broker_error(e);
                    }
                    warn!(
                        worker_id = %id,
                        tag = %envelope.delivery_tag,
                        reason = %reason,
                        "Handler rejected message"
                    );
                    self.emit(DispatcherEvent::error(
                        format!(
                            "handler failed on delivery {}: {reason}",
                            envelope.delivery_tag
                        ),
                        false,
                    ));
                }
            }
        }

        count
    }

    /// Reclaim dead workers and, while running, restore the pool size.
    async fn reap_cycle(&mut self, replace: bool) {
        let reaped = self.pool.reap(self.config.response_timeout);
        self.settle_reaped(reaped).await;

        if replace && self.phase == DispatcherPhase::Running {
            if let Err(e) = self.pool.spawn_to_target() {
                self.emit(DispatcherEvent::error(e.to_string(), false));
            }
        }
    }

    /// Requeue in-flight messages of reaped workers and announce exits.
    async fn settle_reaped(&mut self, reaped: Vec<ReapedWorker>) {
        for ReapedWorker {
            id,
            unfinished,
            crashed,
        } in reaped
        {
            let mut requeued = false;
            if let Some(envelope) = unfinished {
                let requeue = self.config.requeue_on_crash;
                match self.conn.nack(envelope.delivery_tag, requeue).await {
                    Ok(()) => requeued = requeue,
                    Err(e) => self.note_broker_error(e),
                }
            }
            if crashed {
                warn!(worker_id = %id, requeued, "Worker crashed");
            }
            self.emit(DispatcherEvent::worker_exit(id.as_str(), crashed, requeued));
        }
    }

    /// Hand cached envelopes FIFO to idle workers, one each.
    fn assign_cycle(&mut self) {
        if self.phase != DispatcherPhase::Running {
            return;
        }

        for id in self.pool.idle_ids() {
            if self.cache.is_empty() {
                break;
            }
            let Some(unit) = self.pool.get_mut(&id) else {
                continue;
            };
            let Some(envelope) = self.cache.pop() else {
                break;
            };
            let tag = envelope.delivery_tag;
            match unit.assign(envelope) {
                Ok(()) => debug!(worker_id = %id, tag = %tag, "Assigned message"),
                // The unit keeps the envelope as unfinished; the next
                // reap requeues it under the crash policy.
                Err(e) => self.emit(DispatcherEvent::error(e.to_string(), false)),
            }
        }
    }

    /// Surface a broker error; a fatal one forces the drain.
    fn note_broker_error(&mut self, err: WarrenError) {
        let fatal = err.is_fatal();
        if fatal && self.fatal.is_some() {
            // Connection already known dead; avoid repeating the event.
            debug!(error = %err, "Broker call failed after fatal error");
            return;
        }

        self.emit(DispatcherEvent::error(err.to_string(), fatal));
        if fatal {
            warn!(error = %err, "Fatal broker error, draining");
            self.fatal = Some(err);
            self.begin_drain();
        }
    }

    /// Switch to draining: stop consumption and ask workers to exit.
    fn begin_drain(&mut self) {
        if self.phase != DispatcherPhase::Running {
            return;
        }
        info!("Draining: no new assignments, waiting for busy workers");
        self.phase = DispatcherPhase::Draining;
        self.drain_started = Some(Instant::now());
        self.pool.terminate_all();
    }

    fn drain_deadline_passed(&self) -> bool {
        match (self.config.drain_deadline, self.drain_started) {
            (Some(deadline), Some(started)) => started.elapsed() > deadline,
            _ => false,
        }
    }

    /// Requeue unassigned messages, close the broker, publish stats.
    async fn finish(&mut self) -> StatsSnapshot {
        for envelope in self.cache.drain() {
            if let Err(e) = self.conn.nack(envelope.delivery_tag, true).await {
                self.note_broker_error(e);
            }
        }

        if let Err(e) = self.conn.close().await {
            debug!(error = %e, "Broker close failed");
        }

        self.phase = DispatcherPhase::Stopped;
        let snapshot = self.stats.snapshot();
        info!(
            consumed = snapshot.consumed,
            processed = snapshot.processed,
            peak_num_workers = snapshot.peak_num_workers,
            peak_num_cached = snapshot.peak_num_cached,
            "Dispatcher stopped"
        );
        self.emit(DispatcherEvent::shutdown(snapshot));
        snapshot
    }

    fn drain_control_queue(&mut self) {
        while let Ok(request) = self.control_rx.try_recv() {
            self.handle_control(request);
        }
    }

    fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Shutdown => {
                info!("Shutdown requested");
                self.begin_drain();
            }
            ControlRequest::Signal(index) => {
                let control = self.control.clone();
                self.signals.invoke(index, &control);
            }
        }
    }

    /// Sleep until the next tick or an incoming control request.
    async fn tick(&mut self) {
        tokio::select! {
            request = self.control_rx.recv() => {
                if let Some(request) = request {
                    self.handle_control(request);
                }
            }
            _ = tokio::time::sleep(self.config.tick_interval) => {}
        }
    }

    fn emit(&mut self, event: DispatcherEvent) {
        let context = EventContext::new(
            self.stats.snapshot(),
            self.pool.count_live(),
            &self.control,
        );
        self.events.emit(&event, &context);
    }
}

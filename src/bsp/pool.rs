//! Bounded set of handler threads, one per accepted channel.

use super::channel::Channel;
use super::handler::{CancellationToken, Handler, HandlerKind, WorkerContext};
use crate::config::BspConfig;
use crate::error::Error;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Abort text sent when the pool is at capacity.
pub const SERVER_FULL_MESSAGE: &str = "Server full, try again later.";

/// Abort text sent when a handler fails.
pub const SERVER_ERROR_MESSAGE: &str = "Server encountered an error.";

/// Identifies one worker for the lifetime of the pool.
pub type WorkerId = u64;

/// Snapshot of an active worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub socket_id: u32,
    pub kind: &'static str,
}

struct Worker {
    id: WorkerId,
    kind: &'static str,
    channel: Arc<Channel>,
    token: CancellationToken,
    exit_signal: Mutex<Option<Receiver<()>>>,
    exited: AtomicBool,
}

impl Worker {
    // Publishes the exit exactly once, whoever gets here first.
    fn report_exit(&self, pool: &Weak<PoolInner>) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = pool.upgrade() {
            pool.remove(self.id);
        }
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            socket_id: self.channel.socket_id(),
            kind: self.kind,
        }
    }
}

struct PoolInner {
    max_workers: usize,
    grace: Duration,
    workers: Mutex<HashMap<WorkerId, Arc<Worker>>>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, Arc<Worker>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: WorkerId) {
        match self.lock().remove(&id) {
            Some(worker) => debug!(id, socket = worker.channel.socket_id(), "Worker exited"),
            None => debug!(id, "Worker exit reported after removal"),
        }
    }
}

/// Runs at most `max_workers` handlers at once.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

// ============================================================================
// Constructors
// ============================================================================

impl WorkerPool {
    pub fn new(config: &BspConfig) -> Self {
        Self::with_limits(config.max_workers, config.worker_grace)
    }

    pub fn with_limits(max_workers: usize, grace: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_workers,
                grace,
                workers: Mutex::new(HashMap::with_capacity(max_workers)),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

// ============================================================================
// Worker Management
// ============================================================================

impl WorkerPool {
    /// Starts a handler of `kind` on its own thread, bound to `channel`.
    ///
    /// At capacity the channel is aborted with [`SERVER_FULL_MESSAGE`] and
    /// [`Error::ServerFull`] is returned; no handler is constructed. A channel
    /// that already has a worker is left alone and [`Error::AlreadyBound`] is
    /// returned.
    #[instrument(skip(self, channel, kind), fields(socket = channel.socket_id(), kind = kind.name))]
    pub fn bind(&self, channel: &Arc<Channel>, kind: HandlerKind) -> Result<WorkerId, Error> {
        let mut workers = self.inner.lock();
        if let Some(existing) = workers
            .values()
            .find(|worker| Arc::ptr_eq(&worker.channel, channel))
        {
            warn!(existing = existing.id, "Channel already has a worker, refusing");
            return Err(Error::AlreadyBound {
                socket: channel.socket_id(),
            });
        }
        if workers.len() >= self.inner.max_workers {
            drop(workers);
            warn!(max_workers = self.inner.max_workers, "Worker pool full, refusing channel");
            channel.send_abort(SERVER_FULL_MESSAGE);
            return Err(Error::ServerFull {
                max_workers: self.inner.max_workers,
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (exit_tx, exit_rx) = mpsc::channel();
        let worker = Arc::new(Worker {
            id,
            kind: kind.name,
            channel: Arc::clone(channel),
            token: token.clone(),
            exit_signal: Mutex::new(Some(exit_rx)),
            exited: AtomicBool::new(false),
        });

        let handler = (kind.construct)(Arc::clone(channel));
        let ctx = WorkerContext::new(Arc::clone(channel), token);
        let pool = Arc::downgrade(&self.inner);
        let thread_worker = Arc::clone(&worker);

        // The exit path needs the lock we hold, so the entry is always in the
        // map before the thread can remove it.
        let spawned = thread::Builder::new()
            .name(format!("bsp-worker-{:x}", channel.socket_id()))
            .spawn(move || run_worker(handler, ctx, exit_tx, thread_worker, pool));
        if let Err(err) = spawned {
            drop(workers);
            error!(%err, "Failed to spawn worker thread");
            channel.send_abort(SERVER_ERROR_MESSAGE);
            return Err(Error::Io(err));
        }

        workers.insert(id, worker);
        info!(id, active = workers.len(), "Worker started");
        Ok(id)
    }

    /// Removes a worker from the active set. Unknown or repeated ids are
    /// ignored.
    pub fn on_handler_exit(&self, id: WorkerId) {
        let worker = self.inner.lock().get(&id).cloned();
        match worker {
            Some(worker) => worker.report_exit(&Arc::downgrade(&self.inner)),
            None => debug!(id, "Exit for unknown worker ignored"),
        }
    }

    /// Asks one worker to stop and waits up to the grace period.
    ///
    /// A handler that does not return in time is abandoned: its thread is
    /// detached and its exit reported on its behalf.
    #[instrument(skip(self))]
    pub fn terminate(&self, id: WorkerId) {
        let worker = self.inner.lock().get(&id).cloned();
        if let Some(worker) = worker {
            signal_stop(&worker);
            self.await_exit(&worker);
        }
    }

    /// Terminates every active worker.
    ///
    /// All workers are signalled first, then each gets its grace period.
    /// Registry entries are left to the normal exit and destroy paths.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        let workers: Vec<Arc<Worker>> = self.inner.lock().values().cloned().collect();
        info!(count = workers.len(), "Shutting down workers");
        for worker in &workers {
            signal_stop(worker);
        }
        for worker in &workers {
            self.await_exit(worker);
        }
    }

    fn await_exit(&self, worker: &Worker) {
        let signal = worker
            .exit_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(signal) = signal {
            match signal.recv_timeout(self.inner.grace) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        id = worker.id,
                        socket = worker.channel.socket_id(),
                        grace_ms = self.inner.grace.as_millis() as u64,
                        "Worker did not exit in time, abandoning its thread"
                    );
                }
            }
        }
        worker.report_exit(&Arc::downgrade(&self.inner));
    }
}

// ============================================================================
// Introspection
// ============================================================================

impl WorkerPool {
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn enumerate_active(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self.inner.lock().values().map(|w| w.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

// ============================================================================
// Worker Thread
// ============================================================================

fn signal_stop(worker: &Worker) {
    debug!(id = worker.id, "Asking worker to exit");
    worker.token.cancel();
    worker.channel.cancel();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// Holds the worker until the close handshake completes or times out.
fn linger(channel: &Channel) {
    if let Err(err) = channel.await_close() {
        debug!(socket = channel.socket_id(), %err, "Stopped waiting for close");
    }
}

// Runs the handler, converts faults into a channel abort, and always reports
// the exit.
fn run_worker(
    mut handler: Box<dyn Handler>,
    ctx: WorkerContext,
    exit_tx: Sender<()>,
    worker: Arc<Worker>,
    pool: Weak<PoolInner>,
) {
    let channel = Arc::clone(ctx.channel());
    let socket = channel.socket_id();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.run(&ctx)));

    match outcome {
        Ok(Ok(())) => {
            debug!(socket, "Handler finished");
            if !ctx.is_cancelled() {
                match channel.close() {
                    Ok(()) => linger(&channel),
                    Err(err) => debug!(socket, %err, "Channel not closed after handler finished"),
                }
            }
        }
        Ok(Err(err)) if err.is_end_of_stream() => {
            debug!(socket, %err, "Handler stopped at end of stream");
            if !ctx.is_cancelled() {
                linger(&channel);
            }
        }
        Ok(Err(err)) => {
            error!(socket, %err, "Handler terminated with error");
            channel.send_abort(SERVER_ERROR_MESSAGE);
        }
        Err(payload) => {
            error!(socket, panic = %panic_message(payload.as_ref()), "Handler panicked");
            channel.send_abort(SERVER_ERROR_MESSAGE);
        }
    }

    let _ = exit_tx.send(());
    worker.report_exit(&pool);
}

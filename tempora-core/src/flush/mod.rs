//! Background flush coordinator
//!
//! A single worker thread turns frozen MemTables into SSTables in the
//! order they were frozen. Writers hand work over through a bounded
//! channel; a slot must be reserved before a MemTable is frozen, so the
//! number of frozen MemTables held in memory never exceeds the queue
//! depth. A failed flush is retried until it succeeds; the frozen
//! MemTable and its WAL segments stay in place in the meantime.

use crate::memtable::MemTable;
use crate::{Result, TemporaError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Flush coordinator configuration
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Frozen MemTables allowed to wait for the worker
    pub queue_depth: usize,
    /// Pause between attempts of a failed flush
    pub retry_interval: Duration,
    /// How long a writer waits for a free slot before failing
    pub backpressure_timeout: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            queue_depth: crate::config::FLUSH_QUEUE_DEPTH,
            retry_interval: crate::config::FLUSH_RETRY_INTERVAL,
            backpressure_timeout: crate::config::BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Persists one frozen MemTable and publishes the result
pub trait FlushHandler: Send + Sync + 'static {
    /// Write `memtable` to durable storage and commit it.
    ///
    /// Called again with the same MemTable after a failure.
    fn flush(&self, memtable: &Arc<MemTable>) -> Result<()>;
}

/// Receives the outcome of a flush
pub type FlushNotifier = Sender<Result<()>>;

struct FlushTask {
    memtable: Arc<MemTable>,
    done: Option<FlushNotifier>,
}

/// Counts frozen MemTables between reservation and commit
struct FlushQueue {
    pending: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

impl FlushQueue {
    fn try_acquire(&self) -> bool {
        let mut pending = self.pending.lock();
        if *pending < self.capacity {
            *pending += 1;
            true
        } else {
            false
        }
    }

    fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while *pending >= self.capacity {
            let timed_out = self.released.wait_until(&mut pending, deadline).timed_out();
            if timed_out && *pending >= self.capacity {
                return false;
            }
        }
        *pending += 1;
        true
    }

    fn release(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        self.released.notify_all();
    }

    fn depth(&self) -> usize {
        *self.pending.lock()
    }
}

#[derive(Default)]
struct FlushState {
    last_error: Mutex<Option<String>>,
    completed: AtomicU64,
    failures: AtomicU64,
    closed: AtomicBool,
}

/// A reserved place in the flush queue.
///
/// Released automatically if dropped without submitting.
pub struct FlushSlot<'a> {
    coordinator: &'a FlushCoordinator,
    used: bool,
}

impl FlushSlot<'_> {
    /// Queue a frozen MemTable, optionally asking for its outcome
    pub fn submit(mut self, memtable: Arc<MemTable>, done: Option<FlushNotifier>) -> Result<()> {
        let sender = self.coordinator.sender.lock().clone();
        let sender = sender.ok_or(TemporaError::Closed)?;
        sender
            .send(FlushTask { memtable, done })
            .map_err(|_| TemporaError::Closed)?;
        self.used = true;
        Ok(())
    }
}

impl Drop for FlushSlot<'_> {
    fn drop(&mut self) {
        if !self.used {
            self.coordinator.queue.release();
        }
    }
}

/// Dedicated flush worker plus its handoff queue
pub struct FlushCoordinator {
    config: FlushConfig,
    sender: Mutex<Option<Sender<FlushTask>>>,
    shutdown: Mutex<Option<Sender<()>>>,
    queue: Arc<FlushQueue>,
    state: Arc<FlushState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FlushCoordinator {
    /// Start the worker thread
    pub fn start(config: FlushConfig, handler: Arc<dyn FlushHandler>) -> Result<Self> {
        if config.queue_depth == 0 {
            return Err(TemporaError::Config("flush queue depth must be positive".into()));
        }

        let (sender, receiver) = bounded(config.queue_depth);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let queue = Arc::new(FlushQueue {
            pending: Mutex::new(0),
            released: Condvar::new(),
            capacity: config.queue_depth,
        });
        let state = Arc::new(FlushState::default());

        let worker = FlushWorker {
            receiver,
            shutdown: shutdown_rx,
            handler,
            queue: Arc::clone(&queue),
            state: Arc::clone(&state),
            retry_interval: config.retry_interval,
        };
        let handle = thread::Builder::new()
            .name("tempora-flush".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            shutdown: Mutex::new(Some(shutdown_tx)),
            queue,
            state,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Reserve a slot if one is free right now
    pub fn try_reserve(&self) -> Option<FlushSlot<'_>> {
        if self.is_closed() || !self.queue.try_acquire() {
            return None;
        }
        Some(FlushSlot {
            coordinator: self,
            used: false,
        })
    }

    /// Reserve a slot, waiting up to the backpressure timeout
    pub fn reserve(&self) -> Result<FlushSlot<'_>> {
        if self.is_closed() {
            return Err(TemporaError::Closed);
        }
        if !self.queue.acquire_timeout(self.config.backpressure_timeout) {
            warn!(
                depth = self.queue.depth(),
                "Flush queue still full after {:?}", self.config.backpressure_timeout
            );
            return Err(TemporaError::Capacity(format!(
                "{} frozen memtables waiting to flush",
                self.queue.depth()
            )));
        }
        Ok(FlushSlot {
            coordinator: self,
            used: false,
        })
    }

    /// Frozen MemTables reserved, queued or being flushed
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Flushes committed since start
    pub fn completed(&self) -> u64 {
        self.state.completed.load(Ordering::Relaxed)
    }

    /// Failed flush attempts since start
    pub fn failures(&self) -> u64 {
        self.state.failures.load(Ordering::Relaxed)
    }

    /// Error of the most recent failed attempt, cleared by a success
    pub fn last_error(&self) -> Option<String> {
        self.state.last_error.lock().clone()
    }

    /// Check if the coordinator stopped accepting work
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Stop accepting work, let the worker drain the queue and join it
    pub fn shutdown(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.lock().take();
        self.shutdown.lock().take();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Flush worker panicked");
            }
        }
        info!(completed = self.completed(), "Flush coordinator stopped");
    }
}

impl Drop for FlushCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct FlushWorker {
    receiver: Receiver<FlushTask>,
    shutdown: Receiver<()>,
    handler: Arc<dyn FlushHandler>,
    queue: Arc<FlushQueue>,
    state: Arc<FlushState>,
    retry_interval: Duration,
}

impl FlushWorker {
    fn run(self) {
        // Once a flush is abandoned, later MemTables must not commit ahead
        // of it: their WAL retirement would cover its unflushed records.
        let mut abandoned = false;

        while let Ok(task) = self.receiver.recv() {
            if abandoned {
                warn!(memtable = task.memtable.id(), "Skipping flush after an abandoned one");
                notify(task.done, Err(TemporaError::Closed));
            } else {
                abandoned = !self.process(task);
            }
            self.queue.release();
        }
    }

    /// Flush one MemTable, retrying until it commits. Returns false if
    /// the worker gave up because of shutdown.
    fn process(&self, task: FlushTask) -> bool {
        let FlushTask { memtable, mut done } = task;
        let mut attempt = 0u64;

        loop {
            attempt += 1;
            match self.handler.flush(&memtable) {
                Ok(()) => {
                    self.state.completed.fetch_add(1, Ordering::Relaxed);
                    self.state.last_error.lock().take();
                    notify(done, Ok(()));
                    return true;
                }
                Err(e) => {
                    self.state.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        memtable = memtable.id(),
                        attempt,
                        "Flush failed, frozen memtable retained: {}",
                        e
                    );
                    *self.state.last_error.lock() = Some(e.to_string());
                    notify(done.take(), Err(TemporaError::FlushFailed(e.to_string())));
                }
            }

            match self.shutdown.recv_timeout(self.retry_interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => {
                    warn!(
                        memtable = memtable.id(),
                        "Abandoning flush on shutdown; its WAL segments are kept for replay"
                    );
                    return false;
                }
            }
        }
    }
}

fn notify(done: Option<FlushNotifier>, result: Result<()>) {
    if let Some(done) = done {
        let _ = done.send(result);
    }
}

//! Connections and their job queues.
//!
//! [`QueuedConnection`] is the stock [`Connection`]: jobs wait in a queue and
//! are drained in bounded batches, with every change reported to a
//! [`JobQueueMonitor`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{Result, StageError};

use super::monitor::JobQueueMonitor;

/// Queued unit of work for one connection.
pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Transport-facing state of a connection: identity and the auto-read toggle
/// used for backpressure.
pub struct ConnectionChannel {
    id: String,
    remote: String,
    auto_read: AtomicBool,
}

impl ConnectionChannel {
    /// New channel with auto-read enabled.
    pub fn new(id: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote: remote.into(),
            auto_read: AtomicBool::new(true),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote address.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Whether the transport keeps reading incoming requests.
    pub fn is_auto_read(&self) -> bool {
        self.auto_read.load(Ordering::Acquire)
    }

    /// Turns reading of incoming requests on or off.
    pub fn set_auto_read(&self, enabled: bool) {
        self.auto_read.store(enabled, Ordering::Release);
    }
}

impl fmt::Debug for ConnectionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("auto_read", &self.is_auto_read())
            .finish()
    }
}

/// A connection as seen by the scheduler.
///
/// The scheduler guarantees that `process_next_batch` never runs twice
/// concurrently for one connection.
pub trait Connection: Send + Sync {
    /// Stable id, unique among registered connections.
    fn id(&self) -> &str;

    /// Transport state.
    fn channel(&self) -> &ConnectionChannel;

    /// Whether jobs are waiting.
    fn has_pending_jobs(&self) -> bool;

    /// Runs the next batch of queued jobs. Returns `false` once the
    /// connection should not be scheduled anymore.
    fn process_next_batch(&self) -> Result<bool>;

    /// Receives a failure to hand this connection's batch to the pool.
    fn handle_scheduling_error(&self, err: StageError);

    /// Stops the connection; pending jobs are dropped.
    fn stop(&self);
}

/// Stock [`Connection`] backed by an in-memory job queue.
pub struct QueuedConnection {
    channel: ConnectionChannel,
    queue: Mutex<VecDeque<Job>>,
    max_batch_size: usize,
    monitor: Arc<dyn JobQueueMonitor>,
    stopped: AtomicBool,
    processed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl QueuedConnection {
    /// Creates a connection reporting queue activity to `monitor`.
    pub fn new(
        channel: ConnectionChannel,
        max_batch_size: usize,
        monitor: Arc<dyn JobQueueMonitor>,
    ) -> Self {
        Self {
            channel,
            queue: Mutex::new(VecDeque::new()),
            max_batch_size: max_batch_size.max(1),
            monitor,
            stopped: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Queues `job` and notifies the monitor.
    pub fn enqueue(&self, job: Job) -> Result<()> {
        if self.is_stopped() {
            return Err(StageError::invalid(format!(
                "connection {} is stopped",
                self.channel.id()
            )));
        }
        self.queue.lock().push_back(job);
        self.monitor.enqueued(&self.channel);
        Ok(())
    }

    /// Jobs waiting.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Jobs completed successfully.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Whether [`Connection::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Last error received through [`Connection::handle_scheduling_error`].
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Connection for QueuedConnection {
    fn id(&self) -> &str {
        self.channel.id()
    }

    fn channel(&self) -> &ConnectionChannel {
        &self.channel
    }

    fn has_pending_jobs(&self) -> bool {
        !self.is_stopped() && !self.queue.lock().is_empty()
    }

    fn process_next_batch(&self) -> Result<bool> {
        if self.is_stopped() {
            return Ok(false);
        }
        let batch: Vec<Job> = {
            let mut queue = self.queue.lock();
            let n = queue.len().min(self.max_batch_size);
            queue.drain(..n).collect()
        };
        if batch.is_empty() {
            return Ok(true);
        }
        self.monitor.drained(&self.channel, batch.len());
        for job in batch {
            job()?;
            self.processed.fetch_add(1, Ordering::AcqRel);
        }
        Ok(!self.is_stopped())
    }

    fn handle_scheduling_error(&self, err: StageError) {
        warn!(
            connection = self.channel.id(),
            remote = self.channel.remote(),
            error = %err,
            "connection.scheduling_failed"
        );
        *self.last_error.lock() = Some(err.to_string());
        self.stop();
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut queue = self.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            self.monitor.drained(&self.channel, dropped);
        }
        self.monitor.stopped(&self.channel);
        debug!(connection = self.channel.id(), dropped, "connection.stopped");
    }
}

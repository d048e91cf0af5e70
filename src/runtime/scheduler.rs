//! Per-connection batch scheduling on a shared worker pool.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info_span};

use crate::types::Result;

use super::connection::{Connection, ConnectionChannel};
use super::monitor::JobQueueMonitor;
use super::pool::WorkerPool;

struct Ticket {
    id: u64,
    cancelled: AtomicBool,
}

enum Work {
    Running(Arc<Ticket>),
    HandlingError,
}

struct Shared {
    pool: WorkerPool,
    connections: Mutex<FxHashMap<String, Arc<dyn Connection>>>,
    active_work: Mutex<FxHashMap<String, Work>>,
    next_ticket: AtomicU64,
}

/// Runs connection batches on a shared [`WorkerPool`], at most one batch per
/// connection at any time.
///
/// A connection with work in flight is not submitted again; the finishing
/// batch resubmits it when more jobs arrived meanwhile.
#[derive(Clone)]
pub struct ConnectionScheduler {
    shared: Arc<Shared>,
}

impl ConnectionScheduler {
    /// Creates a scheduler over `pool`.
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                connections: Mutex::new(FxHashMap::default()),
                active_work: Mutex::new(FxHashMap::default()),
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a scheduler with a dedicated pool of `threads` workers.
    pub fn with_threads(name: &str, threads: usize, queue_size: usize) -> Result<Self> {
        Ok(Self::new(WorkerPool::new(name, threads, queue_size)?))
    }

    /// Registers `connection`. A previous registration with the same id is replaced.
    pub fn created(&self, connection: Arc<dyn Connection>) {
        let id = connection.id().to_owned();
        debug!(connection = %id, "scheduler.created");
        self.shared.connections.lock().insert(id, connection);
    }

    /// Deregisters a connection. An in-flight batch is marked cancelled and
    /// forgotten without waiting for it.
    pub fn closed(&self, id: &str) {
        self.shared.connections.lock().remove(id);
        if let Some(Work::Running(ticket)) = self.shared.active_work.lock().remove(id) {
            ticket.cancelled.store(true, Ordering::Release);
        }
        debug!(connection = %id, "scheduler.closed");
    }

    /// Signals new work for a registered connection.
    pub fn enqueued(&self, id: &str) {
        let connection = self.shared.connections.lock().get(id).cloned();
        match connection {
            Some(connection) => submit(&self.shared, connection),
            None => debug!(connection = %id, "scheduler.enqueued_unknown"),
        }
    }

    /// Whether a batch or error handler is in flight for `id`.
    pub fn is_active(&self, id: &str) -> bool {
        self.shared.active_work.lock().contains_key(id)
    }

    /// Number of registered connections.
    pub fn connections(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Stops every registered connection, then the pool.
    pub fn shutdown(&self) {
        let connections: Vec<_> = self.shared.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in &connections {
            connection.stop();
        }
        self.shared.pool.shutdown();
        debug!(stopped = connections.len(), "scheduler.shutdown");
    }
}

impl JobQueueMonitor for ConnectionScheduler {
    fn enqueued(&self, connection: &ConnectionChannel) {
        ConnectionScheduler::enqueued(self, connection.id());
    }

    fn drained(&self, _connection: &ConnectionChannel, _batch: usize) {}

    fn stopped(&self, connection: &ConnectionChannel) {
        ConnectionScheduler::closed(self, connection.id());
    }
}

fn submit(shared: &Arc<Shared>, connection: Arc<dyn Connection>) {
    let id = connection.id().to_owned();
    let ticket = {
        let mut active = shared.active_work.lock();
        if active.contains_key(&id) {
            return;
        }
        let ticket = Arc::new(Ticket {
            id: shared.next_ticket.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(false),
        });
        active.insert(id.clone(), Work::Running(Arc::clone(&ticket)));
        ticket
    };

    let task_shared = Arc::clone(shared);
    let task_connection = Arc::clone(&connection);
    let task_ticket = Arc::clone(&ticket);
    let submitted = shared.pool.submit(Box::new(move || {
        run_batch(&task_shared, task_connection, task_ticket);
    }));

    if let Err(err) = submitted {
        {
            let mut active = shared.active_work.lock();
            if owns(&active, &id, &ticket) {
                active.insert(id.clone(), Work::HandlingError);
            }
        }
        connection.handle_scheduling_error(err);
        let mut active = shared.active_work.lock();
        if matches!(active.get(&id), Some(Work::HandlingError)) {
            active.remove(&id);
        }
    }
}

fn owns(active: &FxHashMap<String, Work>, id: &str, ticket: &Arc<Ticket>) -> bool {
    matches!(active.get(id), Some(Work::Running(t)) if Arc::ptr_eq(t, ticket))
}

fn run_batch(shared: &Arc<Shared>, connection: Arc<dyn Connection>, ticket: Arc<Ticket>) {
    let id = connection.id().to_owned();
    if ticket.cancelled.load(Ordering::Acquire) {
        debug!(connection = %id, ticket = ticket.id, "scheduler.batch_cancelled");
        return;
    }

    let span = info_span!("connection.batch", connection = %id, ticket = ticket.id);
    let keep_going = {
        let _entered = span.enter();
        match catch_unwind(AssertUnwindSafe(|| connection.process_next_batch())) {
            Ok(Ok(keep_going)) => keep_going,
            Ok(Err(err)) => {
                error!(
                    connection = %id,
                    remote = connection.channel().remote(),
                    error = %err,
                    "scheduler.batch_failed"
                );
                connection.stop();
                false
            }
            Err(panic) => {
                error!(
                    connection = %id,
                    remote = connection.channel().remote(),
                    panic = %panic_message(panic.as_ref()),
                    "scheduler.batch_panicked"
                );
                connection.stop();
                false
            }
        }
    };

    {
        let mut active = shared.active_work.lock();
        if owns(&active, &id, &ticket) {
            active.remove(&id);
        }
    }

    if keep_going
        && !ticket.cancelled.load(Ordering::Acquire)
        && connection.has_pending_jobs()
        && shared.connections.lock().contains_key(&id)
    {
        submit(shared, connection);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::runtime::connection::QueuedConnection;
    use crate::types::StageError;

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    struct Panicking {
        channel: ConnectionChannel,
        stopped: AtomicBool,
        ran: AtomicUsize,
    }

    impl Connection for Panicking {
        fn id(&self) -> &str {
            self.channel.id()
        }
        fn channel(&self) -> &ConnectionChannel {
            &self.channel
        }
        fn has_pending_jobs(&self) -> bool {
            false
        }
        fn process_next_batch(&self) -> Result<bool> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            panic!("batch exploded");
        }
        fn handle_scheduling_error(&self, _err: StageError) {}
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn runs_queued_jobs() {
        let scheduler = ConnectionScheduler::with_threads("sched", 2, 16).unwrap();
        let conn = Arc::new(QueuedConnection::new(
            ConnectionChannel::new("c1", "10.0.0.1:7687"),
            4,
            Arc::new(scheduler.clone()),
        ));
        scheduler.created(conn.clone());
        for _ in 0..10 {
            conn.enqueue(Box::new(|| -> Result<()> { Ok(()) })).unwrap();
        }
        wait_for(|| conn.processed() == 10);
        wait_for(|| !scheduler.is_active("c1"));
        scheduler.shutdown();
        assert!(conn.is_stopped());
    }

    #[test]
    fn panicking_batch_stops_connection() {
        let scheduler = ConnectionScheduler::with_threads("sched-panic", 1, 4).unwrap();
        let conn = Arc::new(Panicking {
            channel: ConnectionChannel::new("p", "remote"),
            stopped: AtomicBool::new(false),
            ran: AtomicUsize::new(0),
        });
        scheduler.created(conn.clone());
        scheduler.enqueued("p");
        wait_for(|| conn.stopped.load(Ordering::SeqCst));
        wait_for(|| !scheduler.is_active("p"));
        assert_eq!(conn.ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_connection_is_ignored() {
        let scheduler = ConnectionScheduler::with_threads("sched-unknown", 1, 1).unwrap();
        scheduler.enqueued("nobody");
        assert!(!scheduler.is_active("nobody"));
        assert_eq!(scheduler.connections(), 0);
    }

    #[test]
    fn closed_forgets_connection() {
        let scheduler = ConnectionScheduler::with_threads("sched-close", 1, 4).unwrap();
        let conn = Arc::new(QueuedConnection::new(
            ConnectionChannel::new("c", "r"),
            1,
            Arc::new(scheduler.clone()),
        ));
        scheduler.created(conn.clone());
        assert_eq!(scheduler.connections(), 1);
        scheduler.closed("c");
        assert_eq!(scheduler.connections(), 0);
        assert!(!scheduler.is_active("c"));
    }
}

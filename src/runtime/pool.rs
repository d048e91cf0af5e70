//! Bounded worker pool whose submissions never block.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::types::{Result, StageError};

/// Unit of work run on a pool thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named threads fed through a bounded queue.
///
/// Submission never blocks: a full queue or a shut-down pool rejects the task.
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<SyncSender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Starts `threads` workers named `<name>-<n>` sharing a queue of `queue_size` tasks.
    pub fn new(name: &str, threads: usize, queue_size: usize) -> Result<Self> {
        if threads == 0 {
            return Err(StageError::invalid("worker pool needs at least one thread"));
        }
        let (sender, receiver) = mpsc::sync_channel::<Task>(queue_size);
        let receiver = Arc::new(Mutex::new(receiver));
        let active = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let receiver = Arc::clone(&receiver);
            let active = Arc::clone(&active);
            let handle = thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || worker_loop(&receiver, &active))?;
            workers.push(handle);
        }
        debug!(name, threads, queue_size, "worker_pool.started");
        Ok(Self {
            name: name.to_owned(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            threads,
            active,
        })
    }

    /// Hands `task` to the pool or rejects it with [`StageError::Scheduling`].
    pub fn submit(&self, task: Task) -> Result<()> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(StageError::Scheduling(format!("{} is shut down", self.name)));
        };
        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(StageError::Scheduling(format!(
                "{} rejected a task: all {} threads busy and the queue is full",
                self.name, self.threads
            ))),
            Err(TrySendError::Disconnected(_)) => {
                Err(StageError::Scheduling(format!("{} is shut down", self.name)))
            }
        }
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Tasks currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stops accepting tasks, lets queued ones finish, and joins the workers.
    /// Called from a pool thread, that thread is not joined.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "worker_pool.worker_panicked");
            }
        }
        debug!(pool = %self.name, "worker_pool.stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Task>>, active: &AtomicUsize) {
    loop {
        let task = receiver.lock().recv();
        let Ok(task) = task else {
            break;
        };
        active.fetch_add(1, Ordering::AcqRel);
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("worker_pool.task_panicked");
        }
        active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_tasks_on_named_threads() {
        let pool = WorkerPool::new("test-pool", 2, 8).unwrap();
        let (tx, rx) = channel();
        for _ in 0..4 {
            let tx = tx.clone();
            pool.submit(Box::new(move || {
                let name = thread::current().name().map(str::to_owned);
                tx.send(name).unwrap();
            }))
            .unwrap();
        }
        for _ in 0..4 {
            let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            assert!(name.starts_with("test-pool-"));
        }
        pool.shutdown();
    }

    #[test]
    fn full_queue_rejects() {
        let pool = WorkerPool::new("tiny", 1, 1).unwrap();
        let (release_tx, release_rx) = channel::<()>();
        let (started_tx, started_rx) = channel::<()>();
        pool.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.submit(Box::new(|| {})).unwrap();
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, StageError::Scheduling(_)));
        release_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn shut_down_pool_rejects() {
        let pool = WorkerPool::new("closed", 1, 4).unwrap();
        pool.shutdown();
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(StageError::Scheduling(_))
        ));
    }

    #[test]
    fn panicking_task_keeps_worker_alive() {
        let pool = WorkerPool::new("panicky", 1, 4).unwrap();
        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = channel();
        pool.submit(Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn zero_threads_is_invalid() {
        assert!(WorkerPool::new("none", 0, 1).is_err());
    }
}

//! Job queue observers.
//!
//! Connections report every enqueue and every drained batch to a
//! [`JobQueueMonitor`]; [`MonitorAggregate`] fans those callbacks out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::connection::ConnectionChannel;

/// Observer of per-connection job queues.
///
/// Callbacks run synchronously on the thread that touched the queue, so
/// implementations must be cheap and must not block.
pub trait JobQueueMonitor: Send + Sync {
    /// One job was added to the queue of `connection`.
    fn enqueued(&self, connection: &ConnectionChannel);

    /// `batch` jobs were taken off the queue of `connection` for execution.
    fn drained(&self, connection: &ConnectionChannel, batch: usize);

    /// `connection` was stopped and will queue nothing more.
    fn stopped(&self, _connection: &ConnectionChannel) {}
}

/// A no-op implementation of [`JobQueueMonitor`].
#[derive(Default)]
pub struct NoopMonitor;

impl JobQueueMonitor for NoopMonitor {
    fn enqueued(&self, _connection: &ConnectionChannel) {}
    fn drained(&self, _connection: &ConnectionChannel, _batch: usize) {}
}

/// Fans every callback out to several monitors, in registration order.
#[derive(Default, Clone)]
pub struct MonitorAggregate {
    monitors: Vec<Arc<dyn JobQueueMonitor>>,
}

impl MonitorAggregate {
    /// Creates an aggregate over `monitors`.
    pub fn new(monitors: Vec<Arc<dyn JobQueueMonitor>>) -> Self {
        Self { monitors }
    }

    /// Adds one more observer.
    pub fn push(&mut self, monitor: Arc<dyn JobQueueMonitor>) {
        self.monitors.push(monitor);
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    /// Returns true without observers.
    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

impl JobQueueMonitor for MonitorAggregate {
    fn enqueued(&self, connection: &ConnectionChannel) {
        for monitor in &self.monitors {
            monitor.enqueued(connection);
        }
    }

    fn drained(&self, connection: &ConnectionChannel, batch: usize) {
        for monitor in &self.monitors {
            monitor.drained(connection, batch);
        }
    }

    fn stopped(&self, connection: &ConnectionChannel) {
        for monitor in &self.monitors {
            monitor.stopped(connection);
        }
    }
}

/// Atomic job counters across all connections.
#[derive(Default)]
pub struct JobQueueMetrics {
    /// Jobs queued.
    pub enqueued: AtomicU64,

    /// Jobs taken off queues.
    pub drained: AtomicU64,

    /// Batches taken off queues.
    pub batches: AtomicU64,
}

impl JobQueueMetrics {
    /// Jobs queued and not yet drained.
    pub fn queued(&self) -> u64 {
        self.enqueued
            .load(Ordering::Relaxed)
            .saturating_sub(self.drained.load(Ordering::Relaxed))
    }
}

impl JobQueueMonitor for JobQueueMetrics {
    fn enqueued(&self, _connection: &ConnectionChannel) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn drained(&self, _connection: &ConnectionChannel, batch: usize) {
        self.drained.fetch_add(batch as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_fans_out() {
        let a = Arc::new(JobQueueMetrics::default());
        let b = Arc::new(JobQueueMetrics::default());
        let mut aggregate = MonitorAggregate::default();
        aggregate.push(a.clone());
        aggregate.push(b.clone());
        aggregate.push(Arc::new(NoopMonitor));
        let channel = ConnectionChannel::new("c1", "127.0.0.1:7687");
        aggregate.enqueued(&channel);
        aggregate.enqueued(&channel);
        aggregate.drained(&channel, 2);
        for metrics in [&a, &b] {
            assert_eq!(metrics.enqueued.load(Ordering::Relaxed), 2);
            assert_eq!(metrics.drained.load(Ordering::Relaxed), 2);
            assert_eq!(metrics.batches.load(Ordering::Relaxed), 1);
            assert_eq!(metrics.queued(), 0);
        }
        assert_eq!(aggregate.len(), 3);
    }
}

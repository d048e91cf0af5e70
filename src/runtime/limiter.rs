//! Read backpressure driven by job queue depth.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::types::{Result, StageError};

use super::connection::ConnectionChannel;
use super::monitor::JobQueueMonitor;

/// Default low watermark.
pub const DEFAULT_LOW_WATERMARK: i64 = 100;
/// Default high watermark.
pub const DEFAULT_HIGH_WATERMARK: i64 = 300;

/// Watermark backpressure: turns a connection's auto-read off once its queue
/// reaches `high` jobs and back on once it falls to `low`.
///
/// Only crossings toggle the channel and log; steady states are silent.
pub struct ReadLimiter {
    low: i64,
    high: i64,
    queued: Mutex<FxHashMap<String, i64>>,
    disabled: AtomicU64,
    enabled: AtomicU64,
}

impl ReadLimiter {
    /// Requires `0 <= low < high`.
    pub fn new(low: i64, high: i64) -> Result<Self> {
        if high <= 0 {
            return Err(StageError::invalid(format!(
                "high watermark must be positive, got {high}"
            )));
        }
        if low < 0 {
            return Err(StageError::invalid(format!(
                "low watermark must not be negative, got {low}"
            )));
        }
        if low >= high {
            return Err(StageError::invalid(format!(
                "low watermark {low} must be below high watermark {high}"
            )));
        }
        Ok(Self {
            low,
            high,
            queued: Mutex::new(FxHashMap::default()),
            disabled: AtomicU64::new(0),
            enabled: AtomicU64::new(0),
        })
    }

    /// Low watermark.
    pub fn low_watermark(&self) -> i64 {
        self.low
    }

    /// High watermark.
    pub fn high_watermark(&self) -> i64 {
        self.high
    }

    /// Jobs counted as queued for connection `id`.
    pub fn queued(&self, id: &str) -> i64 {
        self.queued.lock().get(id).copied().unwrap_or(0)
    }

    /// Drops the count kept for a closed connection.
    pub fn forget(&self, id: &str) {
        self.queued.lock().remove(id);
    }

    /// Times auto-read was switched off.
    pub fn disabled_count(&self) -> u64 {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Times auto-read was switched back on.
    pub fn enabled_count(&self) -> u64 {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Default for ReadLimiter {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_WATERMARK,
            high: DEFAULT_HIGH_WATERMARK,
            queued: Mutex::new(FxHashMap::default()),
            disabled: AtomicU64::new(0),
            enabled: AtomicU64::new(0),
        }
    }
}

impl JobQueueMonitor for ReadLimiter {
    fn enqueued(&self, connection: &ConnectionChannel) {
        let mut queued = self.queued.lock();
        let count = queued.entry(connection.id().to_owned()).or_insert(0);
        *count += 1;
        if *count >= self.high && connection.is_auto_read() {
            connection.set_auto_read(false);
            self.disabled.fetch_add(1, Ordering::Relaxed);
            warn!(
                connection = connection.id(),
                remote = connection.remote(),
                queued = *count,
                high = self.high,
                "read_limiter.auto_read_disabled"
            );
        }
    }

    fn drained(&self, connection: &ConnectionChannel, batch: usize) {
        let mut queued = self.queued.lock();
        let count = queued.entry(connection.id().to_owned()).or_insert(0);
        let batch = i64::try_from(batch).unwrap_or(i64::MAX);
        *count = count.saturating_sub(batch).max(0);
        if *count <= self.low && !connection.is_auto_read() {
            connection.set_auto_read(true);
            self.enabled.fetch_add(1, Ordering::Relaxed);
            warn!(
                connection = connection.id(),
                remote = connection.remote(),
                queued = *count,
                low = self.low,
                "read_limiter.auto_read_enabled"
            );
        }
    }

    fn stopped(&self, connection: &ConnectionChannel) {
        self.forget(connection.id());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::runtime::connection::{Connection, QueuedConnection};

    #[test]
    fn toggles_only_on_crossings() {
        let limiter = ReadLimiter::new(1, 3).unwrap();
        let channel = ConnectionChannel::new("c", "r");
        for _ in 0..3 {
            limiter.enqueued(&channel);
        }
        assert!(!channel.is_auto_read());
        assert_eq!(limiter.disabled_count(), 1);

        limiter.enqueued(&channel);
        limiter.enqueued(&channel);
        assert_eq!(limiter.disabled_count(), 1);
        assert_eq!(limiter.queued("c"), 5);

        limiter.drained(&channel, 2);
        assert!(!channel.is_auto_read());
        limiter.drained(&channel, 2);
        assert!(channel.is_auto_read());
        assert_eq!(limiter.enabled_count(), 1);

        limiter.drained(&channel, 1);
        assert_eq!(limiter.queued("c"), 0);
        assert_eq!(limiter.enabled_count(), 1);
    }

    #[test]
    fn connections_are_counted_separately() {
        let limiter = ReadLimiter::new(0, 2).unwrap();
        let a = ConnectionChannel::new("a", "r");
        let b = ConnectionChannel::new("b", "r");
        limiter.enqueued(&a);
        limiter.enqueued(&b);
        assert!(a.is_auto_read() && b.is_auto_read());
        limiter.enqueued(&a);
        assert!(!a.is_auto_read());
        assert!(b.is_auto_read());
        limiter.forget("a");
        assert_eq!(limiter.queued("a"), 0);
    }

    #[test]
    fn stopped_connection_is_released() {
        let limiter = Arc::new(ReadLimiter::new(1, 3).unwrap());
        let conn = QueuedConnection::new(ConnectionChannel::new("s", "r"), 10, limiter.clone());
        for _ in 0..5 {
            conn.enqueue(Box::new(|| -> Result<()> { Ok(()) })).unwrap();
        }
        assert!(!conn.channel().is_auto_read());
        assert_eq!(limiter.queued("s"), 5);

        conn.stop();
        assert!(conn.channel().is_auto_read());
        assert_eq!(limiter.enabled_count(), 1);
        assert_eq!(limiter.queued("s"), 0);
        assert!(limiter.queued.lock().is_empty());
    }

    #[test]
    fn rejects_bad_watermarks() {
        assert!(matches!(ReadLimiter::new(3, 3), Err(StageError::Invalid(_))));
        assert!(matches!(ReadLimiter::new(4, 3), Err(StageError::Invalid(_))));
        assert!(matches!(ReadLimiter::new(-1, 3), Err(StageError::Invalid(_))));
        assert!(matches!(ReadLimiter::new(0, 0), Err(StageError::Invalid(_))));
        let limiter = ReadLimiter::default();
        assert_eq!((limiter.low_watermark(), limiter.high_watermark()), (100, 300));
    }
}

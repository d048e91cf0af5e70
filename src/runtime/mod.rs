#![forbid(unsafe_code)]
//! Connection job scheduling and read backpressure.
//!
//! Each [`connection::Connection`] owns a job queue. The
//! [`scheduler::ConnectionScheduler`] runs at most one batch of those jobs per
//! connection on a shared [`pool::WorkerPool`], and the
//! [`limiter::ReadLimiter`] watches queue depth through the
//! [`monitor::JobQueueMonitor`] callbacks to pause reading from busy peers.

pub mod connection;
pub mod limiter;
pub mod monitor;
pub mod pool;
pub mod scheduler;

pub use connection::{Connection, ConnectionChannel, Job, QueuedConnection};
pub use limiter::ReadLimiter;
pub use monitor::{JobQueueMetrics, JobQueueMonitor, MonitorAggregate, NoopMonitor};
pub use pool::{Task, WorkerPool};
pub use scheduler::ConnectionScheduler;

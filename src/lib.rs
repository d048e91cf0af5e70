//! Staging primitives for bulk graph imports.
//!
//! The [`input`] module stages nodes and relationships on disk in a compact
//! chunked binary form so single-pass sources can be read several times, and
//! splits relationship streams per type. The [`runtime`] module schedules
//! per-connection job batches on a bounded worker pool with read
//! backpressure.

pub mod config;
pub mod input;
pub mod logging;
pub mod primitives;
pub mod runtime;
pub mod types;
pub mod values;

pub use config::{ConfigError, StageConfig};
pub use input::{
    BadCollector, CachingInputIterable, Collector, EntityKind, EntityRecord, Group, InputCache,
    InputEntity, InputEntityVisitor, PerTypeRelationshipSplitter, TokenDictionary, TokenTable,
};
pub use logging::init_logging;
pub use runtime::{
    Connection, ConnectionChannel, ConnectionScheduler, JobQueueMonitor, QueuedConnection,
    ReadLimiter, WorkerPool,
};
pub use types::{Result, StageError, TokenKind};
pub use values::{Value, ValueKind, ValueTypes};

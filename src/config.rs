//! TOML configuration for the staging pipeline and the connection runtime.
//!
//! Every section and key is optional:
//!
//! ```toml
//! [cache]
//! chunk_size = 1048576
//! directory = "/var/tmp/import"
//!
//! [collector]
//! tolerance = 1000
//! duplicate_nodes = false
//!
//! [scheduler]
//! threads = 8
//!
//! [throttle]
//! low_watermark = 100
//! high_watermark = 300
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::input::cache::{InputCache, DEFAULT_CHUNK_SIZE};
use crate::input::collector::{BadCollector, BAD_RELATIONSHIPS, DUPLICATE_NODES, EXTRA_COLUMNS};
use crate::input::tokens::TokenLimits;
use crate::runtime::limiter::{ReadLimiter, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK};
use crate::runtime::pool::WorkerPool;
use crate::runtime::scheduler::ConnectionScheduler;
use crate::types::StageError;
use crate::values::codec::ValueTypes;

/// Pending scheduler tasks accepted before submissions are rejected.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;
/// Jobs run per connection batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Whole configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// `[cache]`
    pub cache: CacheOptions,
    /// `[tokens]`
    pub tokens: TokenLimits,
    /// `[collector]`
    pub collector: CollectorOptions,
    /// `[scheduler]`
    pub scheduler: SchedulerOptions,
    /// `[throttle]`
    pub throttle: ThrottleOptions,
}

/// Input cache settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Bytes buffered per writer before a chunk is flushed.
    pub chunk_size: usize,
    /// Directory for the staging files; a temporary one when unset.
    pub directory: Option<PathBuf>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            directory: None,
        }
    }
}

/// Bad-entry collector settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorOptions {
    /// Problems tolerated before the import aborts; unlimited when unset.
    pub tolerance: Option<u64>,
    /// Tolerate relationships whose endpoints are missing.
    pub bad_relationships: bool,
    /// Tolerate node ids repeated within a group.
    pub duplicate_nodes: bool,
    /// Tolerate values in undeclared columns.
    pub extra_columns: bool,
    /// Write tolerated problems to the collector output.
    pub log_bad_entries: bool,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            tolerance: None,
            bad_relationships: true,
            duplicate_nodes: true,
            extra_columns: true,
            log_bad_entries: true,
        }
    }
}

impl CollectorOptions {
    /// Category flags for [`BadCollector::new`].
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.bad_relationships {
            flags |= BAD_RELATIONSHIPS;
        }
        if self.duplicate_nodes {
            flags |= DUPLICATE_NODES;
        }
        if self.extra_columns {
            flags |= EXTRA_COLUMNS;
        }
        flags
    }
}

/// Worker pool and batching settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Worker threads.
    pub threads: usize,
    /// Bounded task queue in front of the workers.
    pub queue_size: usize,
    /// Jobs drained per batch.
    pub max_batch_size: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            queue_size: DEFAULT_QUEUE_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

/// Read limiter watermarks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleOptions {
    /// Queue depth at or below which reading resumes.
    pub low_watermark: i64,
    /// Queue depth at which reading pauses.
    pub high_watermark: i64,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
        }
    }
}

/// Failure to load or apply a [`StageConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File path, `<inline>` for strings.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Dotted key, e.g. `throttle.low_watermark`.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// Building a component from valid settings failed.
    #[error(transparent)]
    Stage(#[from] StageError),
}

impl StageConfig {
    /// Reads and validates the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks ranges that deserialization alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                key: "cache.chunk_size",
                reason: "must be positive".into(),
            });
        }
        if self.scheduler.threads == 0 {
            return Err(ConfigError::Invalid {
                key: "scheduler.threads",
                reason: "must be positive".into(),
            });
        }
        if self.scheduler.max_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "scheduler.max_batch_size",
                reason: "must be positive".into(),
            });
        }
        let ThrottleOptions {
            low_watermark: low,
            high_watermark: high,
        } = self.throttle;
        if high <= 0 {
            return Err(ConfigError::Invalid {
                key: "throttle.high_watermark",
                reason: format!("must be positive, got {high}"),
            });
        }
        if low < 0 || low >= high {
            return Err(ConfigError::Invalid {
                key: "throttle.low_watermark",
                reason: format!("must be in 0..{high}, got {low}"),
            });
        }
        Ok(())
    }

    /// Opens an input cache in the configured directory, or a temporary one.
    pub fn input_cache(&self, types: Arc<ValueTypes>) -> Result<InputCache, ConfigError> {
        let cache = match &self.cache.directory {
            Some(dir) => InputCache::new(dir, self.cache.chunk_size, self.tokens, types)?,
            None => InputCache::temporary_with_limits(self.cache.chunk_size, self.tokens, types)?,
        };
        Ok(cache)
    }

    /// Starts a collector writing to `out` when bad entries are logged.
    pub fn collector(&self, out: Box<dyn Write + Send>) -> Result<BadCollector, ConfigError> {
        let out: Box<dyn Write + Send> = if self.collector.log_bad_entries {
            out
        } else {
            Box::new(io::sink())
        };
        Ok(BadCollector::new(
            out,
            self.collector.tolerance,
            self.collector.flags(),
        )?)
    }

    /// Starts a pool named `name` sized by `[scheduler]`.
    pub fn worker_pool(&self, name: &str) -> Result<WorkerPool, ConfigError> {
        Ok(WorkerPool::new(
            name,
            self.scheduler.threads,
            self.scheduler.queue_size,
        )?)
    }

    /// Starts a scheduler over a pool named `name`.
    pub fn scheduler(&self, name: &str) -> Result<ConnectionScheduler, ConfigError> {
        Ok(ConnectionScheduler::new(self.worker_pool(name)?))
    }

    /// Builds a limiter from `[throttle]`.
    pub fn read_limiter(&self) -> Result<ReadLimiter, ConfigError> {
        Ok(ReadLimiter::new(
            self.throttle.low_watermark,
            self.throttle.high_watermark,
        )?)
    }
}

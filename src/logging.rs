//! Process-wide `tracing` subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, StageError};

/// Installs a formatting subscriber filtered by `level`, which accepts any
/// `EnvFilter` directive such as `info` or `graph_stage::input=debug`.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| StageError::invalid(format!("Invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| StageError::invalid("Logging already initialized"))
}

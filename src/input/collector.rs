//! Bad-entry collection with a tolerance.
//!
//! Problems the collector is configured for are counted and, while the
//! count stays within tolerance, handed to a background drain thread that
//! writes one line per problem. The producer never waits on that output:
//! when the drain queue is full the problem goes to the log instead.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::types::{Result, StageError};
use crate::values::Value;

use super::group::Group;

/// Collect relationships referring to missing nodes.
pub const BAD_RELATIONSHIPS: u32 = 0x1;
/// Collect node ids defined more than once in a group.
pub const DUPLICATE_NODES: u32 = 0x2;
/// Collect values in columns missing from the header.
pub const EXTRA_COLUMNS: u32 = 0x4;
/// Every category.
pub const COLLECT_ALL: u32 = BAD_RELATIONSHIPS | DUPLICATE_NODES | EXTRA_COLUMNS;

/// Problems waiting for the drain thread before new ones go to the log.
pub const DRAIN_QUEUE_SIZE: usize = 4096;

/// One data-quality problem, formatted only when written or raised.
#[derive(Clone, Debug)]
pub enum Problem {
    /// A relationship endpoint that resolves to no node.
    BadRelationship {
        /// Start id.
        start_id: Value,
        /// Group of the start id.
        start_group: Group,
        /// Relationship type name.
        rel_type: String,
        /// End id.
        end_id: Value,
        /// Group of the end id.
        end_group: Group,
        /// The endpoint that could not be resolved.
        missing: Value,
    },
    /// A node id seen twice within one group.
    DuplicateNode {
        /// The repeated id.
        id: Value,
        /// Its group.
        group: Group,
    },
    /// A value in a column the header does not declare.
    ExtraColumn {
        /// Source description, typically a file name.
        source: String,
        /// Row number within the source.
        row: u64,
        /// The extra value.
        value: String,
    },
}

impl Problem {
    /// Collection flag of this problem's category.
    pub fn category(&self) -> u32 {
        match self {
            Problem::BadRelationship { .. } => BAD_RELATIONSHIPS,
            Problem::DuplicateNode { .. } => DUPLICATE_NODES,
            Problem::ExtraColumn { .. } => EXTRA_COLUMNS,
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::BadRelationship {
                start_id,
                start_group,
                rel_type,
                end_id,
                end_group,
                missing,
            } => write!(
                f,
                "{start_id} ({start_group})-[{rel_type}]->{end_id} ({end_group}) referring to missing node {missing}"
            ),
            Problem::DuplicateNode { id, group } => {
                write!(f, "Id '{id}' is defined more than once in group '{group}'")
            }
            Problem::ExtraColumn { source, row, value } => write!(
                f,
                "Extra column not present in header on line {row} in {source} with value {value}"
            ),
        }
    }
}

/// Sink for data-quality problems found during an import.
pub trait Collector: Send + Sync {
    /// Reports a relationship whose `missing` endpoint has no node.
    fn collect_bad_relationship(
        &self,
        start_id: &Value,
        start_group: &Group,
        rel_type: &str,
        end_id: &Value,
        end_group: &Group,
        missing: &Value,
    ) -> Result<()>;

    /// Reports a node id defined more than once in `group`.
    fn collect_duplicate_node(&self, id: &Value, group: &Group) -> Result<()>;

    /// Reports an undeclared column value.
    fn collect_extra_columns(&self, source: &str, row: u64, value: &str) -> Result<()>;

    /// Problems collected so far, including one that exceeded the tolerance.
    fn bad_entries(&self) -> u64;

    /// Whether bad relationships are tolerated rather than raised.
    fn is_collecting_bad_relationships(&self) -> bool;

    /// Stops the drain thread after it has written every pending problem.
    fn close(&self) -> Result<()>;
}

type Output = Box<dyn Write + Send>;

struct Drain {
    sender: SyncSender<Problem>,
    handle: JoinHandle<io::Result<()>>,
}

/// [`Collector`] with a shared tolerance across categories.
pub struct BadCollector {
    flags: u32,
    tolerance: Option<u64>,
    count: AtomicU64,
    drain: Mutex<Option<Drain>>,
}

impl BadCollector {
    /// Collects the categories in `flags` up to `tolerance` problems
    /// (`None` for no limit), writing one line per problem to `out`.
    pub fn new(out: Output, tolerance: Option<u64>, flags: u32) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(DRAIN_QUEUE_SIZE);
        let handle = thread::Builder::new()
            .name("bad-entry-drain".into())
            .spawn(move || drain_loop(out, receiver))?;
        Ok(Self {
            flags,
            tolerance,
            count: AtomicU64::new(0),
            drain: Mutex::new(Some(Drain { sender, handle })),
        })
    }

    /// Collects every category but tolerates none.
    pub fn strict(out: Output) -> Result<Self> {
        Self::new(out, Some(0), COLLECT_ALL)
    }

    /// Collects nothing and discards output; every problem is raised.
    pub fn silent() -> Result<Self> {
        Self::new(Box::new(io::sink()), Some(0), 0)
    }

    /// Configured tolerance, `None` when unlimited.
    pub fn tolerance(&self) -> Option<u64> {
        self.tolerance
    }

    fn collect(&self, problem: Problem) -> Result<()> {
        if self.flags & problem.category() == 0 {
            return Err(StageError::BadInput(problem.to_string()));
        }
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(tolerance) = self.tolerance {
            if count > tolerance {
                return Err(StageError::TooManyBadEntries {
                    count,
                    last: problem.to_string(),
                });
            }
        }
        match self.drain.lock().as_ref() {
            Some(drain) => match drain.sender.try_send(problem) {
                Ok(()) => {}
                Err(TrySendError::Full(problem)) => warn!(%problem, "collector.drain_full"),
                Err(TrySendError::Disconnected(problem)) => {
                    warn!(%problem, "collector.drain_gone")
                }
            },
            None => warn!(%problem, "collector.closed"),
        }
        Ok(())
    }
}

fn drain_loop(mut out: Output, receiver: Receiver<Problem>) -> io::Result<()> {
    let mut written = 0u64;
    for problem in receiver {
        writeln!(out, "{problem}")?;
        written += 1;
    }
    out.flush()?;
    debug!(written, "collector.drain.finished");
    Ok(())
}

impl Collector for BadCollector {
    fn collect_bad_relationship(
        &self,
        start_id: &Value,
        start_group: &Group,
        rel_type: &str,
        end_id: &Value,
        end_group: &Group,
        missing: &Value,
    ) -> Result<()> {
        self.collect(Problem::BadRelationship {
            start_id: start_id.clone(),
            start_group: start_group.clone(),
            rel_type: rel_type.to_owned(),
            end_id: end_id.clone(),
            end_group: end_group.clone(),
            missing: missing.clone(),
        })
    }

    fn collect_duplicate_node(&self, id: &Value, group: &Group) -> Result<()> {
        self.collect(Problem::DuplicateNode {
            id: id.clone(),
            group: group.clone(),
        })
    }

    fn collect_extra_columns(&self, source: &str, row: u64, value: &str) -> Result<()> {
        self.collect(Problem::ExtraColumn {
            source: source.to_owned(),
            row,
            value: value.to_owned(),
        })
    }

    fn bad_entries(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    fn is_collecting_bad_relationships(&self) -> bool {
        self.flags & BAD_RELATIONSHIPS != 0
    }

    fn close(&self) -> Result<()> {
        let Some(Drain { sender, handle }) = self.drain.lock().take() else {
            return Ok(());
        };
        drop(sender);
        match handle.join() {
            Ok(result) => result.map_err(StageError::from),
            Err(_) => {
                error!("collector.drain_panicked");
                Err(StageError::invalid("bad-entry drain thread panicked"))
            }
        }
    }
}

impl Drop for BadCollector {
    fn drop(&mut self) {
        if let Err(err) = Collector::close(self) {
            warn!(error = %err, "collector.close_failed");
        }
    }
}

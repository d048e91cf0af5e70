//! Chunked input sources.
//!
//! An [`InputIterable`] hands out [`InputIterator`]s, one per pass. An
//! iterator fills caller-owned chunks, and a chunk emits its entities one at a
//! time onto an [`InputEntityVisitor`]. Chunks are `Send` so callers may fill
//! them under a lock and process them on worker threads.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::types::{Result, StageError};
use crate::values::Value;

use super::entity::{EntityKind, EntityRecord, InputEntity, InputEntityVisitor};
use super::group::Group;

/// A batch of entities owned by one worker at a time.
pub trait InputChunk: Send {
    /// Emits the next entity. Returns `false` once the chunk is exhausted.
    fn next(&mut self, visitor: &mut dyn InputEntityVisitor) -> Result<bool>;
}

/// One pass over a source.
pub trait InputIterator: Send {
    /// Chunk type this iterator fills.
    type Chunk: InputChunk;

    /// Creates an empty chunk for [`InputIterator::next`] to fill.
    fn new_chunk(&self) -> Self::Chunk;

    /// Refills `chunk`. Returns `false` at end of input.
    fn next(&mut self, chunk: &mut Self::Chunk) -> Result<bool>;
}

/// A source that can be iterated once, or many times.
pub trait InputIterable {
    /// Iterator type for one pass.
    type Iter: InputIterator;

    /// Starts a new pass.
    fn iterator(&mut self) -> Result<Self::Iter>;

    /// Whether [`InputIterable::iterator`] may be called more than once.
    fn supports_multiple_passes(&self) -> bool;
}

/// In-memory source over prepared records.
///
/// Counts how many passes were started, which makes it convenient for
/// checking that cached passes leave the original alone.
#[derive(Clone, Debug)]
pub struct ListInput {
    records: Arc<Vec<EntityRecord>>,
    batch_size: usize,
    multiple_passes: bool,
    passes: Arc<AtomicUsize>,
}

impl ListInput {
    /// Creates a source yielding `batch_size` records per chunk.
    pub fn new(records: Vec<EntityRecord>, batch_size: usize, multiple_passes: bool) -> Self {
        Self {
            records: Arc::new(records),
            batch_size: batch_size.max(1),
            multiple_passes,
            passes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of passes started so far.
    pub fn passes(&self) -> usize {
        self.passes.load(Ordering::Acquire)
    }

    /// Records served by every pass.
    pub fn records(&self) -> &[EntityRecord] {
        &self.records
    }
}

impl InputIterable for ListInput {
    type Iter = ListIterator;

    fn iterator(&mut self) -> Result<ListIterator> {
        let started = self.passes.fetch_add(1, Ordering::AcqRel);
        if started > 0 && !self.multiple_passes {
            return Err(StageError::invalid("single-pass input was already iterated"));
        }
        Ok(ListIterator {
            records: Arc::clone(&self.records),
            pos: 0,
            batch_size: self.batch_size,
        })
    }

    fn supports_multiple_passes(&self) -> bool {
        self.multiple_passes
    }
}

/// Iterator over a [`ListInput`].
pub struct ListIterator {
    records: Arc<Vec<EntityRecord>>,
    pos: usize,
    batch_size: usize,
}

impl InputIterator for ListIterator {
    type Chunk = ListChunk;

    fn new_chunk(&self) -> ListChunk {
        ListChunk {
            records: Arc::clone(&self.records),
            range: 0..0,
        }
    }

    fn next(&mut self, chunk: &mut ListChunk) -> Result<bool> {
        if self.pos >= self.records.len() {
            return Ok(false);
        }
        let end = (self.pos + self.batch_size).min(self.records.len());
        chunk.records = Arc::clone(&self.records);
        chunk.range = self.pos..end;
        self.pos = end;
        Ok(true)
    }
}

/// Chunk of a [`ListInput`] pass.
pub struct ListChunk {
    records: Arc<Vec<EntityRecord>>,
    range: Range<usize>,
}

impl InputChunk for ListChunk {
    fn next(&mut self, visitor: &mut dyn InputEntityVisitor) -> Result<bool> {
        let Some(idx) = self.range.next() else {
            return Ok(false);
        };
        self.records[idx].replay(visitor)?;
        Ok(true)
    }
}

/// Drains every chunk of `iter` into `visitor`, returning the entity count.
pub fn drain<I: InputIterator>(iter: &mut I, visitor: &mut dyn InputEntityVisitor) -> Result<u64> {
    let mut chunk = iter.new_chunk();
    let mut count = 0u64;
    while iter.next(&mut chunk)? {
        while chunk.next(visitor)? {
            count += 1;
        }
    }
    Ok(count)
}

/// Visitor collecting every entity of a stream as records.
#[derive(Debug)]
pub struct RecordCollector {
    kind: EntityKind,
    current: InputEntity,
    records: Vec<EntityRecord>,
}

impl RecordCollector {
    /// Collects entities of `kind`.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            current: InputEntity::new(),
            records: Vec::new(),
        }
    }

    /// Records collected so far.
    pub fn into_records(self) -> Vec<EntityRecord> {
        self.records
    }
}

impl InputEntityVisitor for RecordCollector {
    fn property(&mut self, key: &str, value: Value) {
        self.current.property(key, value);
    }

    fn property_id(&mut self, first_property_id: i64) {
        self.current.property_id(first_property_id);
    }

    fn id(&mut self, id: Value, group: &Group) {
        self.current.id(id, group);
    }

    fn labels(&mut self, labels: &[String]) {
        self.current.labels(labels);
    }

    fn label_field(&mut self, label_field: i64) {
        self.current.label_field(label_field);
    }

    fn relationship_id(&mut self, id: i64) {
        self.current.relationship_id(id);
    }

    fn start_id(&mut self, id: Value, group: &Group) {
        self.current.start_id(id, group);
    }

    fn end_id(&mut self, id: Value, group: &Group) {
        self.current.end_id(id, group);
    }

    fn rel_type(&mut self, name: &str) {
        self.current.rel_type(name);
    }

    fn type_id(&mut self, type_id: i32) {
        self.current.type_id(type_id);
    }

    fn end_of_entity(&mut self) -> Result<()> {
        let record = self.current.to_record(self.kind)?;
        self.records.push(record);
        self.current.clear();
        Ok(())
    }
}

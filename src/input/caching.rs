//! Multi-pass wrapper over single-pass sources.
//!
//! The first pass reads the wrapped source and tees every entity into an
//! [`InputCache`] stream while handing it downstream. Later passes read the
//! cache and leave the source alone. Sources that already support multiple
//! passes are passed through untouched.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{Result, StageError};
use crate::values::Value;

use super::cache::{CachedInputChunk, CachedInputIterator, EntityCacher, InputCache, InputCacher};
use super::entity::{EntityKind, InputEntityVisitor};
use super::group::Group;
use super::source::{InputChunk, InputIterable, InputIterator};

/// Where a cached source stands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PassState {
    /// No pass started yet.
    Fresh,
    /// The caching pass is in flight.
    Live,
    /// The cache holds the complete stream.
    Cached,
    /// The caching pass ended before the source was exhausted.
    Abandoned,
}

/// Makes any [`InputIterable`] support multiple passes.
pub struct CachingInputIterable<S> {
    source: S,
    kind: EntityKind,
    cache: Arc<InputCache>,
    subtype: Option<String>,
    state: Arc<Mutex<PassState>>,
}

impl<S: InputIterable> CachingInputIterable<S> {
    /// Wraps `source`, whose entities are of `kind`, caching into the main
    /// stream of `cache` or into the `subtype` bucket when given.
    pub fn new(source: S, kind: EntityKind, cache: Arc<InputCache>, subtype: Option<&str>) -> Self {
        Self {
            source,
            kind,
            cache,
            subtype: subtype.map(str::to_owned),
            state: Arc::new(Mutex::new(PassState::Fresh)),
        }
    }

    /// Current pass state.
    pub fn state(&self) -> PassState {
        *self.state.lock()
    }

    fn cached_pass(&self) -> Result<CachedInputIterator> {
        let subtype = self.subtype.as_deref();
        let mut input = match self.kind {
            EntityKind::Node => self.cache.nodes(subtype, false)?,
            EntityKind::Relationship => self.cache.relationships(subtype, false)?,
        };
        input.iterator()
    }

    fn caching_pass(&mut self) -> Result<CachingPass<S::Iter>> {
        let subtype = self.subtype.as_deref();
        let cacher = match self.kind {
            EntityKind::Node => self.cache.cache_nodes(subtype)?,
            EntityKind::Relationship => self.cache.cache_relationships(subtype)?,
        };
        let inner = self.source.iterator()?;
        debug!(kind = ?self.kind, "input_cache.caching_pass.start");
        Ok(CachingPass {
            inner,
            cacher,
            state: Arc::clone(&self.state),
            exhausted: false,
            completed: false,
        })
    }
}

impl<S: InputIterable> InputIterable for CachingInputIterable<S> {
    type Iter = CachingInputIterator<S::Iter>;

    fn iterator(&mut self) -> Result<Self::Iter> {
        if self.source.supports_multiple_passes() {
            return Ok(CachingInputIterator::Passthrough(self.source.iterator()?));
        }
        let state = *self.state.lock();
        match state {
            PassState::Fresh => {
                let pass = self.caching_pass()?;
                *self.state.lock() = PassState::Live;
                Ok(CachingInputIterator::Caching(pass))
            }
            PassState::Cached => Ok(CachingInputIterator::Cached(self.cached_pass()?)),
            PassState::Live => Err(StageError::invalid(
                "the caching pass is still in progress",
            )),
            PassState::Abandoned => Err(StageError::invalid(
                "the caching pass was abandoned before the end of input",
            )),
        }
    }

    fn supports_multiple_passes(&self) -> bool {
        true
    }
}

/// Iterator of a [`CachingInputIterable`] pass.
pub enum CachingInputIterator<I: InputIterator> {
    /// The source handles multiple passes itself.
    Passthrough(I),
    /// First pass, writing the cache.
    Caching(CachingPass<I>),
    /// Any later pass, reading the cache.
    Cached(CachedInputIterator),
}

/// Chunk of a [`CachingInputIterator`].
pub enum CachingInputChunk<C> {
    /// See [`CachingInputIterator::Passthrough`].
    Passthrough(C),
    /// See [`CachingInputIterator::Caching`].
    Caching(CachingChunk<C>),
    /// See [`CachingInputIterator::Cached`].
    Cached(CachedInputChunk),
}

impl<I: InputIterator> InputIterator for CachingInputIterator<I> {
    type Chunk = CachingInputChunk<I::Chunk>;

    fn new_chunk(&self) -> Self::Chunk {
        match self {
            CachingInputIterator::Passthrough(it) => CachingInputChunk::Passthrough(it.new_chunk()),
            CachingInputIterator::Caching(pass) => CachingInputChunk::Caching(CachingChunk {
                inner: pass.inner.new_chunk(),
                writer: Some(pass.cacher.writer()),
            }),
            CachingInputIterator::Cached(it) => CachingInputChunk::Cached(it.new_chunk()),
        }
    }

    fn next(&mut self, chunk: &mut Self::Chunk) -> Result<bool> {
        match (self, chunk) {
            (CachingInputIterator::Passthrough(it), CachingInputChunk::Passthrough(c)) => it.next(c),
            (CachingInputIterator::Caching(pass), CachingInputChunk::Caching(c)) => pass.next(c),
            (CachingInputIterator::Cached(it), CachingInputChunk::Cached(c)) => it.next(c),
            _ => Err(StageError::invalid("chunk belongs to a different pass")),
        }
    }
}

impl<C: InputChunk> InputChunk for CachingInputChunk<C> {
    fn next(&mut self, visitor: &mut dyn InputEntityVisitor) -> Result<bool> {
        match self {
            CachingInputChunk::Passthrough(c) => c.next(visitor),
            CachingInputChunk::Caching(c) => c.next(visitor),
            CachingInputChunk::Cached(c) => c.next(visitor),
        }
    }
}

/// The live pass: reads the source and fills the cache.
pub struct CachingPass<I> {
    inner: I,
    cacher: InputCacher,
    state: Arc<Mutex<PassState>>,
    exhausted: bool,
    completed: bool,
}

impl<I: InputIterator> CachingPass<I> {
    fn next(&mut self, chunk: &mut CachingChunk<I::Chunk>) -> Result<bool> {
        if self.inner.next(&mut chunk.inner)? {
            return Ok(true);
        }
        self.exhausted = true;
        if let Some(writer) = chunk.writer.take() {
            writer.close()?;
        }
        self.try_complete()?;
        Ok(false)
    }

    /// Seals the cache once the source is exhausted and every chunk writer
    /// has been released.
    fn try_complete(&mut self) -> Result<()> {
        if self.completed || !self.exhausted || self.cacher.open_writers() > 0 {
            return Ok(());
        }
        self.cacher.close()?;
        self.completed = true;
        *self.state.lock() = PassState::Cached;
        debug!(
            entities = self.cacher.entities(),
            chunks = self.cacher.chunks(),
            "input_cache.caching_pass.complete"
        );
        Ok(())
    }
}

impl<I> Drop for CachingPass<I> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if self.exhausted && self.cacher.open_writers() == 0 {
            match self.cacher.close() {
                Ok(()) => {
                    *self.state.lock() = PassState::Cached;
                    return;
                }
                Err(err) => warn!(error = %err, "input_cache.caching_pass.close_failed"),
            }
        }
        warn!(
            exhausted = self.exhausted,
            "input_cache.caching_pass.abandoned"
        );
        *self.state.lock() = PassState::Abandoned;
    }
}

/// Chunk of the live pass; tees every entity into its own cache writer.
pub struct CachingChunk<C> {
    inner: C,
    writer: Option<EntityCacher>,
}

impl<C: InputChunk> CachingChunk<C> {
    fn next(&mut self, visitor: &mut dyn InputEntityVisitor) -> Result<bool> {
        match self.writer.as_mut() {
            Some(cache) => self.inner.next(&mut Tee {
                downstream: visitor,
                cache,
            }),
            None => self.inner.next(visitor),
        }
    }
}

struct Tee<'a> {
    downstream: &'a mut dyn InputEntityVisitor,
    cache: &'a mut EntityCacher,
}

impl InputEntityVisitor for Tee<'_> {
    fn property(&mut self, key: &str, value: Value) {
        self.cache.property(key, value.clone());
        self.downstream.property(key, value);
    }

    fn property_id(&mut self, first_property_id: i64) {
        self.cache.property_id(first_property_id);
        self.downstream.property_id(first_property_id);
    }

    fn id(&mut self, id: Value, group: &Group) {
        self.cache.id(id.clone(), group);
        self.downstream.id(id, group);
    }

    fn labels(&mut self, labels: &[String]) {
        self.cache.labels(labels);
        self.downstream.labels(labels);
    }

    fn label_field(&mut self, label_field: i64) {
        self.cache.label_field(label_field);
        self.downstream.label_field(label_field);
    }

    fn relationship_id(&mut self, id: i64) {
        self.cache.relationship_id(id);
        self.downstream.relationship_id(id);
    }

    fn start_id(&mut self, id: Value, group: &Group) {
        self.cache.start_id(id.clone(), group);
        self.downstream.start_id(id, group);
    }

    fn end_id(&mut self, id: Value, group: &Group) {
        self.cache.end_id(id.clone(), group);
        self.downstream.end_id(id, group);
    }

    fn rel_type(&mut self, name: &str) {
        self.cache.rel_type(name);
        self.downstream.rel_type(name);
    }

    fn type_id(&mut self, type_id: i32) {
        self.cache.type_id(type_id);
        self.downstream.type_id(type_id);
    }

    fn end_of_entity(&mut self) -> Result<()> {
        self.cache.end_of_entity()?;
        self.downstream.end_of_entity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::entity::{EntityRecord, RelType, RelationshipRecord, Properties};
    use crate::input::source::{drain, ListInput, RecordCollector};
    use crate::values::ValueTypes;

    fn rel(i: i64) -> EntityRecord {
        EntityRecord::Relationship(RelationshipRecord {
            properties: Properties::Inline(vec![("w".into(), Value::Double(i as f64))]),
            id: None,
            start_id: Value::Long(i),
            start_group: Group::global(),
            end_id: Value::Long(i + 1),
            end_group: Group::global(),
            rel_type: RelType::Name(if i % 3 == 0 { "A" } else { "B" }.into()),
        })
    }

    fn pass<S: InputIterable>(iterable: &mut S) -> Result<Vec<EntityRecord>> {
        let mut iter = iterable.iterator()?;
        let mut out = RecordCollector::new(EntityKind::Relationship);
        drain(&mut iter, &mut out)?;
        Ok(out.into_records())
    }

    #[test]
    fn multi_pass_source_is_passed_through() {
        let cache = Arc::new(InputCache::temporary(64, Arc::new(ValueTypes::new())).unwrap());
        let source = ListInput::new((0..5).map(rel).collect(), 2, true);
        let mut caching =
            CachingInputIterable::new(source.clone(), EntityKind::Relationship, cache.clone(), None);
        assert_eq!(pass(&mut caching).unwrap().len(), 5);
        assert_eq!(pass(&mut caching).unwrap().len(), 5);
        assert_eq!(source.passes(), 2);
        assert!(cache.files().is_empty());
        assert_eq!(caching.state(), PassState::Fresh);
    }

    #[test]
    fn second_pass_reads_cache() {
        let cache = Arc::new(InputCache::temporary(64, Arc::new(ValueTypes::new())).unwrap());
        let records: Vec<_> = (0..50).map(rel).collect();
        let source = ListInput::new(records.clone(), 7, false);
        let mut caching =
            CachingInputIterable::new(source.clone(), EntityKind::Relationship, cache, None);
        assert_eq!(pass(&mut caching).unwrap(), records);
        assert_eq!(caching.state(), PassState::Cached);
        assert_eq!(pass(&mut caching).unwrap(), records);
        assert_eq!(pass(&mut caching).unwrap(), records);
        assert_eq!(source.passes(), 1);
    }

    #[test]
    fn concurrent_live_pass_is_rejected() {
        let cache = Arc::new(InputCache::temporary(64, Arc::new(ValueTypes::new())).unwrap());
        let source = ListInput::new((0..3).map(rel).collect(), 1, false);
        let mut caching = CachingInputIterable::new(source, EntityKind::Relationship, cache, None);
        let first = caching.iterator().unwrap();
        assert_eq!(caching.state(), PassState::Live);
        assert!(matches!(caching.iterator(), Err(StageError::Invalid(_))));
        drop(first);
        assert_eq!(caching.state(), PassState::Abandoned);
        assert!(caching.iterator().is_err());
    }
}

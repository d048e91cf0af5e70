//! Splits one relationship stream into one pass per relationship type.
//!
//! The first listed type is served straight from the source with a filter;
//! relationships of every other listed type are written to a per-type bucket
//! during that same scan. Each later type then reads (and deletes) its bucket.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::types::{Result, StageError};
use crate::values::Value;

use super::cache::{CachedInputChunk, CachedInputIterator, EntityCacher, InputCache, InputCacher};
use super::entity::{EntityKind, InputEntity, InputEntityVisitor};
use super::group::Group;
use super::source::{InputChunk, InputIterable, InputIterator};

/// A relationship type as it appears in the input: by name or by token id.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum TypeKey {
    /// Type name.
    Name(String),
    /// Type token id.
    Id(i32),
}

impl TypeKey {
    fn of(entity: &InputEntity) -> Option<TypeKey> {
        match (entity.rel_type_name(), entity.rel_type_id()) {
            (Some(name), _) => Some(TypeKey::Name(name.to_owned())),
            (None, Some(id)) => Some(TypeKey::Id(id)),
            (None, None) => None,
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKey::Name(name) => write!(f, "'{name}'"),
            TypeKey::Id(id) => write!(f, "#{id}"),
        }
    }
}

impl From<&str> for TypeKey {
    fn from(name: &str) -> Self {
        TypeKey::Name(name.to_owned())
    }
}

impl From<i32> for TypeKey {
    fn from(id: i32) -> Self {
        TypeKey::Id(id)
    }
}

fn bucket_name(index: usize) -> String {
    format!("type-{index}")
}

/// Hands out one relationship pass per type, in caller order.
pub struct PerTypeRelationshipSplitter<S: InputIterator> {
    source: Option<S>,
    types: Arc<Vec<TypeKey>>,
    cache: Arc<InputCache>,
    buckets: Vec<InputCacher>,
    position: usize,
}

impl<S: InputIterator> PerTypeRelationshipSplitter<S> {
    /// Splits the pass `source` over `types`. Types must be distinct.
    pub fn new(source: S, types: Vec<TypeKey>, cache: Arc<InputCache>) -> Result<Self> {
        for (i, key) in types.iter().enumerate() {
            if types[..i].contains(key) {
                return Err(StageError::invalid(format!("relationship type {key} listed twice")));
            }
        }
        Ok(Self {
            source: Some(source),
            types: Arc::new(types),
            cache,
            buckets: Vec::new(),
            position: 0,
        })
    }

    /// Convenience for splitting a fresh pass of `iterable`.
    pub fn from_iterable<T>(iterable: &mut T, types: Vec<TypeKey>, cache: Arc<InputCache>) -> Result<Self>
    where
        T: InputIterable<Iter = S>,
    {
        Self::new(iterable.iterator()?, types, cache)
    }

    /// Whether another type is left.
    pub fn has_next(&self) -> bool {
        self.position < self.types.len()
    }

    /// Type the next call to [`PerTypeRelationshipSplitter::next_type`] serves.
    pub fn current_type(&self) -> Option<&TypeKey> {
        self.types.get(self.position)
    }

    /// Pass over the next type, or `None` when every type was served.
    ///
    /// Every type after the first requires the first pass to have run to the
    /// end, since that pass fills the buckets.
    pub fn next_type(&mut self) -> Result<Option<(TypeKey, PerTypeIterator<S>)>> {
        let Some(key) = self.types.get(self.position).cloned() else {
            return Ok(None);
        };
        let index = self.position;
        let iter = if index == 0 {
            self.first_pass()?
        } else {
            let bucket = &self.buckets[index - 1];
            if !bucket.is_closed() {
                return Err(StageError::invalid(format!(
                    "relationship type {} was not fully read before requesting {key}",
                    self.types[0]
                )));
            }
            let mut input = self.cache.relationships(Some(bucket_name(index).as_str()), true)?;
            PerTypeIterator::Bucket(input.iterator()?)
        };
        self.position += 1;
        debug!(%key, index, "input_cache.split.next_type");
        Ok(Some((key, iter)))
    }

    fn first_pass(&mut self) -> Result<PerTypeIterator<S>> {
        let Some(source) = self.source.take() else {
            return Err(StageError::invalid("splitter source already consumed"));
        };
        let mut buckets = Vec::with_capacity(self.types.len().saturating_sub(1));
        for index in 1..self.types.len() {
            buckets.push(self.cache.cache_relationships(Some(bucket_name(index).as_str()))?);
        }
        self.buckets = buckets.clone();
        Ok(PerTypeIterator::Filtering(FilteringPass {
            inner: source,
            types: Arc::clone(&self.types),
            buckets,
        }))
    }
}

/// Pass over one relationship type.
pub enum PerTypeIterator<S: InputIterator> {
    /// First type, filtered from the source while filling the buckets.
    Filtering(FilteringPass<S>),
    /// Any later type, read back from its bucket.
    Bucket(CachedInputIterator),
}

/// Chunk of a [`PerTypeIterator`].
pub enum PerTypeChunk<C> {
    /// See [`PerTypeIterator::Filtering`].
    Filtering(FilteringChunk<C>),
    /// See [`PerTypeIterator::Bucket`].
    Bucket(CachedInputChunk),
}

impl<S: InputIterator> InputIterator for PerTypeIterator<S> {
    type Chunk = PerTypeChunk<S::Chunk>;

    fn new_chunk(&self) -> Self::Chunk {
        match self {
            PerTypeIterator::Filtering(pass) => PerTypeChunk::Filtering(FilteringChunk {
                inner: pass.inner.new_chunk(),
                types: Arc::clone(&pass.types),
                writers: pass.buckets.iter().map(InputCacher::writer).collect(),
                entity: InputEntity::new(),
            }),
            PerTypeIterator::Bucket(it) => PerTypeChunk::Bucket(it.new_chunk()),
        }
    }

    fn next(&mut self, chunk: &mut Self::Chunk) -> Result<bool> {
        match (self, chunk) {
            (PerTypeIterator::Filtering(pass), PerTypeChunk::Filtering(c)) => pass.next(c),
            (PerTypeIterator::Bucket(it), PerTypeChunk::Bucket(c)) => it.next(c),
            _ => Err(StageError::invalid("chunk belongs to a different pass")),
        }
    }
}

impl<C: InputChunk> InputChunk for PerTypeChunk<C> {
    fn next(&mut self, visitor: &mut dyn InputEntityVisitor) -> Result<bool> {
        match self {
            PerTypeChunk::Filtering(c) => c.next(visitor),
            PerTypeChunk::Bucket(c) => c.next(visitor),
        }
    }
}

/// First-type pass over the source.
pub struct FilteringPass<S> {
    inner: S,
    types: Arc<Vec<TypeKey>>,
    buckets: Vec<InputCacher>,
}

impl<S: InputIterator> FilteringPass<S> {
    fn next(&mut self, chunk: &mut FilteringChunk<S::Chunk>) -> Result<bool> {
        if self.inner.next(&mut chunk.inner)? {
            return Ok(true);
        }
        for writer in chunk.writers.drain(..) {
            writer.close()?;
        }
        if self.buckets.iter().all(|b| b.open_writers() == 0) {
            for bucket in &self.buckets {
                bucket.close()?;
            }
        }
        Ok(false)
    }
}

/// Chunk of the first-type pass.
pub struct FilteringChunk<C> {
    inner: C,
    types: Arc<Vec<TypeKey>>,
    writers: Vec<EntityCacher>,
    entity: InputEntity,
}

impl<C: InputChunk> FilteringChunk<C> {
    fn next(&mut self, visitor: &mut dyn InputEntityVisitor) -> Result<bool> {
        loop {
            let mut split = Split {
                entity: &mut self.entity,
                types: &self.types,
                writers: &mut self.writers,
                downstream: &mut *visitor,
                forwarded: false,
            };
            if !self.inner.next(&mut split)? {
                return Ok(false);
            }
            if split.forwarded {
                return Ok(true);
            }
        }
    }
}

/// Collects one relationship, then routes it downstream or to its bucket.
struct Split<'a> {
    entity: &'a mut InputEntity,
    types: &'a [TypeKey],
    writers: &'a mut Vec<EntityCacher>,
    downstream: &'a mut dyn InputEntityVisitor,
    forwarded: bool,
}

impl InputEntityVisitor for Split<'_> {
    fn property(&mut self, key: &str, value: Value) {
        self.entity.property(key, value);
    }

    fn property_id(&mut self, first_property_id: i64) {
        self.entity.property_id(first_property_id);
    }

    fn relationship_id(&mut self, id: i64) {
        self.entity.relationship_id(id);
    }

    fn start_id(&mut self, id: Value, group: &Group) {
        self.entity.start_id(id, group);
    }

    fn end_id(&mut self, id: Value, group: &Group) {
        self.entity.end_id(id, group);
    }

    fn rel_type(&mut self, name: &str) {
        self.entity.rel_type(name);
    }

    fn type_id(&mut self, type_id: i32) {
        self.entity.type_id(type_id);
    }

    fn end_of_entity(&mut self) -> Result<()> {
        let key = TypeKey::of(&*self.entity);
        let record = self.entity.to_record(EntityKind::Relationship);
        self.entity.clear();
        let record = record?;
        let index = key
            .as_ref()
            .and_then(|k| self.types.iter().position(|t| t == k));
        match index {
            Some(0) => {
                self.forwarded = true;
                record.replay(&mut *self.downstream)
            }
            Some(i) => {
                // Writers are taken once the source is exhausted.
                let Some(writer) = self.writers.get_mut(i - 1) else {
                    return Err(StageError::invalid("split pass already finished"));
                };
                writer.write_record(&record)
            }
            None => Err(StageError::invalid(format!(
                "relationship type {} is not among the split types",
                key.map_or_else(|| "<none>".to_owned(), |k| k.to_string())
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::entity::{EntityRecord, Properties, RelType, RelationshipRecord};
    use crate::input::source::{drain, ListInput, RecordCollector};
    use crate::values::ValueTypes;

    fn rel(i: i64, rel_type: RelType) -> EntityRecord {
        EntityRecord::Relationship(RelationshipRecord {
            properties: Properties::Inline(vec![("i".into(), Value::Long(i))]),
            id: Some(i),
            start_id: Value::Long(i),
            start_group: Group::global(),
            end_id: Value::Long(i * 2),
            end_group: Group::global(),
            rel_type,
        })
    }

    fn collect<S: InputIterator>(mut iter: PerTypeIterator<S>) -> Vec<EntityRecord> {
        let mut out = RecordCollector::new(EntityKind::Relationship);
        drain(&mut iter, &mut out).unwrap();
        out.into_records()
    }

    #[test]
    fn splits_by_type_in_caller_order() {
        let cache = Arc::new(InputCache::temporary(128, Arc::new(ValueTypes::new())).unwrap());
        let types = ["A", "B", "C"];
        let records: Vec<_> = (0..30)
            .map(|i| rel(i, RelType::Name(types[(i % 3) as usize].into())))
            .collect();
        let mut source = ListInput::new(records.clone(), 4, false);
        let keys = vec![TypeKey::from("B"), TypeKey::from("A"), TypeKey::from("C")];
        let mut splitter =
            PerTypeRelationshipSplitter::from_iterable(&mut source, keys.clone(), cache.clone())
                .unwrap();

        let mut seen = Vec::new();
        while let Some((key, iter)) = splitter.next_type().unwrap() {
            let got = collect(iter);
            let expected: Vec<_> = records
                .iter()
                .filter(|r| match r {
                    EntityRecord::Relationship(rel) => {
                        matches!(&rel.rel_type, RelType::Name(n) if TypeKey::from(n.as_str()) == key)
                    }
                    _ => false,
                })
                .cloned()
                .collect();
            assert_eq!(got, expected);
            seen.push(key);
        }
        assert_eq!(seen, keys);
        assert!(!splitter.has_next());
        assert_eq!(source.passes(), 1);
        // Buckets are one-shot and gone once read.
        for index in 1..3 {
            let (data, _) = cache
                .paths(EntityKind::Relationship, Some(bucket_name(index).as_str()))
                .unwrap();
            assert!(!data.exists());
        }
    }

    #[test]
    fn type_ids_split_too() {
        let cache = Arc::new(InputCache::temporary(128, Arc::new(ValueTypes::new())).unwrap());
        let records = vec![rel(1, RelType::Id(7)), rel(2, RelType::Id(9)), rel(3, RelType::Id(7))];
        let mut source = ListInput::new(records, 2, false);
        let mut splitter = PerTypeRelationshipSplitter::from_iterable(
            &mut source,
            vec![TypeKey::Id(9), TypeKey::Id(7)],
            cache,
        )
        .unwrap();
        let (_, first) = splitter.next_type().unwrap().unwrap();
        assert_eq!(collect(first).len(), 1);
        let (_, second) = splitter.next_type().unwrap().unwrap();
        assert_eq!(collect(second).len(), 2);
        assert!(splitter.next_type().unwrap().is_none());
    }

    #[test]
    fn unknown_type_is_an_error() {
        let cache = Arc::new(InputCache::temporary(128, Arc::new(ValueTypes::new())).unwrap());
        let records = vec![rel(1, RelType::Name("X".into()))];
        let mut source = ListInput::new(records, 2, false);
        let mut splitter =
            PerTypeRelationshipSplitter::from_iterable(&mut source, vec!["A".into()], cache)
                .unwrap();
        let (_, mut iter) = splitter.next_type().unwrap().unwrap();
        let mut out = RecordCollector::new(EntityKind::Relationship);
        let err = drain(&mut iter, &mut out).unwrap_err();
        assert!(err.to_string().contains("'X'"));
    }

    #[test]
    fn later_type_requires_finished_first_pass() {
        let cache = Arc::new(InputCache::temporary(128, Arc::new(ValueTypes::new())).unwrap());
        let records = vec![rel(1, RelType::Name("A".into()))];
        let mut source = ListInput::new(records, 2, false);
        let mut splitter = PerTypeRelationshipSplitter::from_iterable(
            &mut source,
            vec!["A".into(), "B".into()],
            cache,
        )
        .unwrap();
        let (_, _first) = splitter.next_type().unwrap().unwrap();
        assert!(matches!(splitter.next_type(), Err(StageError::Invalid(_))));
    }

    #[test]
    fn duplicate_types_are_rejected() {
        let cache = Arc::new(InputCache::temporary(128, Arc::new(ValueTypes::new())).unwrap());
        let source = ListInput::new(vec![], 1, true).iterator().unwrap();
        assert!(PerTypeRelationshipSplitter::new(source, vec!["A".into(), "A".into()], cache).is_err());
    }
}

//! On-disk staging of node and relationship streams.
//!
//! Every stream is a pair of files: the data file holding length-prefixed
//! chunks and the header file holding the tokens those chunks reference.
//! The main pairs are `input-nodes`/`input-nodes-header` and
//! `input-relationships`/`input-relationships-header`; subtype buckets
//! append `-<subtype>` to the stem.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::primitives::bytes::{ByteBuffer, ChunkCursor, ReadableChannel, WritableChannel};
use crate::primitives::io::{remove_if_exists, FileReadChannel, FileWriteChannel};
use crate::types::{Result, StageError};
use crate::values::{Value, ValueTypes};

use super::entity::{EntityKind, EntityRecord, InputEntity, InputEntityVisitor};
use super::group::Group;
use super::ser::{read_entity, write_entity, DiffState, END_OF_ENTITIES};
use super::source::{InputChunk, InputIterable, InputIterator};
use super::tokens::{TokenDictionary, TokenLimits, TokenTable};

/// Default flush threshold of an entity writer's buffer.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

const NODES: &str = "input-nodes";
const RELATIONSHIPS: &str = "input-relationships";
const HEADER_SUFFIX: &str = "-header";

fn stem(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Node => NODES,
        EntityKind::Relationship => RELATIONSHIPS,
    }
}

/// Creates and reads back the staging files of one import run.
///
/// Every file created through this cache is removed by [`InputCache::close`]
/// or, failing that, when the cache is dropped.
pub struct InputCache {
    dir: PathBuf,
    chunk_size: usize,
    limits: TokenLimits,
    types: Arc<ValueTypes>,
    created: Mutex<BTreeSet<PathBuf>>,
    closed: AtomicBool,
    _temp: Option<TempDir>,
}

impl InputCache {
    /// Uses `dir` (created if missing) for the staging files.
    pub fn new(
        dir: impl Into<PathBuf>,
        chunk_size: usize,
        limits: TokenLimits,
        types: Arc<ValueTypes>,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Self::build(dir, None, chunk_size, limits, types)
    }

    /// Uses a fresh temporary directory removed together with the cache.
    pub fn temporary(chunk_size: usize, types: Arc<ValueTypes>) -> Result<Self> {
        Self::temporary_with_limits(chunk_size, TokenLimits::default(), types)
    }

    /// Like [`InputCache::temporary`], with explicit token limits.
    pub fn temporary_with_limits(
        chunk_size: usize,
        limits: TokenLimits,
        types: Arc<ValueTypes>,
    ) -> Result<Self> {
        let temp = tempfile::Builder::new().prefix("input-cache").tempdir()?;
        let dir = temp.path().to_path_buf();
        Self::build(dir, Some(temp), chunk_size, limits, types)
    }

    fn build(
        dir: PathBuf,
        temp: Option<TempDir>,
        chunk_size: usize,
        limits: TokenLimits,
        types: Arc<ValueTypes>,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(StageError::invalid("chunk size must be positive"));
        }
        debug!(dir = %dir.display(), chunk_size, "input_cache.open");
        Ok(Self {
            dir,
            chunk_size,
            limits,
            types,
            created: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
            _temp: temp,
        })
    }

    /// Directory holding the staging files.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Value registry shared by every writer and reader of this cache.
    pub fn value_types(&self) -> &Arc<ValueTypes> {
        &self.types
    }

    /// Files created so far and not yet removed by [`InputCache::close`].
    pub fn files(&self) -> Vec<PathBuf> {
        self.created.lock().iter().cloned().collect()
    }

    /// Data and header paths of a stream.
    pub fn paths(&self, kind: EntityKind, subtype: Option<&str>) -> Result<(PathBuf, PathBuf)> {
        let mut name = stem(kind).to_owned();
        if let Some(subtype) = subtype {
            let is_separator = |c: char| c == '/' || c == '\\';
            if subtype.is_empty() || subtype.contains(is_separator) || subtype.starts_with('.') {
                return Err(StageError::invalid(format!("invalid cache subtype '{subtype}'")));
            }
            name.push('-');
            name.push_str(subtype);
        }
        let header = format!("{name}{HEADER_SUFFIX}");
        Ok((self.dir.join(name), self.dir.join(header)))
    }

    /// Starts writing the node stream (or one of its buckets).
    pub fn cache_nodes(&self, subtype: Option<&str>) -> Result<InputCacher> {
        self.cacher(EntityKind::Node, subtype)
    }

    /// Starts writing the relationship stream (or one of its buckets).
    pub fn cache_relationships(&self, subtype: Option<&str>) -> Result<InputCacher> {
        self.cacher(EntityKind::Relationship, subtype)
    }

    /// Reads back a node stream. With `delete_after_use` the files are
    /// removed as soon as one pass reaches the end.
    pub fn nodes(&self, subtype: Option<&str>, delete_after_use: bool) -> Result<CachedInput> {
        self.input(EntityKind::Node, subtype, delete_after_use)
    }

    /// Reads back a relationship stream.
    pub fn relationships(
        &self,
        subtype: Option<&str>,
        delete_after_use: bool,
    ) -> Result<CachedInput> {
        self.input(EntityKind::Relationship, subtype, delete_after_use)
    }

    fn cacher(&self, kind: EntityKind, subtype: Option<&str>) -> Result<InputCacher> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StageError::invalid("input cache is closed"));
        }
        let (data_path, header_path) = self.paths(kind, subtype)?;
        {
            let mut created = self.created.lock();
            created.insert(data_path.clone());
            created.insert(header_path.clone());
        }
        let data = FileWriteChannel::create(&data_path)?;
        let header = FileWriteChannel::create(&header_path)?;
        debug!(path = %data_path.display(), ?kind, "input_cache.cacher.create");
        Ok(InputCacher {
            shared: Arc::new(CacherShared {
                kind,
                chunk_size: self.chunk_size,
                types: Arc::clone(&self.types),
                tokens: TokenDictionary::new(header, self.limits),
                data: Mutex::new(Some(data)),
                open_writers: AtomicUsize::new(0),
                chunks: AtomicU64::new(0),
                entities: AtomicU64::new(0),
            }),
        })
    }

    fn input(
        &self,
        kind: EntityKind,
        subtype: Option<&str>,
        delete_after_use: bool,
    ) -> Result<CachedInput> {
        let (data_path, header_path) = self.paths(kind, subtype)?;
        if !data_path.exists() || !header_path.exists() {
            return Err(StageError::invalid(format!(
                "no cached stream at {}",
                data_path.display()
            )));
        }
        Ok(CachedInput {
            kind,
            data_path,
            header_path,
            types: Arc::clone(&self.types),
            delete_after_use,
            passes: 0,
        })
    }

    /// Removes every file this cache created. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let files = std::mem::take(&mut *self.created.lock());
        let mut first_err = None;
        for path in &files {
            match remove_if_exists(path) {
                Ok(_) => debug!(path = %path.display(), "input_cache.remove"),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "input_cache.remove_failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl Drop for InputCache {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "input_cache.drop_cleanup_failed");
        }
    }
}

struct CacherShared {
    kind: EntityKind,
    chunk_size: usize,
    types: Arc<ValueTypes>,
    tokens: TokenDictionary<FileWriteChannel>,
    data: Mutex<Option<FileWriteChannel>>,
    open_writers: AtomicUsize,
    chunks: AtomicU64,
    entities: AtomicU64,
}

impl CacherShared {
    fn append_chunk(&self, chunk: &[u8], entities: u64) -> Result<()> {
        let len = i32::try_from(chunk.len())
            .map_err(|_| StageError::invalid(format!("chunk of {} bytes", chunk.len())))?;
        let mut data = self.data.lock();
        let Some(channel) = data.as_mut() else {
            return Err(StageError::invalid("input cacher is closed"));
        };
        channel.put_i32(len)?;
        channel.put_bytes(chunk)?;
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.entities.fetch_add(entities, Ordering::Relaxed);
        Ok(())
    }
}

/// Write side of one cached stream.
///
/// Cloning hands out another handle to the same stream.
#[derive(Clone)]
pub struct InputCacher {
    shared: Arc<CacherShared>,
}

impl InputCacher {
    /// Entity kind of this stream.
    pub fn kind(&self) -> EntityKind {
        self.shared.kind
    }

    /// New writer with a private buffer, meant for one thread.
    pub fn writer(&self) -> EntityCacher {
        self.shared.open_writers.fetch_add(1, Ordering::AcqRel);
        EntityCacher {
            shared: Arc::clone(&self.shared),
            entity: InputEntity::new(),
            buffer: ByteBuffer::with_capacity(self.shared.chunk_size.min(DEFAULT_CHUNK_SIZE) + 64),
            state: DiffState::new(),
            pending: 0,
            closed: false,
        }
    }

    /// Writers handed out and not yet closed or dropped.
    pub fn open_writers(&self) -> usize {
        self.shared.open_writers.load(Ordering::Acquire)
    }

    /// Chunks appended so far.
    pub fn chunks(&self) -> u64 {
        self.shared.chunks.load(Ordering::Relaxed)
    }

    /// Entities appended so far.
    pub fn entities(&self) -> u64 {
        self.shared.entities.load(Ordering::Relaxed)
    }

    /// Returns true once [`InputCacher::close`] succeeded.
    pub fn is_closed(&self) -> bool {
        self.shared.data.lock().is_none()
    }

    /// Terminates the data and header files. Fails while writers are open.
    pub fn close(&self) -> Result<()> {
        let open = self.open_writers();
        if open > 0 {
            return Err(StageError::invalid(format!(
                "{open} entity writers still open"
            )));
        }
        let mut data = self.shared.data.lock();
        let Some(mut channel) = data.take() else {
            return Ok(());
        };
        channel.put_i32(0)?;
        let path = channel.path().to_path_buf();
        channel.close()?;
        self.shared.tokens.finish()?;
        debug!(
            path = %path.display(),
            chunks = self.chunks(),
            entities = self.entities(),
            "input_cache.cacher.close"
        );
        Ok(())
    }
}

/// Per-thread entity writer; an [`InputEntityVisitor`] that serializes every
/// visited entity into its own buffer and appends full chunks to the stream.
pub struct EntityCacher {
    shared: Arc<CacherShared>,
    entity: InputEntity,
    buffer: ByteBuffer,
    state: DiffState,
    pending: u64,
    closed: bool,
}

impl EntityCacher {
    /// Serializes one complete record.
    ///
    /// A record that fails halfway leaves no bytes behind. The entities
    /// already buffered go out as their own chunk so the diff state can
    /// start over.
    pub fn write_record(&mut self, record: &EntityRecord) -> Result<()> {
        if record.kind() != self.shared.kind {
            return Err(StageError::invalid(format!(
                "{:?} written to a {:?} stream",
                record.kind(),
                self.shared.kind
            )));
        }
        let mark = self.buffer.len();
        if let Err(err) = write_entity(
            record,
            &mut self.state,
            &self.shared.tokens,
            &self.shared.types,
            &mut self.buffer,
        ) {
            self.buffer.truncate(mark);
            if let Err(flush_err) = self.flush() {
                warn!(error = %flush_err, "input_cache.writer.rollback_flush_failed");
            }
            self.state.clear();
            return Err(err);
        }
        self.pending += 1;
        if self.buffer.len() >= self.shared.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Appends the buffered entities as one chunk.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        self.buffer.put_i16(END_OF_ENTITIES)?;
        let chunk = self.buffer.take();
        let entities = std::mem::take(&mut self.pending);
        self.state.clear();
        self.shared.append_chunk(&chunk, entities)
    }

    /// Flushes and releases this writer.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.flush()
    }
}

impl InputEntityVisitor for EntityCacher {
    fn property(&mut self, key: &str, value: Value) {
        self.entity.property(key, value);
    }

    fn property_id(&mut self, first_property_id: i64) {
        self.entity.property_id(first_property_id);
    }

    fn id(&mut self, id: Value, group: &Group) {
        self.entity.id(id, group);
    }

    fn labels(&mut self, labels: &[String]) {
        self.entity.labels(labels);
    }

    fn label_field(&mut self, label_field: i64) {
        self.entity.label_field(label_field);
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
        let record = self.entity.to_record(self.shared.kind);
        self.entity.clear();
        self.write_record(&record?)
    }
}

impl Drop for EntityCacher {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.flush() {
                warn!(error = %err, "input_cache.writer.drop_flush_failed");
            }
        }
        self.shared.open_writers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Read side of one cached stream.
pub struct CachedInput {
    kind: EntityKind,
    data_path: PathBuf,
    header_path: PathBuf,
    types: Arc<ValueTypes>,
    delete_after_use: bool,
    passes: usize,
}

impl CachedInput {
    /// Entity kind of this stream.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }
}

impl InputIterable for CachedInput {
    type Iter = CachedInputIterator;

    fn iterator(&mut self) -> Result<CachedInputIterator> {
        if self.delete_after_use && self.passes > 0 {
            return Err(StageError::invalid("one-shot cached input was already read"));
        }
        self.passes += 1;
        let mut header = FileReadChannel::open(&self.header_path)?;
        let tokens = Arc::new(TokenTable::read(&mut header)?);
        let data = FileReadChannel::open(&self.data_path)?;
        let delete = self
            .delete_after_use
            .then(|| (self.data_path.clone(), self.header_path.clone()));
        Ok(CachedInputIterator {
            kind: self.kind,
            data: Some(data),
            tokens,
            types: Arc::clone(&self.types),
            delete,
        })
    }

    fn supports_multiple_passes(&self) -> bool {
        !self.delete_after_use
    }
}

/// One pass over a cached stream.
pub struct CachedInputIterator {
    kind: EntityKind,
    data: Option<FileReadChannel>,
    tokens: Arc<TokenTable>,
    types: Arc<ValueTypes>,
    delete: Option<(PathBuf, PathBuf)>,
}

impl CachedInputIterator {
    fn finish(&mut self) {
        self.data = None;
        if let Some((data, header)) = self.delete.take() {
            for path in [data, header] {
                if let Err(err) = remove_if_exists(&path) {
                    warn!(path = %path.display(), error = %err, "input_cache.remove_failed");
                }
            }
        }
    }
}

impl InputIterator for CachedInputIterator {
    type Chunk = CachedInputChunk;

    fn new_chunk(&self) -> CachedInputChunk {
        CachedInputChunk {
            kind: self.kind,
            cursor: ChunkCursor::new(Bytes::new()),
            state: DiffState::new(),
            tokens: Arc::clone(&self.tokens),
            types: Arc::clone(&self.types),
            exhausted: true,
        }
    }

    fn next(&mut self, chunk: &mut CachedInputChunk) -> Result<bool> {
        let Some(data) = self.data.as_mut() else {
            return Ok(false);
        };
        let len = data.get_i32()?;
        if len == 0 {
            self.finish();
            return Ok(false);
        }
        let len = usize::try_from(len)
            .map_err(|_| StageError::corruption(format!("negative chunk length {len}")))?;
        let mut bytes = BytesMut::zeroed(len);
        data.get_bytes(&mut bytes)?;
        chunk.cursor.reset(bytes.freeze());
        chunk.state.clear();
        chunk.tokens = Arc::clone(&self.tokens);
        chunk.exhausted = false;
        Ok(true)
    }
}

impl Drop for CachedInputIterator {
    fn drop(&mut self) {
        self.finish();
    }
}

/// One decoded chunk of a cached stream.
pub struct CachedInputChunk {
    kind: EntityKind,
    cursor: ChunkCursor,
    state: DiffState,
    tokens: Arc<TokenTable>,
    types: Arc<ValueTypes>,
    exhausted: bool,
}

impl InputChunk for CachedInputChunk {
    fn next(&mut self, visitor: &mut dyn InputEntityVisitor) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        let more = read_entity(
            self.kind,
            &mut self.cursor,
            &mut self.state,
            &self.tokens,
            &self.types,
            visitor,
        )?;
        if !more {
            self.exhausted = true;
            if self.cursor.remaining() != 0 {
                return Err(StageError::corruption(format!(
                    "{} trailing bytes after end of entities",
                    self.cursor.remaining()
                )));
            }
        }
        Ok(more)
    }
}

//! Token dictionary: first-seen strings to small per-namespace ids.
//!
//! Writers intern through [`TokenDictionary`], which appends a
//! `(namespace tag, string)` record to the header stream the first time a
//! string is seen. Readers rebuild the id order from that header with
//! [`TokenTable::read`] before touching any data chunk.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::primitives::bytes::{ReadableChannel, WritableChannel};
use crate::types::{Result, StageError, TokenKind};

/// Terminates the header stream.
pub const END_OF_HEADER: u8 = 0xFF;

/// Highest id each namespace may hand out.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenLimits {
    /// Maximum property-key id.
    pub property_keys: u32,
    /// Maximum label id.
    pub labels: u32,
    /// Maximum relationship-type id.
    pub relationship_types: u32,
    /// Maximum group id.
    pub groups: u32,
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self {
            property_keys: (1 << 24) - 1,
            labels: i32::MAX as u32,
            relationship_types: (1 << 16) - 1,
            groups: i32::MAX as u32,
        }
    }
}

impl TokenLimits {
    /// Same limit for every namespace.
    pub fn uniform(limit: u32) -> Self {
        Self {
            property_keys: limit,
            labels: limit,
            relationship_types: limit,
            groups: limit,
        }
    }

    /// Limit for one namespace.
    pub fn limit(&self, kind: TokenKind) -> u32 {
        match kind {
            TokenKind::PropertyKey => self.property_keys,
            TokenKind::Label => self.labels,
            TokenKind::RelationshipType => self.relationship_types,
            TokenKind::Group => self.groups,
        }
    }
}

fn tag_of(kind: TokenKind) -> u8 {
    kind.index() as u8
}

fn kind_of(tag: u8) -> Result<TokenKind> {
    TokenKind::ALL
        .get(tag as usize)
        .copied()
        .ok_or_else(|| StageError::corruption(format!("unknown header token tag {tag}")))
}

struct DictionaryInner<W> {
    ids: [FxHashMap<Arc<str>, i32>; 4],
    header: W,
    finished: bool,
}

/// Writer-side interning table shared by every entity writer of one stream.
pub struct TokenDictionary<W: WritableChannel> {
    limits: TokenLimits,
    inner: RwLock<DictionaryInner<W>>,
}

impl<W: WritableChannel> TokenDictionary<W> {
    /// Creates an empty dictionary recording new tokens into `header`.
    pub fn new(header: W, limits: TokenLimits) -> Self {
        Self {
            limits,
            inner: RwLock::new(DictionaryInner {
                ids: Default::default(),
                header,
                finished: false,
            }),
        }
    }

    /// Returns the id of `key`, allocating and recording it on first use.
    pub fn get_or_create_id(&self, kind: TokenKind, key: &str) -> Result<i32> {
        if let Some(id) = self.inner.read().ids[kind.index()].get(key) {
            return Ok(*id);
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.ids[kind.index()].get(key) {
            return Ok(*id);
        }
        if inner.finished {
            return Err(StageError::invalid("token dictionary is already finished"));
        }
        let next = inner.ids[kind.index()].len() as u64;
        let limit = self.limits.limit(kind);
        if next > u64::from(limit) {
            return Err(StageError::TooManyTokens { kind, limit });
        }
        let id = next as i32;
        inner.header.put_u8(tag_of(kind))?;
        inner.header.put_string(key)?;
        inner.ids[kind.index()].insert(Arc::from(key), id);
        debug!(%kind, id, "input_tokens.created");
        Ok(id)
    }

    /// Number of tokens allocated in `kind`.
    pub fn len(&self, kind: TokenKind) -> usize {
        self.inner.read().ids[kind.index()].len()
    }

    /// Returns true when no token was allocated in any namespace.
    pub fn is_empty(&self) -> bool {
        self.inner.read().ids.iter().all(|m| m.is_empty())
    }

    /// Terminates the header and flushes it. Later allocations fail.
    pub fn finish(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.finished {
            return Ok(());
        }
        inner.header.put_u8(END_OF_HEADER)?;
        inner.header.flush()?;
        inner.finished = true;
        Ok(())
    }

    /// Gives back the header sink.
    pub fn into_header(self) -> W {
        self.inner.into_inner().header
    }
}

/// Reader-side id to string table.
#[derive(Clone, Debug, Default)]
pub struct TokenTable {
    names: [Vec<Arc<str>>; 4],
}

impl TokenTable {
    /// Consumes a header stream up to and including its terminator.
    pub fn read(header: &mut dyn ReadableChannel) -> Result<Self> {
        let mut table = Self::default();
        loop {
            let tag = header.get_u8()?;
            if tag == END_OF_HEADER {
                break;
            }
            let kind = kind_of(tag)?;
            let name = header.get_string()?;
            table.names[kind.index()].push(Arc::from(name));
        }
        Ok(table)
    }

    /// String for `id` in `kind`.
    pub fn name(&self, kind: TokenKind, id: i32) -> Result<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.names[kind.index()].get(idx))
            .map(|name| &**name)
            .ok_or_else(|| StageError::corruption(format!("unknown {kind} token id {id}")))
    }

    /// Number of tokens in `kind`.
    pub fn len(&self, kind: TokenKind) -> usize {
        self.names[kind.index()].len()
    }

    /// Returns true when the header held no tokens at all.
    pub fn is_empty(&self) -> bool {
        self.names.iter().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use bytes::Bytes;

    use super::*;
    use crate::primitives::bytes::{ByteBuffer, ChunkCursor};

    fn table_of(dict: TokenDictionary<ByteBuffer>) -> TokenTable {
        dict.finish().unwrap();
        let mut header = dict.into_header();
        let mut cursor = ChunkCursor::new(header.take());
        TokenTable::read(&mut cursor).unwrap()
    }

    #[test]
    fn namespaces_are_independent() {
        let dict = TokenDictionary::new(ByteBuffer::with_capacity(64), TokenLimits::default());
        assert_eq!(dict.get_or_create_id(TokenKind::Label, "A").unwrap(), 0);
        assert_eq!(dict.get_or_create_id(TokenKind::PropertyKey, "A").unwrap(), 0);
        assert_eq!(dict.get_or_create_id(TokenKind::Label, "B").unwrap(), 1);
        assert_eq!(dict.get_or_create_id(TokenKind::Label, "A").unwrap(), 0);

        let table = table_of(dict);
        assert_eq!(table.name(TokenKind::Label, 1).unwrap(), "B");
        assert_eq!(table.name(TokenKind::PropertyKey, 0).unwrap(), "A");
        assert_eq!(table.len(TokenKind::RelationshipType), 0);
    }

    #[test]
    fn repeated_key_records_one_header_entry() {
        let dict = TokenDictionary::new(ByteBuffer::with_capacity(64), TokenLimits::default());
        for _ in 0..1000 {
            assert_eq!(dict.get_or_create_id(TokenKind::PropertyKey, "name").unwrap(), 0);
        }
        let table = table_of(dict);
        assert_eq!(table.len(TokenKind::PropertyKey), 1);
    }

    #[test]
    fn limit_is_enforced() {
        let dict = TokenDictionary::new(ByteBuffer::with_capacity(64), TokenLimits::uniform(1));
        dict.get_or_create_id(TokenKind::RelationshipType, "A").unwrap();
        dict.get_or_create_id(TokenKind::RelationshipType, "B").unwrap();
        let err = dict
            .get_or_create_id(TokenKind::RelationshipType, "C")
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::TooManyTokens {
                kind: TokenKind::RelationshipType,
                limit: 1
            }
        ));
        assert!(err.to_string().contains("too many"));
    }

    #[test]
    fn unknown_id_is_corruption() {
        let table = TokenTable::default();
        assert!(matches!(
            table.name(TokenKind::Label, 3),
            Err(StageError::Corruption(_))
        ));
        assert!(table.name(TokenKind::Label, -1).is_err());
    }

    #[test]
    fn unknown_header_tag_is_corruption() {
        let mut cursor = ChunkCursor::new(Bytes::from_static(&[9, 0, 0, 0, 0]));
        assert!(matches!(
            TokenTable::read(&mut cursor),
            Err(StageError::Corruption(_))
        ));
    }

    #[test]
    fn concurrent_callers_agree_on_ids() {
        let dict = TokenDictionary::new(ByteBuffer::with_capacity(64), TokenLimits::default());
        let keys: Vec<String> = (0..64).map(|i| format!("k{i}")).collect();
        let results: Vec<Vec<i32>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        keys.iter()
                            .map(|k| dict.get_or_create_id(TokenKind::PropertyKey, k).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for ids in &results[1..] {
            assert_eq!(ids, &results[0]);
        }
        let table = table_of(dict);
        assert_eq!(table.len(TokenKind::PropertyKey), 64);
        for (key, id) in keys.iter().zip(&results[0]) {
            assert_eq!(table.name(TokenKind::PropertyKey, *id).unwrap(), key);
        }
    }
}

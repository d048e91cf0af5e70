#![forbid(unsafe_code)]
//! Staging of import input.
//!
//! Entities flow through the [`entity::InputEntityVisitor`] boundary. They
//! can be staged on disk in an [`cache::InputCache`] using the binary layout
//! of [`ser`], which makes single-pass sources replayable
//! ([`caching::CachingInputIterable`]) and lets one relationship stream be
//! split per type ([`per_type::PerTypeRelationshipSplitter`]). Data-quality
//! problems go to a [`collector::Collector`].

pub mod cache;
pub mod caching;
pub mod collector;
pub mod entity;
pub mod group;
pub mod per_type;
pub mod ser;
pub mod source;
pub mod tokens;

pub use cache::{CachedInput, EntityCacher, InputCache, InputCacher};
pub use caching::{CachingInputIterable, PassState};
pub use collector::{BadCollector, Collector, Problem};
pub use entity::{EntityKind, EntityRecord, InputEntity, InputEntityVisitor};
pub use group::{Group, Groups};
pub use per_type::{PerTypeRelationshipSplitter, TypeKey};
pub use source::{InputChunk, InputIterable, InputIterator, ListInput};
pub use tokens::{TokenDictionary, TokenLimits, TokenTable};

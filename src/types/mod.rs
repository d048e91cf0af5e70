#![forbid(unsafe_code)]
//! Error taxonomy shared by the input cache and the connection runtime.

use std::fmt;

use thiserror::Error;

/// Namespaces a token id can belong to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum TokenKind {
    /// Property keys.
    PropertyKey,
    /// Node labels.
    Label,
    /// Relationship type names.
    RelationshipType,
    /// Group (id space) names.
    Group,
}

impl TokenKind {
    /// All namespaces in header-tag order.
    pub const ALL: [TokenKind; 4] = [
        TokenKind::PropertyKey,
        TokenKind::Label,
        TokenKind::RelationshipType,
        TokenKind::Group,
    ];

    /// Index into per-namespace tables.
    pub const fn index(self) -> usize {
        match self {
            TokenKind::PropertyKey => 0,
            TokenKind::Label => 1,
            TokenKind::RelationshipType => 2,
            TokenKind::Group => 3,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::PropertyKey => "property key",
            TokenKind::Label => "label",
            TokenKind::RelationshipType => "relationship type",
            TokenKind::Group => "group",
        };
        f.write_str(name)
    }
}

/// Errors raised by the staging pipeline.
#[derive(Debug, Error)]
pub enum StageError {
    /// Underlying file or channel failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Cached data that cannot be decoded (unknown tags, ids, truncation).
    #[error("corruption: {0}")]
    Corruption(String),
    /// API misuse detected at runtime.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// A token namespace ran out of ids for the destination format.
    #[error("too many distinct {kind} tokens, the limit is {limit}")]
    TooManyTokens {
        /// Namespace that overflowed.
        kind: TokenKind,
        /// Highest id the namespace may hand out.
        limit: u32,
    },
    /// A group lookup referenced a name or id never registered.
    #[error("unknown group {0}")]
    UnknownGroup(String),
    /// Named and unnamed id spaces were mixed in one run.
    #[error("mixing specified and unspecified group belongings in a single import isn't supported")]
    MixedGroupModes,
    /// A data-quality problem the collector is not configured to tolerate.
    #[error("{0}")]
    BadInput(String),
    /// The bad-entry tolerance was exceeded.
    #[error("Too many bad entries {count}, where last one was: {last}")]
    TooManyBadEntries {
        /// Number of collected bad entries, including the triggering one.
        count: u64,
        /// Description of the triggering entry.
        last: String,
    },
    /// A unit of work could not be handed to the worker pool.
    #[error("scheduling: {0}")]
    Scheduling(String),
}

impl StageError {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        StageError::Corruption(msg.into())
    }

    /// Builds an [`StageError::Invalid`] error from a message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        StageError::Invalid(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_message_carries_count_and_last_entry() {
        let err = StageError::TooManyBadEntries {
            count: 3,
            last: "Id '7' is defined more than once".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3"));
        assert!(msg.contains("Id '7' is defined more than once"));
    }

    #[test]
    fn token_kind_indices_are_dense() {
        for (i, kind) in TokenKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}

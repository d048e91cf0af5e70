//! Low-level primitives for the staging pipeline.
//!
//! Includes the primitive-typed byte channels and their file-backed variants.

/// Byte channels and in-memory buffers.
///
/// Big-endian primitive encoding shared by the value codec and the cache streams.
pub mod bytes;

/// File-backed channels.
pub mod io;

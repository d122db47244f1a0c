//! Share a fixed set of cached chapter indexes across cooperating zone threads.
//!
//! A deduplication index answers "have we seen this record name before" by consulting, in order,
//! a set of cheaper structures and finally the chapter indexes of the on-disk volume. Reading a
//! chapter index is expensive, so the most recently useful ones are kept in a [cache::SparseCache]
//! shared by every zone (worker thread) of the index.
//!
//! The interesting part is coordination: membership queries ([cache::Zone::contains]) are lock-free
//! and guaranteed to give every zone the same answer, while membership changes
//! ([cache::Zone::update]) are performed by zone zero inside a window bounded by two
//! [barrier::Barrier]s that every zone must enter.
//!
//! # Status
//!
//! `sparse-cache` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use thiserror::Error;

pub mod barrier;
pub mod cache;
pub mod volume;

pub use cache::{Config, Match, SparseCache, Zone};
pub use volume::{Geometry, RecordName, Volume};

/// Errors that can occur when interacting with the sparse cache or its [Volume].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to read chapter {chapter}: {reason}")]
    ChapterRead { chapter: u64, reason: String },
    #[error("chapter {0} index is corrupt")]
    CorruptChapter(u64),
    #[error("index page {page} of chapter {chapter} is not cached")]
    MissingIndexPage { chapter: u64, page: usize },
}

//! A fixed-capacity cache of chapter indexes shared by every zone of a deduplication index.
//!
//! The cache is small, so it is a plain array of slots ([chapter]) searched linearly, with
//! least-recently-used replacement maintained by shifting entries within a per-zone ordering
//! ([search_list]).
//!
//! # Membership
//!
//! The virtual chapter number stored in a slot is the only indication of cache membership. It
//! changes only inside [Zone::update], so between updates every zone's [Zone::contains] returns
//! the same answer for every chapter. Conditions that merely make a chapter less interesting
//! (falling off the end of the volume, or missing too often) never change membership: they only
//! exclude the chapter from searches.
//!
//! # Updates
//!
//! Every zone must call [Zone::update] once, with the same chapter, whenever the chapter is found
//! missing (the dispatcher that feeds the zones is responsible for this). All zones meet at a
//! first barrier; the leader (zone zero) then purges its ordering, swaps the chapter into the
//! least recently used slot, and copies its ordering to every other zone, while the others wait
//! at a second barrier. Outside that window all zones share read access to the slots; inside it
//! the leader has exclusive access. No lock protects the slots themselves.
//!
//! # Skipping
//!
//! The leader counts consecutive search misses per chapter. Once a chapter misses more than
//! [Config::skip_search_threshold] / `zone_count` times in a row it is skipped by searches of the
//! entire cache, but can still be searched directly by chapter. A match clears the flag.
//!
//! # Example
//!
//! ```rust,ignore
//! use sparse_cache::{Config, SparseCache};
//! use prometheus_client::registry::Registry;
//! use std::{num::NonZeroUsize, thread};
//!
//! let cfg = Config {
//!     capacity: NonZeroUsize::new(8).unwrap(),
//!     zone_count: NonZeroUsize::new(2).unwrap(),
//!     skip_search_threshold: sparse_cache::cache::DEFAULT_SKIP_SEARCH_THRESHOLD,
//! };
//! let mut cache = SparseCache::new(volume, cfg, &mut Registry::default()).unwrap();
//! thread::scope(|s| {
//!     for mut zone in cache.zones() {
//!         s.spawn(move || {
//!             if !zone.contains(42) {
//!                 zone.update(42).unwrap();
//!             }
//!             zone.search(&name, None).unwrap()
//!         });
//!     }
//! });
//! ```

use crate::Error;
use std::num::NonZeroUsize;

mod chapter;
mod metrics;
#[cfg(test)]
pub(crate) mod mocks;
mod search_list;
mod storage;
pub use storage::{Match, SparseCache, Zone};

/// Consecutive misses (across all zones) after which a chapter is skipped by full-cache searches.
pub const DEFAULT_SKIP_SEARCH_THRESHOLD: u64 = 20_000;

/// The maximum number of zones that may share a cache.
pub const MAX_ZONES: usize = 16;

/// The maximum number of chapters a cache may hold.
pub const MAX_CAPACITY: usize = u8::MAX as usize;

/// Configuration for a [SparseCache].
#[derive(Clone, Debug)]
pub struct Config {
    /// The number of chapter indexes the cache holds.
    pub capacity: NonZeroUsize,

    /// The number of zone threads sharing the cache. Every one of them must take part in every
    /// update.
    pub zone_count: NonZeroUsize,

    /// Consecutive misses after which a chapter is skipped by full-cache searches. Only the leader
    /// counts misses, so the cache scales this down by `zone_count`.
    pub skip_search_threshold: u64,
}

impl Config {
    /// Check that the configuration describes a cache that can be built.
    pub fn validate(&self) -> Result<(), Error> {
        if self.capacity.get() > MAX_CAPACITY {
            return Err(Error::InvalidConfig("capacity exceeds MAX_CAPACITY"));
        }
        if self.zone_count.get() > MAX_ZONES {
            return Err(Error::InvalidConfig("zone_count exceeds MAX_ZONES"));
        }
        Ok(())
    }
}

//! A per-zone ordering of the cache slots.
//!
//! Slots are ordered from most to least recently used, which is the order in which they are
//! searched and the reverse of the order in which they are evicted. Slots at or after
//! `first_dead_entry` are not members of the cache and are never matched or searched; keeping
//! them at the end ensures a dead slot is always reused before a live chapter is evicted.

use super::{chapter::CachedChapter, MAX_CAPACITY};

/// Where a slot lands when a list is purged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Class {
    /// A searchable member of the cache.
    Active,
    /// A member excluded from searches of the entire cache.
    Skipped,
    /// Empty, or holding a chapter that has fallen off the end of the volume.
    Dead,
}

/// An ordering of slot indices, most recently used first.
///
/// Slot indices fit in a byte, so the entries are stored inline and a list occupies a handful of
/// cache lines of its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct SearchList {
    capacity: usize,
    first_dead_entry: usize,
    entries: [u8; MAX_CAPACITY],
}

impl SearchList {
    /// Create a list over slots `0..capacity`, all of them dead.
    pub(super) fn new(capacity: usize) -> Self {
        assert!(capacity <= MAX_CAPACITY, "capacity {capacity} exceeds MAX_CAPACITY");
        let mut entries = [0; MAX_CAPACITY];
        for (slot, entry) in entries[..capacity].iter_mut().enumerate() {
            *entry = slot as u8;
        }
        Self {
            capacity,
            first_dead_entry: 0,
            entries,
        }
    }

    pub(super) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(super) fn first_dead_entry(&self) -> usize {
        self.first_dead_entry
    }

    /// The slot at position `index`.
    pub(super) fn get(&self, index: usize) -> usize {
        self.entries[..self.capacity][index] as usize
    }

    /// The slots that are members of the cache, most recently used first.
    pub(super) fn live(&self) -> &[u8] {
        &self.entries[..self.first_dead_entry]
    }

    /// Every slot, live ones first.
    #[cfg(test)]
    fn order(&self) -> &[u8] {
        &self.entries[..self.capacity]
    }

    /// Return the slot caching `virtual_chapter` (moving it to the front of the list), or `None`
    /// if the chapter is not a member.
    pub(super) fn contains<P>(
        &mut self,
        chapters: &[CachedChapter<P>],
        virtual_chapter: u64,
    ) -> Option<usize> {
        let index = self.live().iter().position(|&slot| {
            chapters[slot as usize].virtual_chapter() == Some(virtual_chapter)
        })?;
        self.set_newest_entry(index);
        Some(self.get(0))
    }

    /// Move the entry at `index` to the front, pushing the entries before it back by one.
    ///
    /// If the entry was dead, it is about to be reused and the dead region shrinks accordingly.
    pub(super) fn set_newest_entry(&mut self, index: usize) {
        self.entries[..self.capacity][..=index].rotate_right(1);
        if self.first_dead_entry <= index {
            self.first_dead_entry += 1;
        }
    }

    /// Stably partition the live entries into active, skipped, and dead runs, then shrink the
    /// live region to exclude the dead run.
    ///
    /// A chapter older than `oldest_virtual_chapter` counts as dead.
    pub(super) fn purge<P>(&mut self, chapters: &[CachedChapter<P>], oldest_virtual_chapter: u64) {
        let classify = |slot: &u8| {
            let chapter = &chapters[*slot as usize];
            match chapter.virtual_chapter() {
                None => Class::Dead,
                Some(current) if current < oldest_virtual_chapter => Class::Dead,
                Some(_) if chapter.skip_search() => Class::Skipped,
                Some(_) => Class::Active,
            }
        };

        let live = &mut self.entries[..self.first_dead_entry];
        live.sort_by_key(classify);
        self.first_dead_entry = live.partition_point(|slot| classify(slot) != Class::Dead);
    }

    /// Replace this list with a copy of `other`.
    pub(super) fn copy_from(&mut self, other: &Self) {
        self.capacity = other.capacity;
        self.first_dead_entry = other.first_dead_entry;
        self.entries = other.entries;
    }
}

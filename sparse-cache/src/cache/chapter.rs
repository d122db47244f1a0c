//! Cache slots, each holding the index pages of at most one chapter.

use crate::{volume::Volume, Error};
use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

/// Virtual chapter number stored in a slot that caches nothing.
pub(super) const NO_CHAPTER: u64 = u64::MAX;

/// Scoring state written (only) by the leader zone on every search.
///
/// Kept on its own cache line so the leader's writes do not evict the line every other zone reads
/// the virtual chapter from.
#[repr(align(64))]
#[derive(Default)]
struct Counters {
    consecutive_misses: AtomicU64,
}

/// A single slot of the cache.
///
/// The virtual chapter number is the only indication of whether the slot is a member of the cache
/// and may only change while the leader holds the update critical section. When it is
/// [NO_CHAPTER], the slot is dead and every other field is meaningless.
#[repr(align(64))]
pub(super) struct CachedChapter<P> {
    virtual_chapter: AtomicU64,

    /// One entry per index page of the chapter. The slice is allocated once; its contents are
    /// replaced when the slot is reused.
    pages: UnsafeCell<Box<[Option<P>]>>,

    /// Exclude the chapter from searches of the entire cache (but not from searches that target
    /// it directly).
    skip_search: AtomicBool,

    counters: Counters,
}

impl<P> CachedChapter<P> {
    /// Create a dead slot able to hold `index_pages` pages.
    pub(super) fn new(index_pages: usize) -> Self {
        Self {
            virtual_chapter: AtomicU64::new(NO_CHAPTER),
            pages: UnsafeCell::new((0..index_pages).map(|_| None).collect()),
            skip_search: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// The chapter cached in this slot, if any.
    pub(super) fn virtual_chapter(&self) -> Option<u64> {
        match self.virtual_chapter.load(Ordering::Relaxed) {
            NO_CHAPTER => None,
            chapter => Some(chapter),
        }
    }

    pub(super) fn is_dead(&self) -> bool {
        self.virtual_chapter().is_none()
    }

    pub(super) fn skip_search(&self) -> bool {
        self.skip_search.load(Ordering::Relaxed)
    }

    pub(super) fn consecutive_misses(&self) -> u64 {
        self.counters.consecutive_misses.load(Ordering::Relaxed)
    }

    fn set_skip_search(&self, skip_search: bool) {
        // Check before storing to avoid dirtying a line every zone reads.
        if self.skip_search.load(Ordering::Relaxed) != skip_search {
            self.skip_search.store(skip_search, Ordering::Relaxed);
        }
    }

    /// Record that a search found a match in this chapter.
    pub(super) fn score_hit(&self) {
        self.counters.consecutive_misses.store(0, Ordering::Relaxed);
        self.set_skip_search(false);
    }

    /// Record that a search of this chapter came up empty, flagging the chapter to be skipped once
    /// the run of misses exceeds `threshold`.
    pub(super) fn score_miss(&self, threshold: u64) {
        let misses = self.counters.consecutive_misses.load(Ordering::Relaxed) + 1;
        self.counters
            .consecutive_misses
            .store(misses, Ordering::Relaxed);
        if misses > threshold {
            self.set_skip_search(true);
        }
    }

    /// Mark the slot dead and drop its pages, returning how many were held.
    fn release_pages(&self, pages: &mut [Option<P>]) -> usize {
        self.virtual_chapter.store(NO_CHAPTER, Ordering::Relaxed);
        pages.iter_mut().filter_map(Option::take).count()
    }

    /// Mark the slot dead and drop its pages. Releasing a dead slot is a no-op.
    pub(super) fn invalidate(&mut self) -> usize {
        *self.virtual_chapter.get_mut() = NO_CHAPTER;
        self.pages
            .get_mut()
            .iter_mut()
            .filter_map(Option::take)
            .count()
    }

    /// Replace the contents of the slot with the index of `virtual_chapter`.
    ///
    /// If the read fails the slot is left dead and holds no pages.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the slot: no other thread may read its pages or
    /// its virtual chapter for the duration of the call.
    pub(super) unsafe fn load<V>(&self, virtual_chapter: u64, volume: &V) -> Result<(), Error>
    where
        V: Volume<Page = P>,
    {
        debug_assert_ne!(virtual_chapter, NO_CHAPTER);

        // SAFETY: the caller guarantees nobody else is looking at the pages.
        let pages = unsafe { &mut *self.pages.get() };
        self.release_pages(pages);
        if let Err(err) = volume.read_chapter_index(virtual_chapter, pages) {
            // The reader may have filled some pages before failing.
            self.release_pages(pages);
            return Err(err);
        }

        self.counters
            .consecutive_misses
            .store(0, Ordering::Relaxed);
        self.skip_search.store(false, Ordering::Relaxed);
        self.virtual_chapter
            .store(virtual_chapter, Ordering::Relaxed);
        Ok(())
    }

    /// Borrow index page `number`, if the slot holds it.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no [Self::load] of this slot runs while the returned
    /// reference is alive.
    pub(super) unsafe fn page(&self, number: usize) -> Option<&P> {
        // SAFETY: the caller guarantees the pages are not being replaced.
        let pages = unsafe { &*self.pages.get() };
        pages.get(number).and_then(Option::as_ref)
    }

    #[cfg(test)]
    pub(super) fn set_virtual_chapter(&self, virtual_chapter: u64) {
        self.virtual_chapter
            .store(virtual_chapter, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::mocks::MockVolume;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_new_slot_is_dead() {
        let chapter = CachedChapter::<()>::new(4);
        assert!(chapter.is_dead());
        assert_eq!(chapter.virtual_chapter(), None);
        assert!(!chapter.skip_search());
        assert_eq!(chapter.consecutive_misses(), 0);
    }

    #[test_traced]
    fn test_load_and_release() {
        let volume = MockVolume::new(4);
        let mut chapter = CachedChapter::new(4);

        // SAFETY: the slot is not shared.
        unsafe { chapter.load(3, &volume) }.unwrap();
        assert_eq!(chapter.virtual_chapter(), Some(3));
        assert_eq!(volume.reads(), 1);
        // SAFETY: the slot is not shared.
        assert_eq!(unsafe { chapter.page(0) }.unwrap().chapter, 3);
        assert!(unsafe { chapter.page(4) }.is_none());

        // Releasing returns every page exactly once, no matter how often it is called.
        assert_eq!(chapter.invalidate(), 4);
        assert!(chapter.is_dead());
        assert_eq!(volume.released(), 4);
        assert_eq!(chapter.invalidate(), 0);
        assert_eq!(volume.released(), 4);
    }

    #[test_traced]
    fn test_reload_releases_previous_pages() {
        let volume = MockVolume::new(2);
        let chapter = CachedChapter::new(2);

        // SAFETY: the slot is not shared.
        unsafe { chapter.load(1, &volume) }.unwrap();
        chapter.score_miss(0);
        assert!(chapter.skip_search());

        // SAFETY: the slot is not shared.
        unsafe { chapter.load(2, &volume) }.unwrap();
        assert_eq!(chapter.virtual_chapter(), Some(2));
        assert_eq!(volume.released(), 2);
        assert!(!chapter.skip_search());
        assert_eq!(chapter.consecutive_misses(), 0);
    }

    #[test_traced]
    fn test_failed_load_leaves_slot_dead() {
        let volume = MockVolume::new(4);
        let chapter = CachedChapter::new(4);

        // SAFETY: the slot is not shared.
        unsafe { chapter.load(1, &volume) }.unwrap();
        volume.fail(2);
        let result = unsafe { chapter.load(2, &volume) };
        assert!(matches!(result, Err(Error::ChapterRead { chapter: 2, .. })));
        assert!(chapter.is_dead());

        // The four pages of chapter 1 and the page filled before the failure were both released.
        assert_eq!(volume.released(), 5);
        assert!(unsafe { chapter.page(0) }.is_none());
    }

    #[test_traced]
    fn test_skip_threshold() {
        const THRESHOLD: u64 = 5;
        let chapter = CachedChapter::<()>::new(1);
        chapter.set_virtual_chapter(9);

        for _ in 0..THRESHOLD {
            chapter.score_miss(THRESHOLD);
            assert!(!chapter.skip_search());
        }
        chapter.score_miss(THRESHOLD);
        assert!(chapter.skip_search());
        assert_eq!(chapter.consecutive_misses(), THRESHOLD + 1);

        chapter.score_hit();
        assert!(!chapter.skip_search());
        assert_eq!(chapter.consecutive_misses(), 0);
    }
}

use super::{
    chapter::{CachedChapter, NO_CHAPTER},
    metrics::Metrics,
    search_list::SearchList,
    Config,
};
use crate::{
    barrier::Barrier,
    volume::{RecordName, Volume},
    Error,
};
use prometheus_client::registry::Registry;
use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};
use tracing::{debug, info, warn};

/// The zone that drives cache updates and keeps the skip-search scores.
const LEADER: usize = 0;

/// A zone's search list (entries included), kept on cache lines of its own.
#[repr(align(64))]
struct ZoneList(UnsafeCell<SearchList>);

/// The result of a successful [Zone::search].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match {
    /// The cached chapter whose index matched.
    pub virtual_chapter: u64,

    /// The record page within that chapter that may hold the record.
    pub record_page: u16,
}

/// A fixed-capacity cache of chapter indexes shared by a fixed number of zones.
///
/// All access goes through [Zone] handles (see [SparseCache::zones]).
pub struct SparseCache<V: Volume> {
    volume: V,
    zone_count: usize,
    skip_threshold: u64,

    chapters: Box<[CachedChapter<V::Page>]>,
    search_lists: Box<[ZoneList]>,

    begin_update: Barrier,
    end_update: Barrier,

    /// The leader's result for the most recent update, read by every zone once the round ends.
    outcome: Mutex<Result<(), Error>>,

    /// The chapter requested in the current update round ([NO_CHAPTER] between rounds).
    requested: AtomicU64,

    metrics: Metrics,
}

// SAFETY: The only state mutated through a shared reference without synchronization lives in
// `search_lists` and in the page buffers of `chapters`. A zone's search list is only touched by
// the holder of that zone's (unique, `&mut`-accessed) handle, except between the two update
// barriers, when the leader writes every list. The page buffers are only written between the two
// update barriers, and only by the leader. No zone can be between the barriers without every
// zone being between them (each handle is used by one thread at a time and every zone must enter
// `begin_update`), so the leader has exclusive access there. The barriers' mutex orders those
// writes before any later access. Pages are dropped by whichever zone leads, hence `Send`.
unsafe impl<V> Sync for SparseCache<V>
where
    V: Volume,
    V::Page: Send + Sync,
{
}

impl<V: Volume> SparseCache<V> {
    /// Create a cache over `volume` with the given configuration, registering its metrics in
    /// `registry`.
    ///
    /// Every slot starts out dead.
    pub fn new(volume: V, cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        cfg.validate()?;
        let capacity = cfg.capacity.get();
        let zone_count = cfg.zone_count.get();
        let index_pages = volume.geometry().index_pages_per_chapter.get();

        // Only the leader counts misses, but every zone handles searches.
        let skip_threshold = cfg.skip_search_threshold / zone_count as u64;

        let chapters = (0..capacity)
            .map(|_| CachedChapter::new(index_pages))
            .collect();
        let search_lists = (0..zone_count)
            .map(|_| ZoneList(UnsafeCell::new(SearchList::new(capacity))))
            .collect();
        debug!(
            capacity,
            zone_count, skip_threshold, index_pages, "created sparse cache"
        );

        Ok(Self {
            volume,
            zone_count,
            skip_threshold,
            chapters,
            search_lists,
            begin_update: Barrier::new(zone_count),
            end_update: Barrier::new(zone_count),
            outcome: Mutex::new(Ok(())),
            requested: AtomicU64::new(NO_CHAPTER),
            metrics: Metrics::init(registry),
        })
    }

    /// The number of chapters the cache can hold.
    pub fn capacity(&self) -> usize {
        self.chapters.len()
    }

    /// The number of zones sharing the cache.
    pub fn zone_count(&self) -> usize {
        self.zone_count
    }

    /// The number of consecutive misses after which a chapter is skipped by full-cache searches.
    pub fn skip_threshold(&self) -> u64 {
        self.skip_threshold
    }

    /// The volume backing the cache.
    pub fn volume(&self) -> &V {
        &self.volume
    }

    /// Return one handle per zone, in zone order.
    ///
    /// Each handle is meant to be moved to the thread serving that zone. The handles borrow the
    /// cache, so it cannot be invalidated or dropped while any of them is alive.
    pub fn zones(&mut self) -> Vec<Zone<'_, V>> {
        let cache: &Self = self;
        (0..cache.zone_count)
            .map(|id| Zone::new(cache, id))
            .collect()
    }

    /// Return the handle for zone `id` alone.
    ///
    /// The other zones have no handle while this one is alive, so on a cache shared by more than
    /// one zone it can query and search but never take part in an update.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a valid zone. On a cache with more than one zone, the handle's
    /// [Zone::update] panics whenever it would have to wait for the other zones.
    pub fn zone(&mut self, id: usize) -> Zone<'_, V> {
        assert!(id < self.zone_count, "zone {id} out of range");
        let mut zone = Zone::new(self, id);
        zone.alone = true;
        zone
    }

    /// Drop the pages of every slot, leaving the whole cache empty.
    pub fn invalidate(&mut self) {
        let released: usize = self
            .chapters
            .iter_mut()
            .map(CachedChapter::invalidate)
            .sum();
        self.metrics.chapters.set(0);
        info!(released, "invalidated sparse cache");
    }

    /// Borrow the search list of `zone`.
    ///
    /// # Safety
    ///
    /// The caller must be the holder of `zone`'s handle outside an update, or the leader between
    /// the update barriers, and must not let the reference outlive that window.
    #[allow(clippy::mut_from_ref)]
    unsafe fn search_list(&self, zone: usize) -> &mut SearchList {
        // SAFETY: exclusivity is guaranteed by the caller.
        unsafe { &mut *self.search_lists[zone].0.get() }
    }

    /// Check (in debug builds) that every zone in a round requested the same chapter.
    fn check_round(&self, virtual_chapter: u64) {
        if let Err(other) = self.requested.compare_exchange(
            NO_CHAPTER,
            virtual_chapter,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            debug_assert_eq!(
                other, virtual_chapter,
                "zones requested different chapters in one update"
            );
        }
    }

    /// Purge the leader's list, load `virtual_chapter` into its least recently used slot, and copy
    /// the resulting order to every other zone.
    ///
    /// # Safety
    ///
    /// Must only be called by the leader between the two update barriers.
    unsafe fn refresh(
        &self,
        virtual_chapter: u64,
        oldest_virtual_chapter: u64,
    ) -> Result<(), Error> {
        self.requested.store(NO_CHAPTER, Ordering::Relaxed);
        self.metrics.updates.inc();

        // SAFETY: the leader has exclusive access to every list in the critical section.
        let list = unsafe { self.search_list(LEADER) };
        list.purge(&self.chapters, oldest_virtual_chapter);

        let mut result = Ok(());
        let volume_oldest = self.volume.oldest_virtual_chapter();
        if virtual_chapter >= volume_oldest {
            // The last entry is the least recently used live chapter only if there are no dead
            // slots left to reuse.
            let evicting = list.first_dead_entry() == list.capacity();
            list.set_newest_entry(list.capacity() - 1);
            let chapter = &self.chapters[list.get(0)];
            if evicting {
                if let Some(evicted) = chapter.virtual_chapter() {
                    self.metrics.evictions.inc();
                    debug!(evicted, virtual_chapter, "evicting cached chapter");
                }
            }

            self.metrics.loads.inc();
            // SAFETY: every other zone is parked between the barriers.
            result = unsafe { chapter.load(virtual_chapter, &self.volume) };
            match &result {
                Ok(()) => debug!(virtual_chapter, "cached chapter index"),
                Err(err) => {
                    self.metrics.load_failures.inc();
                    warn!(virtual_chapter, ?err, "failed to cache chapter index");
                }
            }
        } else {
            debug!(
                virtual_chapter,
                volume_oldest, "chapter no longer in volume, not caching"
            );
        }

        for zone in (0..self.zone_count).filter(|&zone| zone != LEADER) {
            // SAFETY: as above; the follower lists are distinct from the leader's.
            unsafe { self.search_list(zone) }.copy_from(list);
        }

        let cached = list
            .live()
            .iter()
            .filter(|&&slot| !self.chapters[slot as usize].is_dead())
            .count();
        self.metrics.chapters.set(cached as i64);
        result
    }
}

/// Hot-path counts a zone keeps to itself until it publishes them.
#[derive(Default)]
struct Pending {
    hits: u64,
    searches: u64,
    search_matches: u64,
    skipped: u64,
}

/// A zone's view of a [SparseCache].
///
/// Every operation takes `&mut self`, so a zone never has two operations in flight.
///
/// Membership hits and searches are counted locally and added to the cache's metrics whenever the
/// zone calls [Zone::update] (or [Zone::flush_metrics]) and when it is dropped.
pub struct Zone<'a, V: Volume> {
    cache: &'a SparseCache<V>,
    id: usize,

    /// Whether the other zones have no handle to enter an update with.
    alone: bool,

    /// The oldest chapter this zone still considers part of the index.
    oldest_virtual_chapter: u64,

    pending: Pending,
}

impl<'a, V: Volume> Zone<'a, V> {
    fn new(cache: &'a SparseCache<V>, id: usize) -> Self {
        Self {
            cache,
            id,
            alone: false,
            oldest_virtual_chapter: 0,
            pending: Pending::default(),
        }
    }

    /// The zone number.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether this zone drives updates and keeps the skip-search scores.
    pub fn is_leader(&self) -> bool {
        self.id == LEADER
    }

    /// The oldest chapter this zone still considers part of the index.
    pub fn oldest_virtual_chapter(&self) -> u64 {
        self.oldest_virtual_chapter
    }

    /// Advance the oldest chapter this zone considers part of the index. Older cached chapters
    /// are no longer searched and are dropped from the cache at the next update.
    pub fn set_oldest_virtual_chapter(&mut self, virtual_chapter: u64) {
        self.oldest_virtual_chapter = virtual_chapter;
    }

    /// Return the chapters cached, most recently used (by this zone) first.
    pub fn chapters(&mut self) -> Vec<u64> {
        // SAFETY: we hold this zone's handle and are not in an update.
        let list = unsafe { self.cache.search_list(self.id) };
        list.live()
            .iter()
            .filter_map(|&slot| self.cache.chapters[slot as usize].virtual_chapter())
            .collect()
    }

    /// Add the hits and searches counted by this zone to the cache's metrics.
    pub fn flush_metrics(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        let metrics = &self.cache.metrics;
        metrics.hits.inc_by(pending.hits);
        metrics.searches.inc_by(pending.searches);
        metrics.search_matches.inc_by(pending.search_matches);
        metrics.skipped.inc_by(pending.skipped);
    }

    /// Return whether `virtual_chapter` is a member of the cache, marking it most recently used if
    /// it is.
    ///
    /// Between updates, every zone gets the same answer for the same chapter. Never blocks.
    pub fn contains(&mut self, virtual_chapter: u64) -> bool {
        let cache = self.cache;
        // SAFETY: we hold this zone's handle and are not in an update.
        let list = unsafe { cache.search_list(self.id) };
        let Some(slot) = list.contains(&cache.chapters, virtual_chapter) else {
            return false;
        };
        if self.is_leader() {
            cache.chapters[slot].score_hit();
        }
        self.pending.hits += 1;
        true
    }

    /// Make `virtual_chapter` a member of the cache.
    ///
    /// Every zone must call this with the same chapter, once, whenever any zone finds the chapter
    /// missing: the call blocks until all zones have arrived, lets the leader swap the chapter in,
    /// and returns the leader's result to every zone.
    ///
    /// # Panics
    ///
    /// Panics if the chapter is missing and this handle came from [SparseCache::zone] on a cache
    /// with more than one zone, as no other zone could ever join the update.
    pub fn update(&mut self, virtual_chapter: u64) -> Result<(), Error> {
        debug_assert_ne!(virtual_chapter, NO_CHAPTER);

        // Another zone may have already triggered the load.
        let member = self.contains(virtual_chapter);
        self.flush_metrics();
        if member {
            return Ok(());
        }

        let cache = self.cache;
        assert!(
            !self.alone || cache.zone_count == 1,
            "zone {} cannot update without the other zones",
            self.id
        );
        cache.check_round(virtual_chapter);

        // Start of the critical section: the leader may touch every slot and list until all zones
        // meet again at `end_update`. Everyone else must do nothing in between.
        cache.begin_update.enter();
        if self.is_leader() {
            // SAFETY: we are the leader and between the barriers.
            let result = unsafe { cache.refresh(virtual_chapter, self.oldest_virtual_chapter) };
            *cache.outcome.lock().unwrap() = result;
        }
        cache.end_update.enter();

        // The leader only overwrites the outcome after every zone has entered the next round.
        cache.outcome.lock().unwrap().clone()
    }

    /// Search the cached chapters for `name`.
    ///
    /// With `virtual_chapter` set, only that chapter is searched (even if it is being skipped).
    /// Otherwise every live chapter not flagged for skipping is searched from most to least
    /// recently used, stopping at the first match.
    pub fn search(
        &mut self,
        name: &RecordName,
        virtual_chapter: Option<u64>,
    ) -> Result<Option<Match>, Error> {
        let cache = self.cache;
        self.pending.searches += 1;

        // SAFETY: we hold this zone's handle and are not in an update.
        let list = unsafe { cache.search_list(self.id) };
        for index in 0..list.first_dead_entry() {
            let chapter = &cache.chapters[list.get(index)];
            let Some(current) = chapter.virtual_chapter() else {
                continue;
            };
            if current < self.oldest_virtual_chapter {
                continue;
            }
            match virtual_chapter {
                Some(requested) if requested != current => continue,
                None if chapter.skip_search() => {
                    self.pending.skipped += 1;
                    continue;
                }
                _ => {}
            }

            let physical_chapter = cache.volume.geometry().map_to_physical_chapter(current);
            let page_number = cache
                .volume
                .find_index_page_number(name, physical_chapter);
            // SAFETY: pages are only replaced between the update barriers, and we are not there.
            let page = unsafe { chapter.page(page_number) }.ok_or(Error::MissingIndexPage {
                chapter: current,
                page: page_number,
            })?;

            if let Some(record_page) = cache.volume.search_chapter_index_page(page, name)? {
                // A later chapter could also hold the name, but the first match wins.
                list.set_newest_entry(index);
                if self.is_leader() {
                    chapter.score_hit();
                }
                self.pending.search_matches += 1;
                return Ok(Some(Match {
                    virtual_chapter: current,
                    record_page,
                }));
            }

            if self.is_leader() {
                chapter.score_miss(cache.skip_threshold);
            }
            if virtual_chapter.is_some() {
                break;
            }
        }
        Ok(None)
    }
}

impl<V: Volume> Drop for Zone<'_, V> {
    fn drop(&mut self) {
        self.flush_metrics();
    }
}

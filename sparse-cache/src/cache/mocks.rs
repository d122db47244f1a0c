//! A [Volume] that keeps chapters in memory and counts what the cache does with them.

use crate::{
    volume::{Geometry, RecordName, Volume},
    Error,
};
use std::{
    collections::{HashMap, HashSet},
    num::{NonZeroU64, NonZeroUsize},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// A page of a [MockVolume] chapter.
pub struct MockPage {
    pub chapter: u64,
    records: Vec<(RecordName, u16)>,
    released: Arc<AtomicUsize>,
}

impl Drop for MockPage {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct MockVolume {
    geometry: Geometry,
    oldest: AtomicU64,
    reads: AtomicUsize,
    released: Arc<AtomicUsize>,
    failing: Mutex<HashSet<u64>>,
    holes: Mutex<HashSet<(u64, usize)>>,
    records: Mutex<HashMap<u64, Vec<(RecordName, u16)>>>,
}

impl MockVolume {
    pub fn new(index_pages_per_chapter: usize) -> Self {
        Self {
            geometry: Geometry {
                chapters_per_volume: NonZeroU64::new(1024).unwrap(),
                index_pages_per_chapter: NonZeroUsize::new(index_pages_per_chapter).unwrap(),
            },
            oldest: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            failing: Mutex::new(HashSet::new()),
            holes: Mutex::new(HashSet::new()),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Make every read of `chapter` fail (after filling its first page).
    pub fn fail(&self, chapter: u64) {
        self.failing.lock().unwrap().insert(chapter);
    }

    /// Let reads of `chapter` succeed again.
    pub fn heal(&self, chapter: u64) {
        self.failing.lock().unwrap().remove(&chapter);
    }

    /// Make reads of `chapter` succeed without filling index page `page`.
    pub fn hole(&self, chapter: u64, page: usize) {
        self.holes.lock().unwrap().insert((chapter, page));
    }

    /// Store `name` in `chapter`, pointing at `record_page`.
    pub fn insert(&self, chapter: u64, name: RecordName, record_page: u16) {
        self.records
            .lock()
            .unwrap()
            .entry(chapter)
            .or_default()
            .push((name, record_page));
    }

    pub fn set_oldest(&self, chapter: u64) {
        self.oldest.store(chapter, Ordering::Relaxed);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    /// A counter of released pages that outlives the volume.
    pub fn released_counter(&self) -> Arc<AtomicUsize> {
        self.released.clone()
    }

    fn page_number(&self, name: &RecordName) -> usize {
        name.0[0] as usize % self.geometry.index_pages_per_chapter.get()
    }
}

/// A record name whose first byte selects the index page.
pub fn name(page: u8, id: u8) -> RecordName {
    let mut bytes = [0u8; 16];
    bytes[0] = page;
    bytes[1] = id;
    RecordName(bytes)
}

impl Volume for MockVolume {
    type Page = MockPage;

    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn oldest_virtual_chapter(&self) -> u64 {
        self.oldest.load(Ordering::Relaxed)
    }

    fn read_chapter_index(
        &self,
        virtual_chapter: u64,
        pages: &mut [Option<Self::Page>],
    ) -> Result<(), Error> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let records = self
            .records
            .lock()
            .unwrap()
            .get(&virtual_chapter)
            .cloned()
            .unwrap_or_default();
        let failing = self.failing.lock().unwrap().contains(&virtual_chapter);
        let holes = self.holes.lock().unwrap();
        for (number, page) in pages.iter_mut().enumerate() {
            if holes.contains(&(virtual_chapter, number)) {
                continue;
            }
            *page = Some(MockPage {
                chapter: virtual_chapter,
                records: records
                    .iter()
                    .filter(|(name, _)| self.page_number(name) == number)
                    .copied()
                    .collect(),
                released: self.released.clone(),
            });
            if failing {
                return Err(Error::ChapterRead {
                    chapter: virtual_chapter,
                    reason: "injected failure".into(),
                });
            }
        }
        Ok(())
    }

    fn find_index_page_number(&self, name: &RecordName, _physical_chapter: u64) -> usize {
        self.page_number(name)
    }

    fn search_chapter_index_page(
        &self,
        page: &Self::Page,
        name: &RecordName,
    ) -> Result<Option<u16>, Error> {
        Ok(page
            .records
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, record_page)| *record_page))
    }
}

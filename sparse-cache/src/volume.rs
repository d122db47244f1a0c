//! The boundary between the cache and the chapter storage that backs it.
//!
//! The cache never interprets chapter index pages itself. Reading a chapter's pages from disk,
//! locating the page that covers a record name, and searching within that page are all delegated
//! to a [Volume].

use crate::Error;
use std::num::{NonZeroU64, NonZeroUsize};

/// Size (in bytes) of a [RecordName].
pub const RECORD_NAME_SIZE: usize = 16;

/// The fingerprint of a record's content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordName(pub [u8; RECORD_NAME_SIZE]);

impl From<[u8; RECORD_NAME_SIZE]> for RecordName {
    fn from(value: [u8; RECORD_NAME_SIZE]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for RecordName {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The shape of the volume that chapters are read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// The number of physical chapters the volume holds before it wraps around.
    pub chapters_per_volume: NonZeroU64,

    /// The number of index pages in every chapter.
    pub index_pages_per_chapter: NonZeroUsize,
}

impl Geometry {
    /// Map a virtual chapter number onto the physical chapter that stores it.
    pub fn map_to_physical_chapter(&self, virtual_chapter: u64) -> u64 {
        virtual_chapter % self.chapters_per_volume.get()
    }
}

/// Chapter storage consulted by the cache.
///
/// Implementations are shared by every zone thread and must therefore be [Send] and [Sync].
pub trait Volume: Send + Sync {
    /// A decoded chapter index page.
    ///
    /// A page is dropped when the cache slot holding it is released or reused, which is the
    /// point at which any backing buffer should be returned to its pool.
    type Page: Send + Sync;

    /// The geometry of the volume.
    fn geometry(&self) -> &Geometry;

    /// The oldest virtual chapter still stored in the volume. Anything older has been overwritten
    /// and is not worth caching.
    fn oldest_virtual_chapter(&self) -> u64;

    /// Read every index page of `virtual_chapter` into `pages` (which holds one slot per index page
    /// and is empty on entry).
    fn read_chapter_index(
        &self,
        virtual_chapter: u64,
        pages: &mut [Option<Self::Page>],
    ) -> Result<(), Error>;

    /// Return the number of the index page in `physical_chapter` whose range covers `name`.
    fn find_index_page_number(&self, name: &RecordName, physical_chapter: u64) -> usize;

    /// Search a single index page for `name`, returning the record page that may contain it.
    fn search_chapter_index_page(
        &self,
        page: &Self::Page,
        name: &RecordName,
    ) -> Result<Option<u16>, Error>;
}

//! Metrics for [super::SparseCache].

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for [super::SparseCache].
///
/// The hit and search counters are fed in batches by each [super::Zone], so zones do not contend
/// on them while serving requests.
#[derive(Default)]
pub(super) struct Metrics {
    /// Membership queries that found their chapter.
    pub hits: Counter,
    /// Update rounds driven by the leader.
    pub updates: Counter,
    /// Chapter indexes read from the volume.
    pub loads: Counter,
    /// Chapter index reads that failed.
    pub load_failures: Counter,
    /// Cached chapters replaced to make room for another.
    pub evictions: Counter,
    /// Record name searches.
    pub searches: Counter,
    /// Record name searches that found a record page.
    pub search_matches: Counter,
    /// Chapters passed over because of too many consecutive misses.
    pub skipped: Counter,
    /// Slots currently holding a chapter.
    pub chapters: Gauge,
}

impl Metrics {
    /// Create and register metrics with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "sparse_cache_hits",
            "Membership queries that found their chapter",
            metrics.hits.clone(),
        );
        registry.register(
            "sparse_cache_updates",
            "Update rounds driven by the leader zone",
            metrics.updates.clone(),
        );
        registry.register(
            "sparse_cache_loads",
            "Chapter indexes read from the volume",
            metrics.loads.clone(),
        );
        registry.register(
            "sparse_cache_load_failures",
            "Chapter index reads that failed",
            metrics.load_failures.clone(),
        );
        registry.register(
            "sparse_cache_evictions",
            "Cached chapters replaced to make room for another",
            metrics.evictions.clone(),
        );
        registry.register(
            "sparse_cache_searches",
            "Record name searches",
            metrics.searches.clone(),
        );
        registry.register(
            "sparse_cache_search_matches",
            "Record name searches that found a record page",
            metrics.search_matches.clone(),
        );
        registry.register(
            "sparse_cache_skipped",
            "Chapters passed over because of too many consecutive misses",
            metrics.skipped.clone(),
        );
        registry.register(
            "sparse_cache_chapters",
            "Slots currently holding a chapter",
            metrics.chapters.clone(),
        );
        metrics
    }
}

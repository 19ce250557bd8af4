//! Region→tile cache.
//!
//! Which imagery tiles overlap which region only changes when the imagery layout changes,
//! so the association is computed once by an explicit rebuild and persisted. Aggregation
//! tasks read it through a bounded in-memory LRU front.

use crate::catalog::{ImageryInventory, RegionCatalog, RegionExtractor, RegionId};
use crate::error::{Error, Result};
use crate::pipeline::Metrics;
use crate::store::{Store, TileCacheEpoch};
use crate::temporal::{Cadence, TemporalKey};
use lru::LruCache;
use rayon::prelude::*;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Persistent region→tile lookup with an LRU front.
pub struct TileCache {
    store: Arc<Store>,
    recent: Mutex<RecentTiles>,
}

/// In-memory front. `generation` advances on every rebuild so a lookup that read the store
/// before a rebuild cannot put its stale list back.
struct RecentTiles {
    entries: LruCache<RegionId, Arc<Vec<String>>>,
    generation: u64,
}

impl TileCache {
    /// `capacity` bounds the number of regions held in memory.
    pub fn new(store: Arc<Store>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            recent: Mutex::new(RecentTiles {
                entries: LruCache::new(capacity),
                generation: 0,
            }),
        }
    }

    /// Cached tile ids of a region. Unknown regions yield an empty list.
    ///
    /// Hits and misses are counted on `metrics` when given.
    pub fn lookup(
        &self,
        region_id: RegionId,
        metrics: Option<&Metrics>,
    ) -> Result<Arc<Vec<String>>> {
        let generation = {
            let mut recent = self.recent.lock().map_err(|_| Error::LockPoisoned)?;
            if let Some(tiles) = recent.entries.get(&region_id) {
                if let Some(m) = metrics {
                    m.add_tile_cache_hit();
                }
                return Ok(tiles.clone());
            }
            recent.generation
        };

        let tiles = Arc::new(self.store.cached_tiles(region_id)?);
        if let Some(m) = metrics {
            m.add_tile_cache_miss();
        }
        self.remember(region_id, tiles.clone(), generation)?;
        Ok(tiles)
    }

    /// Put a list read from the store into the front, unless a rebuild happened since
    /// `generation` was observed.
    fn remember(&self, region_id: RegionId, tiles: Arc<Vec<String>>, generation: u64) -> Result<()> {
        let mut recent = self.recent.lock().map_err(|_| Error::LockPoisoned)?;
        if recent.generation == generation {
            recent.entries.put(region_id, tiles);
        }
        Ok(())
    }

    /// Recompute the association for every catalog region against the daily imagery of
    /// `epoch` and replace the persisted cache.
    ///
    /// The region × tile cross-check runs on a dedicated rayon pool of `threads` workers.
    /// Tiles whose overlap test errors are treated as not overlapping. If no imagery exists
    /// for `epoch` the existing cache is left untouched.
    pub fn rebuild(
        &self,
        catalog: &dyn RegionCatalog,
        inventory: &dyn ImageryInventory,
        extractor: &dyn RegionExtractor,
        epoch: TemporalKey,
        threads: usize,
    ) -> Result<RebuildStats> {
        let tiles = inventory
            .list_tiles(epoch, Cadence::Daily)
            .map_err(Error::collaborator)?;
        if tiles.is_empty() {
            return Err(Error::NoImageryFound(format!("daily {}", epoch)));
        }
        let region_ids = catalog.all_region_ids().map_err(Error::collaborator)?;

        tracing::info!(
            "Rebuilding tile cache from {} tiles of {} for {} regions",
            tiles.len(),
            epoch,
            region_ids.len()
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .map_err(|e| Error::Task(e.to_string()))?;

        let entries: Vec<(RegionId, Vec<String>)> = pool.install(|| {
            region_ids
                .par_iter()
                .map(|&region_id| {
                    let region = match catalog.region(region_id) {
                        Ok(region) => region,
                        Err(e) => {
                            tracing::warn!("Region {} skipped in tile cache: {}", region_id, e);
                            return (region_id, Vec::new());
                        }
                    };
                    let overlapping = tiles
                        .iter()
                        .filter(|tile| match extractor.intersects(tile, &region) {
                            Ok(overlaps) => overlaps,
                            Err(e) => {
                                tracing::warn!(
                                    "Overlap test failed for region {} tile {}: {}",
                                    region_id,
                                    tile.tile_id,
                                    e
                                );
                                false
                            }
                        })
                        .map(|tile| tile.tile_id.clone())
                        .collect();
                    (region_id, overlapping)
                })
                .collect()
        });

        let stats = RebuildStats::from_entries(&entries, tiles.len());
        self.store.replace_tile_cache(&entries, epoch)?;
        {
            let mut recent = self.recent.lock().map_err(|_| Error::LockPoisoned)?;
            recent.generation += 1;
            recent.entries.clear();
        }

        tracing::info!("Tile cache rebuilt: {}", stats);
        Ok(stats)
    }

    /// Coverage of the persisted cache against a catalog of `total_regions`.
    pub fn coverage_stats(&self, total_regions: usize) -> Result<CoverageStats> {
        let counts = self.store.tile_counts()?;
        let regions_with_tiles = counts.len();
        let max_tiles_per_region = counts.iter().map(|(_, n)| *n).max().unwrap_or(0);
        let total_refs: usize = counts.iter().map(|(_, n)| *n).sum();

        let avg_tiles_per_region = if regions_with_tiles > 0 {
            total_refs as f64 / regions_with_tiles as f64
        } else {
            0.0
        };

        Ok(CoverageStats {
            total_regions,
            regions_with_tiles,
            uncovered_regions: total_regions.saturating_sub(regions_with_tiles),
            max_tiles_per_region,
            avg_tiles_per_region,
            epoch: self.store.tile_cache_epoch()?,
        })
    }
}

/// Outcome of a rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildStats {
    pub regions: usize,
    pub regions_with_tiles: usize,
    pub tile_refs: usize,
    pub tiles_available: usize,
}

impl RebuildStats {
    fn from_entries(entries: &[(RegionId, Vec<String>)], tiles_available: usize) -> Self {
        Self {
            regions: entries.len(),
            regions_with_tiles: entries.iter().filter(|(_, t)| !t.is_empty()).count(),
            tile_refs: entries.iter().map(|(_, t)| t.len()).sum(),
            tiles_available,
        }
    }
}

impl std::fmt::Display for RebuildStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} regions covered, {} region-tile pairs, {} tiles available",
            self.regions_with_tiles, self.regions, self.tile_refs, self.tiles_available
        )
    }
}

/// Statistics about tile coverage.
#[derive(Debug, Clone)]
pub struct CoverageStats {
    /// Regions in the catalog
    pub total_regions: usize,

    /// Regions with at least one cached tile
    pub regions_with_tiles: usize,

    /// Regions that will fail with "no intersecting tiles"
    pub uncovered_regions: usize,

    /// Maximum number of tiles overlapping a single region
    pub max_tiles_per_region: usize,

    /// Average number of tiles per covered region
    pub avg_tiles_per_region: f64,

    /// Imagery key of the last rebuild
    pub epoch: Option<TileCacheEpoch>,
}

impl std::fmt::Display for CoverageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pct = if self.total_regions > 0 {
            self.regions_with_tiles as f64 / self.total_regions as f64 * 100.0
        } else {
            0.0
        };
        write!(
            f,
            "Coverage: {}/{} regions ({:.1}%), max overlap: {}, avg overlap: {:.1}",
            self.regions_with_tiles,
            self.total_regions,
            pct,
            self.max_tiles_per_region,
            self.avg_tiles_per_region
        )?;
        match &self.epoch {
            Some(epoch) => write!(f, ", epoch: {} (built {})", epoch.key, epoch.built_at),
            None => write!(f, ", epoch: none"),
        }
    }
}

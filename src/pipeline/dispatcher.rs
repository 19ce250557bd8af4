//! Parallel per-region aggregation.
//!
//! A chunk of region ids is fanned out as one blocking task per region, with at most
//! `pool_size` tasks in flight. Every task produces a [`RegionResult`]; nothing a single
//! region does can fail the chunk.

use crate::catalog::{Extraction, ImageryTile, RegionCatalog, RegionExtractor, RegionId};
use crate::error::RegionFailure;
use crate::histogram::Histogram;
use crate::index::TileCache;
use crate::pipeline::Metrics;
use crate::store::Status;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Imagery tiles of one cycle, by tile id.
pub type TileSet = HashMap<String, ImageryTile>;

/// Final outcome of one region task.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionOutcome {
    Processed(Histogram),
    Failed(RegionFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionResult {
    pub region_id: RegionId,
    pub outcome: RegionOutcome,
}

impl RegionResult {
    pub fn status(&self) -> Status {
        match self.outcome {
            RegionOutcome::Processed(_) => Status::Processed,
            RegionOutcome::Failed(_) => Status::Failed,
        }
    }

    /// Status comment: the failure reason, none for PROCESSED.
    pub fn comment(&self) -> Option<String> {
        match &self.outcome {
            RegionOutcome::Processed(_) => None,
            RegionOutcome::Failed(reason) => Some(reason.to_string()),
        }
    }

    pub fn histogram(&self) -> Option<&Histogram> {
        match &self.outcome {
            RegionOutcome::Processed(histogram) => Some(histogram),
            RegionOutcome::Failed(_) => None,
        }
    }
}

/// Fans region tasks across a bounded pool of blocking workers.
#[derive(Clone)]
pub struct Dispatcher {
    catalog: Arc<dyn RegionCatalog>,
    extractor: Arc<dyn RegionExtractor>,
    tile_cache: Arc<TileCache>,
    pool_size: usize,
}

impl Dispatcher {
    pub fn new(
        catalog: Arc<dyn RegionCatalog>,
        extractor: Arc<dyn RegionExtractor>,
        tile_cache: Arc<TileCache>,
        pool_size: usize,
    ) -> Self {
        Self {
            catalog,
            extractor,
            tile_cache,
            pool_size: pool_size.max(1),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Aggregate every region of a chunk, counting on the run's `metrics`. Results come
    /// back in completion order.
    pub async fn dispatch(
        &self,
        regions: &[RegionId],
        tiles: Arc<TileSet>,
        metrics: &Arc<Metrics>,
    ) -> Vec<RegionResult> {
        metrics.add_chunk_dispatched();

        stream::iter(regions.iter().copied())
            .map(|region_id| {
                let dispatcher = self.clone();
                let tiles = tiles.clone();
                let metrics = metrics.clone();
                async move {
                    let task_metrics = metrics.clone();
                    let handle = tokio::task::spawn_blocking(move || {
                        dispatcher.aggregate_region(region_id, &tiles, &task_metrics)
                    });
                    let outcome = handle.await.unwrap_or_else(|e| {
                        tracing::error!("Task for region {} aborted: {}", region_id, e);
                        RegionOutcome::Failed(RegionFailure::TaskAborted(e.to_string()))
                    });
                    if matches!(outcome, RegionOutcome::Failed(_)) {
                        metrics.add_region_failed();
                    } else {
                        metrics.add_region_processed();
                    }
                    RegionResult { region_id, outcome }
                }
            })
            .buffer_unordered(self.pool_size)
            .collect()
            .await
    }

    /// Aggregate one region on the current (blocking) thread.
    ///
    /// The region is PROCESSED as soon as one tile yields counts. Tiles that error are
    /// skipped; if none yields counts the region fails with the last tile error, or with
    /// "no imagery overlap" when every tile simply missed it.
    fn aggregate_region(
        &self,
        region_id: RegionId,
        tiles: &TileSet,
        metrics: &Metrics,
    ) -> RegionOutcome {
        let tile_ids = match self.tile_cache.lookup(region_id, Some(metrics)) {
            Ok(tile_ids) => tile_ids,
            Err(e) => {
                return RegionOutcome::Failed(RegionFailure::ExtractionFailure(format!(
                    "tile cache lookup failed: {}",
                    e
                )))
            }
        };
        if tile_ids.is_empty() {
            return RegionOutcome::Failed(RegionFailure::NoIntersectingTiles);
        }

        let region = match self.catalog.region(region_id) {
            Ok(region) => region,
            Err(e) => {
                tracing::warn!("Region {}: {}", region_id, e);
                return RegionOutcome::Failed(RegionFailure::GeometryUnavailable(e.to_string()));
            }
        };

        let mut histogram = Histogram::new();
        let mut has_data = false;
        let mut last_error = None;

        for tile_id in tile_ids.iter() {
            let Some(tile) = tiles.get(tile_id) else {
                tracing::debug!("Region {}: tile {} not in current imagery", region_id, tile_id);
                continue;
            };

            let start = Instant::now();
            let extraction = self.extractor.extract(tile, &region);
            metrics.add_extract_time(start.elapsed());

            match extraction {
                Ok(Extraction::Counts(counts)) => {
                    histogram.merge(&counts);
                    has_data = true;
                    metrics.add_tile_extracted();
                }
                Ok(Extraction::NoOverlap) => {}
                Err(e) => {
                    tracing::warn!("Region {} tile {}: {}", region_id, tile_id, e);
                    metrics.add_tile_failure();
                    last_error = Some(e.to_string());
                }
            }
        }

        if has_data {
            RegionOutcome::Processed(histogram)
        } else if let Some(reason) = last_error {
            RegionOutcome::Failed(RegionFailure::ExtractionFailure(reason))
        } else {
            RegionOutcome::Failed(RegionFailure::NoImageryOverlap)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::catalog::Region;
    use crate::test_support::{FakeCatalog, FakeExtractor, TileResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records the highest number of concurrent `extract` calls.
    #[derive(Default)]
    struct TrackingExtractor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl RegionExtractor for TrackingExtractor {
        fn extract(&self, _tile: &ImageryTile, _region: &Region) -> anyhow::Result<Extraction> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Extraction::Counts(Histogram::from_buckets([(1, 1)])))
        }
    }

    fn tile_set(ids: &[&str]) -> Arc<TileSet> {
        Arc::new(
            ids.iter()
                .map(|id| {
                    (
                        id.to_string(),
                        ImageryTile {
                            tile_id: id.to_string(),
                            path: format!("/imagery/{}.tif", id).into(),
                        },
                    )
                })
                .collect(),
        )
    }

    fn dispatcher(
        catalog: FakeCatalog,
        extractor: FakeExtractor,
        cache: &[(RegionId, Vec<&str>)],
    ) -> Dispatcher {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entries: Vec<_> = cache
            .iter()
            .map(|(id, tiles)| (*id, tiles.iter().map(|t| t.to_string()).collect()))
            .collect();
        store
            .replace_tile_cache(&entries, crate::temporal::TemporalKey::new(2024, 1).unwrap())
            .unwrap();
        let tile_cache = Arc::new(TileCache::new(store, 64));
        Dispatcher::new(Arc::new(catalog), Arc::new(extractor), tile_cache, 2)
    }

    fn outcome_of(results: &[RegionResult], region_id: RegionId) -> &RegionOutcome {
        &results
            .iter()
            .find(|r| r.region_id == region_id)
            .unwrap()
            .outcome
    }

    #[tokio::test]
    async fn test_failed_tile_is_skipped() {
        let extractor = FakeExtractor::new()
            .respond("A", 42, TileResponse::counts(&[(10, 4), (254, 1)]))
            .respond("B", 42, TileResponse::Error("corrupt tile"));
        let d = dispatcher(
            FakeCatalog::with_regions(&[42]),
            extractor,
            &[(42, vec!["A", "B"])],
        );

        let results = d.dispatch(&[42], tile_set(&["A", "B"]), &Metrics::new()).await;
        assert_eq!(
            outcome_of(&results, 42),
            &RegionOutcome::Processed(Histogram::from_buckets([(10, 4), (254, 1)]))
        );
    }

    #[tokio::test]
    async fn test_tiles_are_summed() {
        let extractor = FakeExtractor::new()
            .respond("A", 1, TileResponse::counts(&[(10, 4)]))
            .respond("B", 1, TileResponse::counts(&[(10, 1), (20, 2)]));
        let d = dispatcher(FakeCatalog::with_regions(&[1]), extractor, &[(1, vec!["A", "B"])]);

        let results = d.dispatch(&[1], tile_set(&["A", "B"]), &Metrics::new()).await;
        assert_eq!(
            results[0].histogram(),
            Some(&Histogram::from_buckets([(10, 5), (20, 2)]))
        );
        assert_eq!(results[0].status(), Status::Processed);
        assert_eq!(results[0].comment(), None);
    }

    #[tokio::test]
    async fn test_empty_cache_entry_fails_region() {
        let d = dispatcher(FakeCatalog::with_regions(&[7]), FakeExtractor::new(), &[]);

        let results = d.dispatch(&[7], tile_set(&["A"]), &Metrics::new()).await;
        assert_eq!(results[0].status(), Status::Failed);
        assert_eq!(results[0].comment().as_deref(), Some("no intersecting tiles"));
        assert!(results[0].histogram().is_none());
    }

    #[tokio::test]
    async fn test_failure_reasons() {
        let extractor = FakeExtractor::new()
            .respond("A", 1, TileResponse::Error("read timeout"))
            .respond("A", 3, TileResponse::counts(&[(1, 1)]));
        let catalog = FakeCatalog::with_regions(&[1, 2, 3]).with_broken(3);
        let d = dispatcher(
            catalog,
            extractor,
            &[(1, vec!["A"]), (2, vec!["A"]), (3, vec!["A"])],
        );

        let results = d.dispatch(&[1, 2, 3], tile_set(&["A"]), &Metrics::new()).await;
        assert_eq!(
            outcome_of(&results, 1),
            &RegionOutcome::Failed(RegionFailure::ExtractionFailure("read timeout".into()))
        );
        assert_eq!(
            outcome_of(&results, 2),
            &RegionOutcome::Failed(RegionFailure::NoImageryOverlap)
        );
        assert!(matches!(
            outcome_of(&results, 3),
            RegionOutcome::Failed(RegionFailure::GeometryUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_cached_tile_missing_from_imagery_is_skipped() {
        let extractor = FakeExtractor::new().respond("A", 1, TileResponse::counts(&[(3, 3)]));
        let d = dispatcher(FakeCatalog::with_regions(&[1]), extractor, &[(1, vec!["A", "Z"])]);

        let results = d.dispatch(&[1], tile_set(&["A"]), &Metrics::new()).await;
        assert_eq!(results[0].status(), Status::Processed);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_abort_siblings() {
        let extractor = FakeExtractor::new()
            .respond("A", 1, TileResponse::Panic)
            .respond("A", 2, TileResponse::counts(&[(8, 8)]));
        let d = dispatcher(
            FakeCatalog::with_regions(&[1, 2]),
            extractor,
            &[(1, vec!["A"]), (2, vec!["A"])],
        );

        let results = d.dispatch(&[1, 2], tile_set(&["A"]), &Metrics::new()).await;
        assert_eq!(results.len(), 2);
        assert!(matches!(
            outcome_of(&results, 1),
            RegionOutcome::Failed(RegionFailure::TaskAborted(_))
        ));
        assert_eq!(results.iter().filter(|r| r.status() == Status::Processed).count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_regions_bounded_by_pool_size() {
        let ids: Vec<RegionId> = (1..=8).collect();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entries: Vec<_> = ids.iter().map(|&id| (id, vec!["A".to_string()])).collect();
        store
            .replace_tile_cache(&entries, crate::temporal::TemporalKey::new(2024, 1).unwrap())
            .unwrap();

        let extractor = Arc::new(TrackingExtractor::default());
        let d = Dispatcher::new(
            Arc::new(FakeCatalog::with_regions(&ids)),
            extractor.clone(),
            Arc::new(TileCache::new(store, 64)),
            2,
        );

        let metrics = Metrics::new();
        let results = d.dispatch(&ids, tile_set(&["A"]), &metrics).await;

        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| r.status() == Status::Processed));
        let peak = extractor.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= d.pool_size(), "peak in-flight was {}", peak);
        assert_eq!(metrics.snapshot().regions_processed, 8);
    }
}

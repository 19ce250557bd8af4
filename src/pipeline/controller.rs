//! Run controller: drives chunk scheduling, dispatch and persistence for a temporal key.

use crate::catalog::{ImageryInventory, RegionCatalog, RegionExtractor, RegionId};
use crate::config::{Config, PollConfig};
use crate::error::{Error, Result};
use crate::index::{RebuildStats, TileCache};
use crate::pipeline::chunker::{next_chunk, ChunkBounds};
use crate::pipeline::dispatcher::{Dispatcher, RegionResult, TileSet};
use crate::pipeline::{Metrics, MetricsReporter};
use crate::store::{CompletionSummary, OverallStatus, OverallStatusReport, PersistStats, Store};
use crate::temporal::{Cadence, TemporalKey};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Lifecycle of an [`AggregationRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Complete,
}

/// Transient cursor over the region set of one (key, cadence).
///
/// Not persisted: a restarted run starts again from offset 0 and relies on idempotent writes.
#[derive(Debug, Clone)]
pub struct AggregationRun {
    pub key: TemporalKey,
    pub cadence: Cadence,
    pub total: usize,
    offset: usize,
    state: RunState,
}

impl AggregationRun {
    pub fn new(key: TemporalKey, cadence: Cadence, total: usize) -> Self {
        Self {
            key,
            cadence,
            total,
            offset: 0,
            state: RunState::NotStarted,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Advance the cursor by one chunk. `None` once the run is complete.
    pub fn next_chunk(&mut self, chunk_size: usize) -> Option<ChunkBounds> {
        if self.state == RunState::Complete {
            return None;
        }
        let chunk = next_chunk(Some(self.offset), self.total, chunk_size);
        self.offset = chunk.end;
        self.state = if chunk.completed {
            RunState::Complete
        } else {
            RunState::Running
        };
        Some(chunk)
    }
}

/// Counters of one completed run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunStats {
    pub total_regions: usize,
    pub processed: usize,
    pub failed: usize,
    pub chunks: usize,
    pub histogram_rows: usize,
    pub elapsed: Duration,
}

impl RunStats {
    fn record(&mut self, results: &[RegionResult], persisted: &PersistStats) {
        let processed = results.iter().filter(|r| r.histogram().is_some()).count();
        self.processed += processed;
        self.failed += results.len() - processed;
        self.histogram_rows += persisted.histogram_rows;
    }
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processed: {}, Failed: {}, Total: {}, Chunks: {}, Rows: {}, Elapsed: {:.1}s",
            self.processed,
            self.failed,
            self.total_regions,
            self.chunks,
            self.histogram_rows,
            self.elapsed.as_secs_f64()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// No imagery has arrived for the key; nothing was written.
    Skipped,
    Completed(RunStats),
}

/// Counters of a retry pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryStats {
    pub attempted: usize,
    pub recovered: usize,
    pub still_failed: usize,
    /// Keys whose failures were left alone because their imagery is gone.
    pub keys_skipped: usize,
}

/// Result of bounded status polling.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(CompletionSummary),
    /// Attempts ran out; holds the last summary seen.
    Exhausted(CompletionSummary),
}

/// Drives aggregation runs, retries and tile cache rebuilds.
pub struct RunController {
    config: Arc<Config>,
    store: Arc<Store>,
    catalog: Arc<dyn RegionCatalog>,
    inventory: Arc<dyn ImageryInventory>,
    extractor: Arc<dyn RegionExtractor>,
    tile_cache: Arc<TileCache>,
    dispatcher: Dispatcher,
    /// Counters of the most recent run or retry pass.
    metrics: Mutex<Arc<Metrics>>,
}

impl RunController {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        catalog: Arc<dyn RegionCatalog>,
        inventory: Arc<dyn ImageryInventory>,
        extractor: Arc<dyn RegionExtractor>,
    ) -> Self {
        let tile_cache = Arc::new(TileCache::new(
            store.clone(),
            config.processing.tile_cache_entries,
        ));
        let dispatcher = Dispatcher::new(
            catalog.clone(),
            extractor.clone(),
            tile_cache.clone(),
            config.processing.pool_size(),
        );

        Self {
            config: Arc::new(config),
            store,
            catalog,
            inventory,
            extractor,
            tile_cache,
            dispatcher,
            metrics: Mutex::new(Metrics::new()),
        }
    }

    pub fn tile_cache(&self) -> &Arc<TileCache> {
        &self.tile_cache
    }

    /// Metrics of the most recent run or retry pass.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start counting a new run from zero.
    fn fresh_metrics(&self) -> Arc<Metrics> {
        let metrics = Metrics::new();
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner) = metrics.clone();
        metrics
    }

    /// Run a blocking closure against the store off the async workers.
    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    async fn list_tiles(&self, key: TemporalKey, cadence: Cadence) -> Result<TileSet> {
        let inventory = self.inventory.clone();
        let tiles = tokio::task::spawn_blocking(move || inventory.list_tiles(key, cadence))
            .await?
            .map_err(|e| Error::RunInitialization(format!("imagery listing failed: {:#}", e)))?;
        Ok(tiles.into_iter().map(|t| (t.tile_id.clone(), t)).collect())
    }

    async fn region_ids(&self) -> Result<Vec<RegionId>> {
        let catalog = self.catalog.clone();
        tokio::task::spawn_blocking(move || catalog.all_region_ids())
            .await?
            .map_err(|e| Error::RunInitialization(format!("region catalog unavailable: {:#}", e)))
    }

    async fn region_count(&self) -> Result<usize> {
        let catalog = self.catalog.clone();
        tokio::task::spawn_blocking(move || catalog.count())
            .await?
            .map_err(Error::collaborator)
    }

    async fn persist(
        &self,
        key: TemporalKey,
        cadence: Cadence,
        results: Vec<RegionResult>,
        metrics: &Metrics,
    ) -> Result<(Vec<RegionResult>, PersistStats)> {
        let max_statements = self.config.processing.write_batch_size;
        let start = Instant::now();
        let (results, stats) = self
            .with_store(move |store| {
                let stats = store.persist_results(key, cadence, &results, max_statements)?;
                Ok((results, stats))
            })
            .await?;
        metrics.add_persist_time(start.elapsed());
        metrics.add_persisted(stats.histogram_rows as u64, stats.groups as u64);
        Ok((results, stats))
    }

    /// Aggregate every catalog region for one key.
    ///
    /// Returns [`RunOutcome::Skipped`] when no imagery exists for the key. Region failures are
    /// recorded as FAILED rows; only initialization and persistence errors abort the run.
    pub async fn start_run(&self, key: TemporalKey, cadence: Cadence) -> Result<RunOutcome> {
        let tiles = self.list_tiles(key, cadence).await?;
        if tiles.is_empty() {
            tracing::info!("No {} imagery for {}, skipping run", cadence, key);
            return Ok(RunOutcome::Skipped);
        }
        let tiles = Arc::new(tiles);
        let region_ids = self.region_ids().await?;

        let processing = &self.config.processing;
        let mut run = AggregationRun::new(key, cadence, region_ids.len());
        tracing::info!(
            "Starting {} run for {}: {} regions, {} tiles, chunks of {}, {} workers",
            cadence,
            key,
            run.total,
            tiles.len(),
            processing.chunk_size,
            self.dispatcher.pool_size()
        );

        let metrics = self.fresh_metrics();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if processing.enable_metrics {
            let reporter = MetricsReporter::new(
                metrics.clone(),
                processing.metrics_interval_secs,
                run.total as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let started = Instant::now();
        let mut stats = RunStats {
            total_regions: run.total,
            ..Default::default()
        };

        let outcome = async {
            while let Some(chunk) = run.next_chunk(processing.chunk_size) {
                let regions = &region_ids[chunk.start..chunk.end];
                tracing::debug!(
                    "{} {}: chunk [{}, {}) of {}",
                    cadence,
                    key,
                    chunk.start,
                    chunk.end,
                    run.total
                );

                let results = self.dispatcher.dispatch(regions, tiles.clone(), &metrics).await;
                let (results, persisted) = self.persist(key, cadence, results, &metrics).await?;
                stats.record(&results, &persisted);
                stats.chunks += 1;
            }
            Ok::<_, Error>(())
        }
        .await;

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }
        outcome?;

        stats.elapsed = started.elapsed();
        tracing::info!("{} run for {} complete: {}", cadence, key, stats);

        if processing.enable_metrics {
            MetricsReporter::new(metrics.clone(), processing.metrics_interval_secs, 0)
                .print_summary();
            if let Some(ref path) = processing.metrics_output_path {
                if let Err(e) = metrics.snapshot().save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        Ok(RunOutcome::Completed(stats))
    }

    /// Run every key from `start` to `end` inclusive, in order.
    pub async fn run_range(
        &self,
        start: TemporalKey,
        end: TemporalKey,
        cadence: Cadence,
    ) -> Result<Vec<(TemporalKey, RunOutcome)>> {
        let mut outcomes = Vec::new();
        for key in TemporalKey::range(start, end) {
            let outcome = self.start_run(key, cadence).await?;
            outcomes.push((key, outcome));
        }
        Ok(outcomes)
    }

    /// Re-run every region whose latest status is FAILED, one region per chunk.
    ///
    /// PROCESSED regions are never touched. Keys whose imagery is no longer listed are
    /// left as they are.
    pub async fn retry(&self, cadence: Cadence) -> Result<RetryStats> {
        let failed = self
            .with_store(move |store| store.failed_regions(cadence))
            .await?;

        let mut by_key: BTreeMap<TemporalKey, Vec<RegionId>> = BTreeMap::new();
        for (key, region_id) in failed {
            by_key.entry(key).or_default().push(region_id);
        }
        tracing::info!(
            "Retrying {} failed {} regions across {} keys",
            by_key.values().map(Vec::len).sum::<usize>(),
            cadence,
            by_key.len()
        );

        let metrics = self.fresh_metrics();
        let mut stats = RetryStats::default();
        for (key, regions) in by_key {
            let tiles = self.list_tiles(key, cadence).await?;
            if tiles.is_empty() {
                tracing::warn!(
                    "No {} imagery for {}, leaving {} failed regions",
                    cadence,
                    key,
                    regions.len()
                );
                stats.keys_skipped += 1;
                continue;
            }
            let tiles = Arc::new(tiles);

            for region_id in regions {
                let results = self
                    .dispatcher
                    .dispatch(std::slice::from_ref(&region_id), tiles.clone(), &metrics)
                    .await;
                let (results, _) = self.persist(key, cadence, results, &metrics).await?;

                stats.attempted += 1;
                if results.iter().all(|r| r.histogram().is_some()) {
                    stats.recovered += 1;
                } else {
                    stats.still_failed += 1;
                }
            }
        }

        tracing::info!(
            "Retry complete: {} attempted, {} recovered, {} still failed",
            stats.attempted,
            stats.recovered,
            stats.still_failed
        );
        Ok(stats)
    }

    /// Rebuild the region→tile cache from the daily imagery of `epoch`.
    pub async fn rebuild_tile_cache(&self, epoch: TemporalKey) -> Result<RebuildStats> {
        let tile_cache = self.tile_cache.clone();
        let catalog = self.catalog.clone();
        let inventory = self.inventory.clone();
        let extractor = self.extractor.clone();
        let threads = self.config.processing.pool_size();

        tokio::task::spawn_blocking(move || {
            tile_cache.rebuild(
                catalog.as_ref(),
                inventory.as_ref(),
                extractor.as_ref(),
                epoch,
                threads,
            )
        })
        .await?
    }

    pub async fn completion_summary(
        &self,
        key: TemporalKey,
        cadence: Cadence,
    ) -> Result<CompletionSummary> {
        let total = self.region_count().await?;
        self.with_store(move |store| store.completion_summary(key, cadence, total))
            .await
    }

    pub async fn overall_status(
        &self,
        start: TemporalKey,
        end: TemporalKey,
        cadence: Cadence,
    ) -> Result<OverallStatusReport> {
        let total = self.region_count().await?;
        self.with_store(move |store| store.overall_status(start, end, cadence, total))
            .await
    }

    /// Poll until the key is COMPLETED or `status_poll.max_attempts` checks have been made.
    pub async fn wait_for_completion(
        &self,
        key: TemporalKey,
        cadence: Cadence,
    ) -> Result<PollOutcome> {
        let total = self.region_count().await?;
        poll_completion(
            self.store.clone(),
            total,
            key,
            cadence,
            &self.config.processing.status_poll,
        )
        .await
    }
}

/// Poll the completion summary of a key with exponential backoff.
///
/// Returns as soon as the key is COMPLETED, or with the last summary once
/// `poll.max_attempts` checks have been made.
pub async fn poll_completion(
    store: Arc<Store>,
    total: usize,
    key: TemporalKey,
    cadence: Cadence,
    poll: &PollConfig,
) -> Result<PollOutcome> {
    let mut backoff = poll.initial_backoff_ms;
    let mut attempt = 0;

    loop {
        let summary = {
            let store = store.clone();
            tokio::task::spawn_blocking(move || store.completion_summary(key, cadence, total))
                .await??
        };
        attempt += 1;

        if summary.overall_status == OverallStatus::Completed {
            return Ok(PollOutcome::Completed(summary));
        }
        if attempt >= poll.max_attempts {
            tracing::warn!(
                "{} {} not complete after {} checks: {}",
                cadence,
                key,
                attempt,
                summary
            );
            return Ok(PollOutcome::Exhausted(summary));
        }

        tracing::debug!("{}, checking again in {}ms", summary, backoff);
        tokio::time::sleep(Duration::from_millis(backoff)).await;
        backoff = (backoff * 2).min(poll.max_backoff_ms);
    }
}

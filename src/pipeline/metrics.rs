//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for aggregation runs.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Regions that ended PROCESSED
    pub regions_processed: AtomicU64,

    /// Regions that ended FAILED
    pub regions_failed: AtomicU64,

    /// Tiles that returned bucket counts
    pub tiles_extracted: AtomicU64,

    /// Tiles that raised an extraction error
    pub tile_failures: AtomicU64,

    /// Chunks handed to the dispatcher
    pub chunks_dispatched: AtomicU64,

    /// Histogram rows written
    pub histogram_rows_written: AtomicU64,

    /// Write groups committed
    pub groups_committed: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    /// Time spent in extraction calls (microseconds, summed across workers)
    pub extract_us: AtomicU64,

    /// Time spent persisting chunks (microseconds)
    pub persist_us: AtomicU64,

    /// Tile cache lookups served from memory
    pub tile_cache_hits: AtomicU64,

    /// Tile cache lookups that went to the store
    pub tile_cache_misses: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_region_processed(&self) {
        self.regions_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_region_failed(&self) {
        self.regions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tile_extracted(&self) {
        self.tiles_extracted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tile_failure(&self) {
        self.tile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_dispatched(&self) {
        self.chunks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed persistence call.
    pub fn add_persisted(&self, histogram_rows: u64, groups: u64) {
        self.histogram_rows_written
            .fetch_add(histogram_rows, Ordering::Relaxed);
        self.groups_committed.fetch_add(groups, Ordering::Relaxed);
    }

    pub fn add_extract_time(&self, duration: Duration) {
        self.extract_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_persist_time(&self, duration: Duration) {
        self.persist_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_tile_cache_hit(&self) {
        self.tile_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tile_cache_miss(&self) {
        self.tile_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Regions finished (either outcome) per second.
    pub fn regions_per_second(&self) -> f64 {
        let regions = self.regions_processed.load(Ordering::Relaxed)
            + self.regions_failed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            regions as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            regions_processed: self.regions_processed.load(Ordering::Relaxed),
            regions_failed: self.regions_failed.load(Ordering::Relaxed),
            tiles_extracted: self.tiles_extracted.load(Ordering::Relaxed),
            tile_failures: self.tile_failures.load(Ordering::Relaxed),
            chunks_dispatched: self.chunks_dispatched.load(Ordering::Relaxed),
            histogram_rows_written: self.histogram_rows_written.load(Ordering::Relaxed),
            groups_committed: self.groups_committed.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            regions_per_second: self.regions_per_second(),
            extract_secs: self.extract_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            persist_secs: self.persist_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            tile_cache_hits: self.tile_cache_hits.load(Ordering::Relaxed),
            tile_cache_misses: self.tile_cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub regions_processed: u64,
    pub regions_failed: u64,
    pub tiles_extracted: u64,
    pub tile_failures: u64,
    pub chunks_dispatched: u64,
    pub histogram_rows_written: u64,
    pub groups_committed: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub regions_per_second: f64,
    /// Extraction time in seconds, summed across workers
    pub extract_secs: f64,
    /// Persistence time in seconds
    pub persist_secs: f64,
    pub tile_cache_hits: u64,
    pub tile_cache_misses: u64,
}

impl MetricsSnapshot {
    /// Regions finished with either outcome.
    pub fn regions_done(&self) -> u64 {
        self.regions_processed + self.regions_failed
    }

    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lookups = self.tile_cache_hits + self.tile_cache_misses;
        let cache_hit_rate = if lookups > 0 {
            self.tile_cache_hits as f64 / lookups as f64 * 100.0
        } else {
            0.0
        };

        write!(
            f,
            "Regions: {} processed, {} failed | Tiles: {} extracted, {} errors | \
             Chunks: {} | Rows: {} in {} groups | Rate: {:.1} regions/s | \
             Extract {:.1}s | Persist {:.1}s | Cache: {:.0}% | Elapsed: {:.1}s",
            self.regions_processed,
            self.regions_failed,
            self.tiles_extracted,
            self.tile_failures,
            self.chunks_dispatched,
            self.histogram_rows_written,
            self.groups_committed,
            self.regions_per_second,
            self.extract_secs,
            self.persist_secs,
            cache_hit_rate,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_regions: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_regions: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_regions,
        }
    }

    /// Log progress every interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_regions > 0 {
                        snapshot.regions_done() as f64 / self.total_regions as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Aggregation Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Regions processed: {}", snapshot.regions_processed);
        println!("Regions failed: {}", snapshot.regions_failed);
        println!("Chunks dispatched: {}", snapshot.chunks_dispatched);
        println!(
            "Tiles extracted: {} ({} errors)",
            snapshot.tiles_extracted, snapshot.tile_failures
        );
        println!(
            "Histogram rows written: {} in {} groups",
            snapshot.histogram_rows_written, snapshot.groups_committed
        );
        println!("Processing rate: {:.1} regions/s", snapshot.regions_per_second);

        let total = snapshot.extract_secs + snapshot.persist_secs;
        if total > 0.0 {
            println!("\n--- Time Breakdown ---");
            println!(
                "Extraction: {:>7.1}s ({:>5.1}%)",
                snapshot.extract_secs,
                snapshot.extract_secs / total * 100.0
            );
            println!(
                "Persistence:{:>7.1}s ({:>5.1}%)",
                snapshot.persist_secs,
                snapshot.persist_secs / total * 100.0
            );
        }
        println!("===========================\n");
    }
}

//! Waterbody Aggregation Engine
//!
//! Incremental aggregation of satellite-derived pixel classes into per-waterbody histograms,
//! one observation cycle at a time, for catalogs of many thousands of regions.
//!
//! # Architecture
//!
//! - **Catalog**: region catalog, imagery inventory and region extractor collaborators
//! - **Index**: persistent region→tile cache, rebuilt once per imagery layout
//! - **Store**: SQLite status rows, histogram rows and tile cache
//! - **Pipeline**: chunk scheduling, bounded parallel dispatch, retries and run control
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use waterbody_agg::{build_controller, Cadence, Config, RegionExtractor, TemporalKey};
//!
//! async fn run(extractor: Arc<dyn RegionExtractor>) -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let controller = build_controller(config, extractor)?;
//!     let key = TemporalKey::new(2024, 150)?;
//!     controller.start_run(key, Cadence::Daily).await?;
//!     controller.retry(Cadence::Daily).await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod histogram;
pub mod index;
pub mod pipeline;
pub mod store;
pub mod temporal;

#[cfg(test)]
pub(crate) mod test_support;

pub use catalog::{
    DirectoryInventory, Extraction, GeoJsonCatalog, ImageryInventory, ImageryTile, Region,
    RegionCatalog, RegionExtractor, RegionId,
};
pub use config::Config;
pub use error::{Error, RegionFailure};
pub use histogram::Histogram;
pub use index::TileCache;
pub use pipeline::{Metrics, PollOutcome, RunController, RunOutcome};
pub use store::{CompletionSummary, OverallStatus, Status, Store};
pub use temporal::{Cadence, TemporalKey};

use anyhow::Result;
use std::sync::Arc;

/// Wire the file-backed collaborators from `config` around `extractor`.
pub fn build_controller(
    config: Config,
    extractor: Arc<dyn RegionExtractor>,
) -> Result<RunController> {
    config.validate()?;

    let store = Arc::new(Store::open(&config.database.path)?);
    tracing::info!("Loading region catalog from {}", config.catalog.path);
    let catalog = Arc::new(GeoJsonCatalog::from_file(&config.catalog)?);
    let inventory = Arc::new(DirectoryInventory::new(&config.imagery));

    Ok(RunController::new(config, store, catalog, inventory, extractor))
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

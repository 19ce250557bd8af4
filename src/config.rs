//! Configuration for the aggregation engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration, passed explicitly to the store, collaborators and controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Persistence configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Imagery inventory configuration
    pub imagery: ImageryConfig,

    /// Region catalog configuration
    pub catalog: CatalogConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// SQLite database holding status, histogram and tile cache tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Where imagery tiles live and how their file names are built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageryConfig {
    /// Directory containing the GeoTIFF tiles
    pub image_dir: String,

    /// Product suffix of daily composites
    #[serde(default = "default_daily_product")]
    pub daily_product: String,

    /// Product suffix of weekly composites
    #[serde(default = "default_weekly_product")]
    pub weekly_product: String,
}

/// GeoJSON file with one feature per region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub path: String,

    /// Feature property holding the region id
    #[serde(default = "default_id_property")]
    pub id_property: String,

    /// CRS assumed when the file does not declare one
    #[serde(default = "default_crs")]
    pub default_crs: String,
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Regions per chunk; bounds peak memory of a run
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Fixed worker pool size. When unset, available cores minus `reserve_workers`.
    #[serde(default)]
    pub worker_pool_size: Option<usize>,

    /// Cores left free when deriving the pool size
    #[serde(default = "default_reserve_workers")]
    pub reserve_workers: usize,

    /// Maximum statements per write transaction
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,

    /// Entries held in the in-memory front of the tile cache
    #[serde(default = "default_tile_cache_entries")]
    pub tile_cache_entries: usize,

    /// Enable periodic progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after a run
    #[serde(default)]
    pub metrics_output_path: Option<String>,

    /// Bounded polling of completion status
    #[serde(default)]
    pub status_poll: PollConfig,
}

impl ProcessingConfig {
    /// Effective worker pool size: the override if set, otherwise
    /// `max(available cores - reserve_workers, 2)`.
    pub fn pool_size(&self) -> usize {
        if let Some(size) = self.worker_pool_size {
            return size.max(1);
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        cores.saturating_sub(self.reserve_workers).max(2)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2000,
            worker_pool_size: None,
            reserve_workers: 2,
            write_batch_size: 400,
            tile_cache_entries: 10_000,
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
            status_poll: PollConfig::default(),
        }
    }
}

/// Exponential backoff for status polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Maximum number of status checks
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.path.is_empty() {
            anyhow::bail!("database.path must be set");
        }
        if self.imagery.image_dir.is_empty() {
            anyhow::bail!("imagery.image_dir must be set");
        }
        if self.catalog.path.is_empty() {
            anyhow::bail!("catalog.path must be set");
        }
        if self.processing.chunk_size == 0 {
            anyhow::bail!("Chunk size must be > 0");
        }
        if self.processing.worker_pool_size == Some(0) {
            anyhow::bail!("Worker pool size must be > 0");
        }
        if self.processing.write_batch_size < 3 {
            anyhow::bail!(
                "Write batch size must be >= 3 (status upsert, histogram delete, one histogram row)"
            );
        }
        if self.processing.tile_cache_entries == 0 {
            anyhow::bail!("Tile cache entries must be > 0");
        }
        if self.processing.status_poll.max_attempts == 0 {
            anyhow::bail!("status_poll.max_attempts must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_database_path() -> String { "waterbody-data.sqlite".to_string() }
fn default_daily_product() -> String { "L3m_DAY_CYAN_CI_cyano_CYAN_CONUS_300m".to_string() }
fn default_weekly_product() -> String { "L3m_7D_CYAN_CI_cyano_CYAN_CONUS_300m".to_string() }
fn default_id_property() -> String { "OBJECTID".to_string() }
fn default_crs() -> String { "EPSG:4326".to_string() }
fn default_chunk_size() -> usize { 2000 }
fn default_reserve_workers() -> usize { 2 }
fn default_write_batch_size() -> usize { 400 }
fn default_tile_cache_entries() -> usize { 10_000 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_max_attempts() -> usize { 60 }
fn default_initial_backoff_ms() -> u64 { 1000 }
fn default_max_backoff_ms() -> u64 { 60_000 }

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
imagery:
  image_dir: "/data/images"
catalog:
  path: "/data/waterbodies.geojson"
"#
    }

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(config.database.path, "waterbody-data.sqlite");
        assert_eq!(config.processing.chunk_size, 2000);
        assert_eq!(config.processing.write_batch_size, 400);
        assert_eq!(config.catalog.id_property, "OBJECTID");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_size_override_and_floor() {
        let mut processing = ProcessingConfig::default();
        processing.worker_pool_size = Some(6);
        assert_eq!(processing.pool_size(), 6);

        processing.worker_pool_size = None;
        processing.reserve_workers = 10_000;
        assert_eq!(processing.pool_size(), 2);
    }

    #[test]
    fn test_validation_rejects_zero_chunk_size() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.processing.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_batch_smaller_than_one_region() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.processing.write_batch_size = 2;
        assert!(config.validate().is_err());
        config.processing.write_batch_size = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip_keeps_processing() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.processing.worker_pool_size = Some(4);
        let yaml = config.to_yaml().unwrap();
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.processing.worker_pool_size, Some(4));
    }
}

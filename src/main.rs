//! Waterbody Aggregation CLI
//!
//! Inspects and maintains the aggregation database. Runs, retries and tile cache rebuilds
//! need a region extractor and are driven through the library.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use waterbody_agg::catalog::RegionCatalog;
use waterbody_agg::pipeline::{poll_completion, PollOutcome};
use waterbody_agg::store::HistogramFilter;
use waterbody_agg::{build_runtime, Cadence, Config, GeoJsonCatalog, Store, TemporalKey, TileCache};

#[derive(Parser)]
#[command(name = "waterbody-agg")]
#[command(about = "Inspect and maintain waterbody aggregation results", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Completion summary of one day
    Status {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        day: u32,
        #[arg(long, default_value = "daily")]
        cadence: Cadence,
    },

    /// Completion of every day in an inclusive range
    OverallStatus {
        #[arg(long)]
        start_year: i32,
        #[arg(long)]
        start_day: u32,
        #[arg(long)]
        end_year: i32,
        #[arg(long)]
        end_day: u32,
        #[arg(long, default_value = "daily")]
        cadence: Cadence,
    },

    /// Poll a day until it completes or the configured attempts run out
    Wait {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        day: u32,
        #[arg(long, default_value = "daily")]
        cadence: Cadence,
    },

    /// List regions whose latest status is FAILED
    Failed {
        #[arg(long, default_value = "daily")]
        cadence: Cadence,
    },

    /// Stored histograms of one region
    Histogram {
        #[arg(long)]
        region: i64,
        #[arg(long, default_value = "daily")]
        cadence: Cadence,
        /// First key as YEAR:DAY
        #[arg(long, value_parser = parse_key)]
        start: Option<TemporalKey>,
        /// Last key as YEAR:DAY
        #[arg(long, value_parser = parse_key)]
        end: Option<TemporalKey>,
        /// Bucket ranges START:END (end exclusive), e.g. --range 0:1 --range 1:254
        #[arg(long = "range", value_parser = parse_range)]
        ranges: Vec<(usize, usize)>,
    },

    /// Show the cached tiles of a region, or cache coverage when no region is given
    Tiles {
        #[arg(long)]
        region: Option<i64>,
    },

    /// Create the database schema
    Init,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn parse_key(s: &str) -> std::result::Result<TemporalKey, String> {
    let (year, day) = s
        .split_once(':')
        .ok_or_else(|| format!("expected YEAR:DAY, got '{}'", s))?;
    let year = year.parse().map_err(|_| format!("invalid year '{}'", year))?;
    let day = day.parse().map_err(|_| format!("invalid day '{}'", day))?;
    TemporalKey::new(year, day).map_err(|e| e.to_string())
}

fn parse_range(s: &str) -> std::result::Result<(usize, usize), String> {
    let (start, end) = s
        .split_once(':')
        .ok_or_else(|| format!("expected START:END, got '{}'", s))?;
    let start: usize = start.parse().map_err(|_| format!("invalid start '{}'", start))?;
    let end: usize = end.parse().map_err(|_| format!("invalid end '{}'", end))?;
    if start >= end || end > 256 {
        return Err(format!("range {} must satisfy start < end <= 256", s));
    }
    Ok((start, end))
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status { year, day, cadence } => {
            let (config, store) = open(&cli.config)?;
            let total = region_count(&config)?;
            let summary = store.completion_summary(TemporalKey::new(year, day)?, cadence, total)?;
            print(cli.json, &summary, |s| println!("{}", s))?;
        }

        Commands::OverallStatus {
            start_year,
            start_day,
            end_year,
            end_day,
            cadence,
        } => {
            let (config, store) = open(&cli.config)?;
            let total = region_count(&config)?;
            let start = TemporalKey::new(start_year, start_day)?;
            let end = TemporalKey::new(end_year, end_day)?;
            let report = store.overall_status(start, end, cadence, total)?;
            print(cli.json, &report, |r| {
                for day in &r.days {
                    println!("{}", day);
                }
                println!("Overall: {}", r.overall_status);
            })?;
        }

        Commands::Wait { year, day, cadence } => {
            wait_command(&cli.config, cli.json, TemporalKey::new(year, day)?, cadence)?;
        }

        Commands::Failed { cadence } => {
            let (_, store) = open(&cli.config)?;
            let failed = store.failed_regions(cadence)?;
            print(cli.json, &failed, |rows| {
                for (key, region_id) in rows {
                    println!("{}\t{}", key, region_id);
                }
                println!("{} failed {} regions", rows.len(), cadence);
            })?;
        }

        Commands::Histogram {
            region,
            cadence,
            start,
            end,
            ranges,
        } => {
            let (_, store) = open(&cli.config)?;
            let filter = HistogramFilter { start, end };
            let ranges = (!ranges.is_empty()).then_some(ranges.as_slice());
            let histograms = store.region_histograms(region, cadence, filter, ranges)?;
            print(cli.json, &histograms, |rows| {
                for h in rows {
                    let counts: Vec<String> = h.counts.iter().map(|c| c.to_string()).collect();
                    println!("{}\t{}", h.key, counts.join(","));
                }
            })?;
        }

        Commands::Tiles { region } => {
            let (config, store) = open(&cli.config)?;
            let store = Arc::new(store);
            match region {
                Some(region_id) => {
                    let tiles = store.cached_tiles(region_id)?;
                    print(cli.json, &tiles, |tiles| {
                        if tiles.is_empty() {
                            println!("Region {} has no cached tiles", region_id);
                        } else {
                            println!("Region {}: {}", region_id, tiles.join(" "));
                        }
                    })?;
                }
                None => {
                    let total = region_count(&config)?;
                    let cache = TileCache::new(store, config.processing.tile_cache_entries);
                    println!("{}", cache.coverage_stats(total)?);
                }
            }
        }

        Commands::Init => {
            let config = load_config(&cli.config)?;
            Store::open(&config.database.path)?;
            println!("Initialized database at {}", config.database.path);
        }

        Commands::Validate => {
            load_config(&cli.config)?;
            println!("Configuration is valid");
        }

        Commands::GenerateConfig { output } => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let config = Config::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn open(path: &PathBuf) -> Result<(Config, Store)> {
    let config = load_config(path)?;
    let store = Store::open(&config.database.path)?;
    Ok((config, store))
}

fn region_count(config: &Config) -> Result<usize> {
    GeoJsonCatalog::from_file(&config.catalog)?.count()
}

fn print<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

fn wait_command(config_path: &PathBuf, json: bool, key: TemporalKey, cadence: Cadence) -> Result<()> {
    let (config, store) = open(config_path)?;
    let total = region_count(&config)?;
    let store = Arc::new(store);

    let runtime = build_runtime(Some(1))?;
    let outcome = runtime.block_on(poll_completion(
        store,
        total,
        key,
        cadence,
        &config.processing.status_poll,
    ))?;

    let (summary, completed) = match outcome {
        PollOutcome::Completed(summary) => (summary, true),
        PollOutcome::Exhausted(summary) => (summary, false),
    };
    print(json, &summary, |s| println!("{}", s))?;
    if !completed {
        anyhow::bail!("{} {} did not complete", cadence, key);
    }
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = r#"# Waterbody Aggregation Configuration

# === DATABASE: status, histogram and tile cache tables ===
database:
  path: "waterbody-data.sqlite"

# === IMAGERY: where composite tiles are listed from ===
imagery:
  # Directory holding the GeoTIFF tiles
  image_dir: "/data/images"

  # File names are L{year}{day:03}.{daily_product}_{row}_{col}.tif for daily composites
  daily_product: "L3m_DAY_CYAN_CI_cyano_CYAN_CONUS_300m"

  # and L{year}{day:03}{end_year}{end_day:03}.{weekly_product}_{row}_{col}.tif for weekly
  weekly_product: "L3m_7D_CYAN_CI_cyano_CYAN_CONUS_300m"

# === CATALOG: waterbody polygons ===
catalog:
  path: "/data/waterbodies.geojson"

  # Feature property holding the region id
  id_property: "OBJECTID"

  # CRS used when the file does not declare one
  default_crs: "EPSG:4326"

# === PROCESSING: tuning ===
processing:
  # Regions per chunk
  chunk_size: 2000

  # Fixed worker pool size (default: available cores minus reserve_workers, at least 2)
  # worker_pool_size: 8
  reserve_workers: 2

  # Maximum statements per write transaction
  write_batch_size: 400

  # Regions held in the in-memory tile cache front
  tile_cache_entries: 10000

  # Log progress during runs
  enable_metrics: true
  metrics_interval_secs: 10
  # metrics_output_path: "metrics.json"

  # Bounded completion polling
  status_poll:
    max_attempts: 60
    initial_backoff_ms: 1000
    max_backoff_ms: 60000
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_status() {
        let cli = Cli::try_parse_from([
            "waterbody-agg", "status", "--year", "2024", "--day", "100", "--cadence", "weekly",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Status {
                year: 2024,
                day: 100,
                cadence: Cadence::Weekly
            }
        ));
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["waterbody-agg", "-c", "other.yaml", "validate"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_histogram_ranges() {
        let cli = Cli::try_parse_from([
            "waterbody-agg", "histogram", "--region", "42", "--start", "2024:366", "--range",
            "0:1", "--range", "1:254",
        ])
        .unwrap();
        let Commands::Histogram { start, ranges, .. } = cli.command else {
            panic!("expected histogram command");
        };
        assert_eq!(start, Some(TemporalKey::new(2024, 366).unwrap()));
        assert_eq!(ranges, vec![(0, 1), (1, 254)]);
    }

    #[test]
    fn test_parse_key_rejects_invalid_day() {
        assert!(parse_key("2023:366").is_err());
        assert!(parse_key("2024").is_err());
    }

    #[test]
    fn test_parse_range_bounds() {
        assert_eq!(parse_range("254:256").unwrap(), (254, 256));
        assert!(parse_range("10:10").is_err());
        assert!(parse_range("0:300").is_err());
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.processing.write_batch_size, 400);
    }
}

//! Imagery inventory backed by a directory of GeoTIFF tiles.
//!
//! File names follow the composite naming of the imagery provider:
//!
//! - daily:  `L{year}{day:03}.{daily_product}_{row}_{col}.tif`
//! - weekly: `L{year0}{day0:03}{year1}{day1:03}.{weekly_product}_{row}_{col}.tif`
//!
//! where the weekly window spans seven days starting at the key. The tile id is the last two
//! `_`-separated parts of the file stem.

use super::{ImageryInventory, ImageryTile};
use crate::config::ImageryConfig;
use crate::temporal::{Cadence, TemporalKey};
use anyhow::{Context, Result};
use std::path::PathBuf;

pub struct DirectoryInventory {
    image_dir: PathBuf,
    daily_product: String,
    weekly_product: String,
}

impl DirectoryInventory {
    pub fn new(config: &ImageryConfig) -> Self {
        Self {
            image_dir: PathBuf::from(&config.image_dir),
            daily_product: config.daily_product.clone(),
            weekly_product: config.weekly_product.clone(),
        }
    }

    /// Product base name shared by every tile of one composite.
    pub fn base_name(&self, key: TemporalKey, cadence: Cadence) -> Result<String> {
        match cadence {
            Cadence::Daily => Ok(format!(
                "L{}{:03}.{}",
                key.year(),
                key.day(),
                self.daily_product
            )),
            Cadence::Weekly => {
                let (start, end) = key.weekly_window()?;
                Ok(format!(
                    "L{}{:03}{}{:03}.{}",
                    start.year(),
                    start.day(),
                    end.year(),
                    end.day(),
                    self.weekly_product
                ))
            }
        }
    }
}

/// Tile id from a file name, e.g. `..._300m_1_2.tif` → `1_2`.
fn tile_id(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".tif")?;
    let mut parts = stem.rsplitn(3, '_');
    let col = parts.next()?;
    let row = parts.next()?;
    parts.next()?;
    Some(format!("{}_{}", row, col))
}

impl ImageryInventory for DirectoryInventory {
    fn list_tiles(&self, key: TemporalKey, cadence: Cadence) -> Result<Vec<ImageryTile>> {
        let base = self.base_name(key, cadence)?;
        let entries = std::fs::read_dir(&self.image_dir)
            .with_context(|| format!("Failed to read image directory {}", self.image_dir.display()))?;

        let mut tiles = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(&base) || !name.ends_with(".tif") {
                continue;
            }
            match tile_id(name) {
                Some(tile_id) => tiles.push(ImageryTile {
                    tile_id,
                    path: entry.path(),
                }),
                None => tracing::warn!("Skipping imagery file without tile position: {}", name),
            }
        }

        tiles.sort_by(|a, b| a.tile_id.cmp(&b.tile_id));
        tiles.dedup_by(|a, b| a.tile_id == b.tile_id);

        tracing::debug!("Found {} {} tiles for {}", tiles.len(), cadence, key);
        Ok(tiles)
    }
}

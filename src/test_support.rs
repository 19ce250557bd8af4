//! In-memory collaborators for unit tests.

use crate::catalog::{
    Extraction, Geometry, ImageryInventory, ImageryTile, Region, RegionCatalog, RegionExtractor,
    RegionId,
};
use crate::histogram::Histogram;
use crate::temporal::{Cadence, TemporalKey};
use anyhow::Result;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

pub struct FakeCatalog {
    ids: Vec<RegionId>,
    broken: HashSet<RegionId>,
}

impl FakeCatalog {
    pub fn with_regions(ids: &[RegionId]) -> Self {
        Self {
            ids: ids.to_vec(),
            broken: HashSet::new(),
        }
    }

    /// Make `region()` fail for `id`.
    pub fn with_broken(mut self, id: RegionId) -> Self {
        self.broken.insert(id);
        self
    }
}

impl RegionCatalog for FakeCatalog {
    fn all_region_ids(&self) -> Result<Vec<RegionId>> {
        Ok(self.ids.clone())
    }

    fn region(&self, id: RegionId) -> Result<Region> {
        if self.broken.contains(&id) || !self.ids.contains(&id) {
            anyhow::bail!("invalid geometry for region {}", id);
        }
        Ok(Region {
            id,
            geometry: Geometry::Polygon(json!([[[0, 0], [1, 0], [1, 1], [0, 0]]])),
            crs: "EPSG:4326".to_string(),
        })
    }
}

#[derive(Default)]
pub struct FakeInventory {
    tiles: HashMap<(TemporalKey, Cadence), Vec<ImageryTile>>,
    failing: bool,
}

impl FakeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tiles(mut self, key: TemporalKey, cadence: Cadence, ids: &[&str]) -> Self {
        let tiles = ids
            .iter()
            .map(|id| ImageryTile {
                tile_id: id.to_string(),
                path: PathBuf::from(format!("/imagery/{}_{}.tif", key.day(), id)),
            })
            .collect();
        self.tiles.insert((key, cadence), tiles);
        self
    }

    /// Every listing returns an error.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }
}

impl ImageryInventory for FakeInventory {
    fn list_tiles(&self, key: TemporalKey, cadence: Cadence) -> Result<Vec<ImageryTile>> {
        if self.failing {
            anyhow::bail!("imagery directory unavailable");
        }
        Ok(self.tiles.get(&(key, cadence)).cloned().unwrap_or_default())
    }
}

#[derive(Clone)]
pub enum TileResponse {
    Counts(Histogram),
    NoOverlap,
    Error(&'static str),
    Panic,
}

impl TileResponse {
    pub fn counts(buckets: &[(u8, u64)]) -> Self {
        TileResponse::Counts(Histogram::from_buckets(buckets.iter().copied()))
    }
}

/// Scripted extractor keyed by (tile id, region id). Unscripted pairs do not overlap.
#[derive(Default)]
pub struct FakeExtractor {
    responses: Mutex<HashMap<(String, RegionId), TileResponse>>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, tile_id: &str, region_id: RegionId, response: TileResponse) -> Self {
        self.set(tile_id, region_id, response);
        self
    }

    /// Change a response after construction.
    pub fn set(&self, tile_id: &str, region_id: RegionId, response: TileResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert((tile_id.to_string(), region_id), response);
    }
}

impl RegionExtractor for FakeExtractor {
    fn extract(&self, tile: &ImageryTile, region: &Region) -> Result<Extraction> {
        let response = self
            .responses
            .lock()
            .unwrap()
            .get(&(tile.tile_id.clone(), region.id))
            .cloned()
            .unwrap_or(TileResponse::NoOverlap);

        match response {
            TileResponse::Counts(histogram) => Ok(Extraction::Counts(histogram)),
            TileResponse::NoOverlap => Ok(Extraction::NoOverlap),
            TileResponse::Error(reason) => anyhow::bail!("{}", reason),
            TileResponse::Panic => panic!("extractor crashed on tile {}", tile.tile_id),
        }
    }
}

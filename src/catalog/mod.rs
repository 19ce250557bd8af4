//! External collaborators: region catalog, imagery inventory and region extraction.
//!
//! The engine only talks to these through the traits below. File-backed implementations
//! of the catalog and inventory are provided; region extraction (clipping a raster tile to
//! a polygon and binning its pixels) is always supplied by the embedding application.

mod geojson;
mod inventory;

pub use geojson::GeoJsonCatalog;
pub use inventory::DirectoryInventory;

use crate::histogram::Histogram;
use crate::temporal::{Cadence, TemporalKey};
use anyhow::Result;
use std::path::PathBuf;

/// Stable region identifier (the catalog's OBJECTID).
pub type RegionId = i64;

/// Polygonal footprint of a region, as GeoJSON coordinate arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Polygon(serde_json::Value),
    MultiPolygon(serde_json::Value),
}

impl Geometry {
    /// Parse a GeoJSON geometry object. Only Polygon and MultiPolygon are accepted.
    pub fn from_geojson(value: &serde_json::Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow::anyhow!("geometry has no type"))?;
        let coordinates = value
            .get("coordinates")
            .filter(|c| c.is_array())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} geometry has no coordinates", kind))?;

        match kind {
            "Polygon" => Ok(Geometry::Polygon(coordinates)),
            "MultiPolygon" => Ok(Geometry::MultiPolygon(coordinates)),
            other => anyhow::bail!("unsupported geometry type {}", other),
        }
    }
}

/// A region handed to a single aggregation task.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: RegionId,
    pub geometry: Geometry,
    /// Coordinate reference system of `geometry`, e.g. "EPSG:5070".
    pub crs: String,
}

/// One raster tile of the imagery mosaic for a given cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageryTile {
    /// Tile position within the mosaic layout, e.g. "1_2".
    pub tile_id: String,
    pub path: PathBuf,
}

/// Result of clipping one tile to one region.
#[derive(Debug, Clone)]
pub enum Extraction {
    /// Bucket counts of the pixels inside the region.
    Counts(Histogram),
    /// The tile does not overlap the region.
    NoOverlap,
}

/// Source of regions and their geometries.
pub trait RegionCatalog: Send + Sync {
    /// Every region id, in a stable order.
    fn all_region_ids(&self) -> Result<Vec<RegionId>>;

    /// Geometry and CRS for one region.
    fn region(&self, id: RegionId) -> Result<Region>;

    /// Number of known regions. Used as the completion denominator.
    fn count(&self) -> Result<usize> {
        Ok(self.all_region_ids()?.len())
    }
}

/// Lists the imagery tiles available for an observation cycle.
pub trait ImageryInventory: Send + Sync {
    /// An empty list means no imagery has arrived for the cycle yet.
    fn list_tiles(&self, key: TemporalKey, cadence: Cadence) -> Result<Vec<ImageryTile>>;
}

/// Clips imagery tiles to region geometries.
///
/// Called from blocking worker threads, one call per (tile, region) pair. Implementations
/// may block on I/O.
pub trait RegionExtractor: Send + Sync {
    fn extract(&self, tile: &ImageryTile, region: &Region) -> Result<Extraction>;

    /// Whether the tile overlaps the region. Used by the tile cache rebuild.
    fn intersects(&self, tile: &ImageryTile, region: &Region) -> Result<bool> {
        Ok(matches!(self.extract(tile, region)?, Extraction::Counts(_)))
    }
}

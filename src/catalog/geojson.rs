//! Region catalog loaded from a GeoJSON FeatureCollection.

use super::{Geometry, Region, RegionCatalog, RegionId};
use crate::config::CatalogConfig;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;

/// In-memory catalog of waterbody polygons.
///
/// Features without a usable id are dropped at load time. Features whose geometry cannot be
/// used are kept, so they are still scheduled and end up FAILED with the parse reason.
pub struct GeoJsonCatalog {
    ids: Vec<RegionId>,
    geometries: HashMap<RegionId, std::result::Result<Geometry, String>>,
    crs: String,
}

impl GeoJsonCatalog {
    pub fn from_file(config: &CatalogConfig) -> Result<Self> {
        let contents = std::fs::read_to_string(&config.path)
            .with_context(|| format!("Failed to read region catalog {}", config.path))?;
        Self::from_str(&contents, &config.id_property, &config.default_crs)
    }

    pub fn from_str(contents: &str, id_property: &str, default_crs: &str) -> Result<Self> {
        let collection: Value = serde_json::from_str(contents)?;
        let features = collection
            .get("features")
            .and_then(|f| f.as_array())
            .ok_or_else(|| anyhow::anyhow!("catalog is not a FeatureCollection"))?;

        // Legacy GeoJSON CRS member: {"type": "name", "properties": {"name": "EPSG:5070"}}
        let crs = collection
            .pointer("/crs/properties/name")
            .and_then(|n| n.as_str())
            .unwrap_or(default_crs)
            .to_string();

        let mut ids = Vec::with_capacity(features.len());
        let mut geometries = HashMap::with_capacity(features.len());
        let mut skipped = 0usize;

        for feature in features {
            let Some(id) = feature
                .get("properties")
                .and_then(|p| p.get(id_property))
                .and_then(parse_id)
            else {
                skipped += 1;
                continue;
            };

            let geometry = match feature.get("geometry") {
                Some(value) if !value.is_null() => {
                    Geometry::from_geojson(value).map_err(|e| e.to_string())
                }
                _ => Err("feature has no geometry".to_string()),
            };

            if geometries.insert(id, geometry).is_none() {
                ids.push(id);
            } else {
                tracing::warn!("Duplicate region id {} in catalog, keeping the last geometry", id);
            }
        }

        if skipped > 0 {
            tracing::warn!("Skipped {} catalog features without a '{}' property", skipped, id_property);
        }
        tracing::info!("Loaded {} regions (crs {})", ids.len(), crs);

        Ok(Self {
            ids,
            geometries,
            crs,
        })
    }
}

fn parse_id(value: &Value) -> Option<RegionId> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl RegionCatalog for GeoJsonCatalog {
    fn all_region_ids(&self) -> Result<Vec<RegionId>> {
        Ok(self.ids.clone())
    }

    fn region(&self, id: RegionId) -> Result<Region> {
        match self.geometries.get(&id) {
            Some(Ok(geometry)) => Ok(Region {
                id,
                geometry: geometry.clone(),
                crs: self.crs.clone(),
            }),
            Some(Err(reason)) => anyhow::bail!("region {}: {}", id, reason),
            None => anyhow::bail!("region {} not in catalog", id),
        }
    }

    fn count(&self) -> Result<usize> {
        Ok(self.ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "type": "FeatureCollection",
        "crs": {"type": "name", "properties": {"name": "EPSG:5070"}},
        "features": [
            {"type": "Feature", "properties": {"OBJECTID": 7},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}},
            {"type": "Feature", "properties": {"OBJECTID": "42"},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[0,0],[1,0],[1,1],[0,0]]]]}},
            {"type": "Feature", "properties": {"OBJECTID": 9}, "geometry": null},
            {"type": "Feature", "properties": {"NAME": "no id"},
             "geometry": {"type": "Polygon", "coordinates": []}}
        ]
    }"#;

    #[test]
    fn test_load_preserves_order_and_crs() {
        let catalog = GeoJsonCatalog::from_str(CATALOG, "OBJECTID", "EPSG:4326").unwrap();
        assert_eq!(catalog.all_region_ids().unwrap(), vec![7, 42, 9]);
        assert_eq!(catalog.count().unwrap(), 3);

        let region = catalog.region(42).unwrap();
        assert_eq!(region.crs, "EPSG:5070");
        assert!(matches!(region.geometry, Geometry::MultiPolygon(_)));
    }

    #[test]
    fn test_unusable_geometry_is_an_error_per_region() {
        let catalog = GeoJsonCatalog::from_str(CATALOG, "OBJECTID", "EPSG:4326").unwrap();
        let err = catalog.region(9).unwrap_err();
        assert!(err.to_string().contains("no geometry"));
        assert!(catalog.region(1234).is_err());
    }

    #[test]
    fn test_default_crs_when_undeclared() {
        let contents = r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"OBJECTID": 1},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]}}
        ]}"#;
        let catalog = GeoJsonCatalog::from_str(contents, "OBJECTID", "EPSG:4326").unwrap();
        assert_eq!(catalog.region(1).unwrap().crs, "EPSG:4326");
    }
}

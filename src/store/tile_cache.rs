//! Region→tile association rows.

use super::Store;
use crate::catalog::RegionId;
use crate::error::Result;
use crate::temporal::TemporalKey;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

/// Imagery key the current tile cache was built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileCacheEpoch {
    pub key: TemporalKey,
    /// RFC 3339 build time
    pub built_at: String,
}

impl Store {
    /// Replace every tile cache row in one transaction and record the epoch.
    ///
    /// Regions with an empty tile list get no rows. Returns the number of rows written.
    pub fn replace_tile_cache(
        &self,
        entries: &[(RegionId, Vec<String>)],
        epoch: TemporalKey,
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM tile_cache", [])?;
        let mut rows = 0;
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO tile_cache (region_id, tile_id, position) VALUES (?1, ?2, ?3)",
            )?;
            for (region_id, tiles) in entries {
                for (position, tile_id) in tiles.iter().enumerate() {
                    rows += insert.execute(params![region_id, tile_id, position as i64])?;
                }
            }
        }

        tx.execute(
            "INSERT INTO tile_cache_epoch (id, year, day, built_at) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 year = excluded.year,
                 day = excluded.day,
                 built_at = excluded.built_at",
            params![epoch.year(), epoch.day(), chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        Ok(rows)
    }

    /// Cached tile ids of one region, in insertion order. Empty for unknown regions.
    pub fn cached_tiles(&self, region_id: RegionId) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT tile_id FROM tile_cache WHERE region_id = ?1 ORDER BY position",
        )?;
        let tiles = stmt
            .query_map(params![region_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(tiles)
    }

    /// Tile count per cached region.
    pub fn tile_counts(&self) -> Result<Vec<(RegionId, usize)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT region_id, COUNT(*) FROM tile_cache GROUP BY region_id ORDER BY region_id",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, RegionId>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    pub fn tile_cache_epoch(&self) -> Result<Option<TileCacheEpoch>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT year, day, built_at FROM tile_cache_epoch WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i32>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((year, day, built_at)) => Ok(Some(TileCacheEpoch {
                key: TemporalKey::new(year, day)?,
                built_at,
            })),
            None => Ok(None),
        }
    }
}

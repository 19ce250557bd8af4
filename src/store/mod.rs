//! SQLite persistence for status rows, histogram rows and the region→tile cache.
//!
//! All tables carry a `cadence` column, so daily and weekly tracks share one schema. The
//! connection sits behind a mutex; async callers go through `spawn_blocking`.

mod histogram;
mod status;
mod tile_cache;

pub use histogram::{HistogramFilter, PersistStats, RegionHistogram};
pub use status::{CompletionSummary, OverallStatus, OverallStatusReport, Status, StatusRecord};
pub use tile_cache::TileCacheEpoch;

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS status_records (
    year INTEGER NOT NULL,
    day INTEGER NOT NULL,
    cadence TEXT NOT NULL,
    region_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    comment TEXT,
    PRIMARY KEY (year, day, cadence, region_id)
);
CREATE INDEX IF NOT EXISTS idx_status_cadence_status ON status_records (cadence, status);

CREATE TABLE IF NOT EXISTS histogram_records (
    year INTEGER NOT NULL,
    day INTEGER NOT NULL,
    cadence TEXT NOT NULL,
    region_id INTEGER NOT NULL,
    bucket INTEGER NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (year, day, cadence, region_id, bucket)
);
CREATE INDEX IF NOT EXISTS idx_histogram_region ON histogram_records (region_id, cadence);

CREATE TABLE IF NOT EXISTS tile_cache (
    region_id INTEGER NOT NULL,
    tile_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (region_id, tile_id)
);

CREATE TABLE IF NOT EXISTS tile_cache_epoch (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    year INTEGER NOT NULL,
    day INTEGER NOT NULL,
    built_at TEXT NOT NULL
);
";

/// Handle to the aggregation database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        tracing::debug!("Opened aggregation store at {}", path.display());
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agg.sqlite");

        Store::open(&path).unwrap();
        let store = Store::open(&path).unwrap();

        let tables: i64 = store
            .conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}

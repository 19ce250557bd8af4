//! Per-region outcome rows and completion summaries.

use super::Store;
use crate::catalog::RegionId;
use crate::error::Result;
use crate::temporal::{Cadence, TemporalKey};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;

/// Persisted outcome of one region. A region with no row is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Processed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Processed => "PROCESSED",
            Status::Failed => "FAILED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSED" => Some(Status::Processed),
            "FAILED" => Some(Status::Failed),
            _ => None,
        }
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Status::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown status '{}'", s).into()))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRecord {
    pub key: TemporalKey,
    pub cadence: Cadence,
    pub region_id: RegionId,
    pub status: Status,
    /// RFC 3339 write time
    pub timestamp: String,
    pub comment: Option<String>,
}

/// Rollup of one (key, cadence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Completed,
    Incomplete,
    Failed,
    Unknown,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallStatus::Completed => "COMPLETED",
            OverallStatus::Incomplete => "INCOMPLETE",
            OverallStatus::Failed => "FAILED",
            OverallStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionSummary {
    pub key: TemporalKey,
    pub cadence: Cadence,
    /// Regions known to the catalog.
    pub total: usize,
    pub processed: usize,
    pub failed: Vec<RegionId>,
    /// `100 * processed / total`, rounded to two decimals.
    pub percent: f64,
    pub overall_status: OverallStatus,
}

impl CompletionSummary {
    pub fn new(
        key: TemporalKey,
        cadence: Cadence,
        total: usize,
        processed: usize,
        failed: Vec<RegionId>,
    ) -> Self {
        // Rows left behind by regions since removed from the catalog can push processed
        // past total.
        let percent = if total > 0 {
            (100.0 * processed.min(total) as f64 / total as f64 * 100.0).round() / 100.0
        } else {
            0.0
        };

        let attempted = processed + failed.len();
        let overall_status = if total == 0 || attempted == 0 {
            OverallStatus::Unknown
        } else if processed >= total {
            OverallStatus::Completed
        } else if failed.len() == attempted {
            OverallStatus::Failed
        } else {
            OverallStatus::Incomplete
        };

        Self {
            key,
            cadence,
            total,
            processed,
            failed,
            percent,
            overall_status,
        }
    }

    /// Regions with neither a PROCESSED nor a FAILED row.
    pub fn pending(&self) -> usize {
        self.total.saturating_sub(self.processed + self.failed.len())
    }
}

impl fmt::Display for CompletionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} ({}/{} processed, {:.2}%, {} failed, {} pending)",
            self.cadence,
            self.key,
            self.overall_status,
            self.processed,
            self.total,
            self.percent,
            self.failed.len(),
            self.pending()
        )
    }
}

/// Completion over an inclusive range of keys.
#[derive(Debug, Clone, Serialize)]
pub struct OverallStatusReport {
    pub days: Vec<CompletionSummary>,
    pub overall_status: OverallStatus,
}

impl OverallStatusReport {
    fn new(days: Vec<CompletionSummary>) -> Self {
        let all = |status: OverallStatus| {
            !days.is_empty() && days.iter().all(|d| d.overall_status == status)
        };
        let overall_status = if days.is_empty() || all(OverallStatus::Unknown) {
            OverallStatus::Unknown
        } else if all(OverallStatus::Completed) {
            OverallStatus::Completed
        } else if all(OverallStatus::Failed) {
            OverallStatus::Failed
        } else {
            OverallStatus::Incomplete
        };
        Self {
            days,
            overall_status,
        }
    }
}

pub(super) fn upsert_status_row(
    conn: &Connection,
    key: TemporalKey,
    cadence: Cadence,
    region_id: RegionId,
    status: Status,
    comment: Option<&str>,
    timestamp: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO status_records (year, day, cadence, region_id, status, timestamp, comment)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(year, day, cadence, region_id) DO UPDATE SET
             status = excluded.status,
             timestamp = excluded.timestamp,
             comment = excluded.comment",
        params![
            key.year(),
            key.day(),
            cadence.as_str(),
            region_id,
            status.as_str(),
            timestamp,
            comment
        ],
    )
}

fn summary_for(
    conn: &Connection,
    key: TemporalKey,
    cadence: Cadence,
    total: usize,
) -> Result<CompletionSummary> {
    let processed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM status_records
         WHERE year = ?1 AND day = ?2 AND cadence = ?3 AND status = 'PROCESSED'",
        params![key.year(), key.day(), cadence.as_str()],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare_cached(
        "SELECT region_id FROM status_records
         WHERE year = ?1 AND day = ?2 AND cadence = ?3 AND status = 'FAILED'
         ORDER BY region_id",
    )?;
    let failed = stmt
        .query_map(params![key.year(), key.day(), cadence.as_str()], |row| {
            row.get::<_, RegionId>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(CompletionSummary::new(
        key,
        cadence,
        total,
        processed as usize,
        failed,
    ))
}

impl Store {
    /// Insert or replace the status row for one region.
    pub fn upsert_status(
        &self,
        key: TemporalKey,
        cadence: Cadence,
        region_id: RegionId,
        status: Status,
        comment: Option<&str>,
    ) -> Result<()> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let conn = self.conn()?;
        upsert_status_row(&conn, key, cadence, region_id, status, comment, &timestamp)?;
        Ok(())
    }

    pub fn status_record(
        &self,
        key: TemporalKey,
        cadence: Cadence,
        region_id: RegionId,
    ) -> Result<Option<StatusRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT status, timestamp, comment FROM status_records
                 WHERE year = ?1 AND day = ?2 AND cadence = ?3 AND region_id = ?4",
                params![key.year(), key.day(), cadence.as_str(), region_id],
                |row| {
                    Ok(StatusRecord {
                        key,
                        cadence,
                        region_id,
                        status: row.get(0)?,
                        timestamp: row.get(1)?,
                        comment: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Completion of one key against a catalog of `total` regions.
    pub fn completion_summary(
        &self,
        key: TemporalKey,
        cadence: Cadence,
        total: usize,
    ) -> Result<CompletionSummary> {
        let conn = self.conn()?;
        summary_for(&conn, key, cadence, total)
    }

    /// Per-key completion for every key from `start` to `end` inclusive.
    pub fn overall_status(
        &self,
        start: TemporalKey,
        end: TemporalKey,
        cadence: Cadence,
        total: usize,
    ) -> Result<OverallStatusReport> {
        let conn = self.conn()?;
        let days = TemporalKey::range(start, end)
            .into_iter()
            .map(|key| summary_for(&conn, key, cadence, total))
            .collect::<Result<Vec<_>>>()?;
        Ok(OverallStatusReport::new(days))
    }

    /// Every (key, region) whose current status is FAILED, oldest key first.
    pub fn failed_regions(&self, cadence: Cadence) -> Result<Vec<(TemporalKey, RegionId)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT year, day, region_id FROM status_records
             WHERE cadence = ?1 AND status = 'FAILED'
             ORDER BY year, day, region_id",
        )?;
        let rows = stmt
            .query_map(params![cadence.as_str()], |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, RegionId>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(year, day, region_id)| Ok((TemporalKey::new(year, day)?, region_id)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(year: i32, day: u32) -> TemporalKey {
        TemporalKey::new(year, day).unwrap()
    }

    #[test]
    fn test_summary_rules() {
        let k = key(2024, 100);

        let done = CompletionSummary::new(k, Cadence::Daily, 3, 3, vec![]);
        assert_eq!(done.overall_status, OverallStatus::Completed);
        assert_eq!(done.percent, 100.0);

        let failed = CompletionSummary::new(k, Cadence::Daily, 3, 0, vec![1, 2]);
        assert_eq!(failed.overall_status, OverallStatus::Failed);

        let partial = CompletionSummary::new(k, Cadence::Daily, 3, 1, vec![2]);
        assert_eq!(partial.overall_status, OverallStatus::Incomplete);
        assert_eq!(partial.percent, 33.33);
        assert_eq!(partial.pending(), 1);

        let untouched = CompletionSummary::new(k, Cadence::Daily, 3, 0, vec![]);
        assert_eq!(untouched.overall_status, OverallStatus::Unknown);

        let empty = CompletionSummary::new(k, Cadence::Daily, 0, 0, vec![]);
        assert_eq!(empty.overall_status, OverallStatus::Unknown);
    }

    #[test]
    fn test_summary_after_catalog_shrank() {
        let k = key(2024, 100);
        let summary = CompletionSummary::new(k, Cadence::Daily, 3, 4, vec![]);
        assert_eq!(summary.overall_status, OverallStatus::Completed);
        assert_eq!(summary.percent, 100.0);
        assert_eq!(summary.pending(), 0);
    }

    #[test]
    fn test_upsert_replaces() {
        let store = Store::open_in_memory().unwrap();
        let k = key(2024, 5);

        store
            .upsert_status(k, Cadence::Daily, 7, Status::Failed, Some("no intersecting tiles"))
            .unwrap();
        store
            .upsert_status(k, Cadence::Daily, 7, Status::Processed, None)
            .unwrap();

        let record = store.status_record(k, Cadence::Daily, 7).unwrap().unwrap();
        assert_eq!(record.status, Status::Processed);
        assert_eq!(record.comment, None);
        assert!(store.status_record(k, Cadence::Weekly, 7).unwrap().is_none());
    }

    #[test]
    fn test_completion_summary_from_rows() {
        let store = Store::open_in_memory().unwrap();
        let k = key(2024, 5);
        store.upsert_status(k, Cadence::Daily, 1, Status::Processed, None).unwrap();
        store.upsert_status(k, Cadence::Daily, 2, Status::Failed, Some("x")).unwrap();
        store.upsert_status(k, Cadence::Weekly, 3, Status::Failed, Some("x")).unwrap();

        let summary = store.completion_summary(k, Cadence::Daily, 4).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, vec![2]);
        assert_eq!(summary.percent, 25.0);
        assert_eq!(summary.overall_status, OverallStatus::Incomplete);
    }

    #[test]
    fn test_overall_status_across_leap_year_end() {
        let store = Store::open_in_memory().unwrap();
        for k in [key(2024, 366), key(2025, 1), key(2025, 2)] {
            store.upsert_status(k, Cadence::Daily, 1, Status::Processed, None).unwrap();
        }

        let report = store
            .overall_status(key(2024, 366), key(2025, 2), Cadence::Daily, 1)
            .unwrap();
        let days: Vec<String> = report.days.iter().map(|d| d.key.to_string()).collect();
        assert_eq!(days, vec!["2024 366", "2025 1", "2025 2"]);
        assert_eq!(report.overall_status, OverallStatus::Completed);
    }

    #[test]
    fn test_failed_regions_by_cadence() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_status(key(2024, 6), Cadence::Daily, 9, Status::Failed, None).unwrap();
        store.upsert_status(key(2024, 5), Cadence::Daily, 8, Status::Failed, None).unwrap();
        store.upsert_status(key(2024, 5), Cadence::Daily, 1, Status::Processed, None).unwrap();
        store.upsert_status(key(2024, 5), Cadence::Weekly, 2, Status::Failed, None).unwrap();

        let failed = store.failed_regions(Cadence::Daily).unwrap();
        assert_eq!(failed, vec![(key(2024, 5), 8), (key(2024, 6), 9)]);
    }
}

//! Histogram fact rows: batched persistence of chunk results and per-region read-back.

use super::status::upsert_status_row;
use super::Store;
use crate::catalog::RegionId;
use crate::error::{Error, Result};
use crate::histogram::Histogram;
use crate::pipeline::RegionResult;
use crate::temporal::{Cadence, TemporalKey};
use rusqlite::{params, Connection};
use serde::Serialize;

/// Counters from one `persist_results` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistStats {
    pub regions: usize,
    pub status_rows: usize,
    pub histogram_rows: usize,
    pub groups: usize,
}

/// Optional inclusive key bounds for histogram read-back.
#[derive(Debug, Default, Clone, Copy)]
pub struct HistogramFilter {
    pub start: Option<TemporalKey>,
    pub end: Option<TemporalKey>,
}

/// Histogram of one region for one key.
///
/// `counts` has one entry per bucket, or one entry per requested range when ranges were given.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionHistogram {
    pub key: TemporalKey,
    pub counts: Vec<u64>,
}

/// Statements a region costs inside a write group: status upsert, histogram delete, and
/// one insert per non-zero bucket.
fn statement_cost(result: &RegionResult) -> usize {
    2 + result.histogram().map_or(0, Histogram::non_zero_len)
}

/// Statements executed and histogram rows written for one region.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RegionWrite {
    statements: usize,
    histogram_rows: usize,
}

/// Split results into consecutive groups of at most `max_statements` statements without
/// splitting a region. A region larger than the limit gets a group of its own.
fn write_groups(results: &[RegionResult], max_statements: usize) -> Vec<&[RegionResult]> {
    let mut groups = Vec::new();
    let mut start = 0;
    let mut cost = 0;

    for (i, result) in results.iter().enumerate() {
        let c = statement_cost(result);
        if i > start && cost + c > max_statements {
            groups.push(&results[start..i]);
            start = i;
            cost = 0;
        }
        cost += c;
    }
    if start < results.len() {
        groups.push(&results[start..]);
    }
    groups
}

fn key_ordinal(key: TemporalKey) -> i64 {
    i64::from(key.year()) * 1000 + i64::from(key.day())
}

fn write_region(
    conn: &Connection,
    key: TemporalKey,
    cadence: Cadence,
    result: &RegionResult,
    timestamp: &str,
) -> rusqlite::Result<RegionWrite> {
    let comment = result.comment();
    upsert_status_row(
        conn,
        key,
        cadence,
        result.region_id,
        result.status(),
        comment.as_deref(),
        timestamp,
    )?;

    conn.prepare_cached(
        "DELETE FROM histogram_records
         WHERE year = ?1 AND day = ?2 AND cadence = ?3 AND region_id = ?4",
    )?
    .execute(params![key.year(), key.day(), cadence.as_str(), result.region_id])?;

    let mut write = RegionWrite {
        statements: 2,
        histogram_rows: 0,
    };
    let Some(histogram) = result.histogram() else {
        return Ok(write);
    };

    let mut insert = conn.prepare_cached(
        "INSERT INTO histogram_records (year, day, cadence, region_id, bucket, count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (bucket, count) in histogram.non_zero() {
        insert.execute(params![
            key.year(),
            key.day(),
            cadence.as_str(),
            result.region_id,
            bucket,
            i64::try_from(count).unwrap_or(i64::MAX)
        ])?;
        write.statements += 1;
        write.histogram_rows += 1;
    }
    Ok(write)
}

impl Store {
    /// Persist a chunk of region results.
    ///
    /// Each region writes its status row, drops any previous histogram rows for the same
    /// key, then writes the non-zero buckets of a PROCESSED histogram. Regions are committed
    /// in groups of at most `max_statements` statements. If a group fails it is rolled back
    /// and the error reports how many regions were committed before it.
    pub fn persist_results(
        &self,
        key: TemporalKey,
        cadence: Cadence,
        results: &[RegionResult],
        max_statements: usize,
    ) -> Result<PersistStats> {
        let mut conn = self.conn()?;
        let mut stats = PersistStats::default();

        for group in write_groups(results, max_statements.max(1)) {
            let committed_regions = stats.regions;
            let persistence = |source| Error::Persistence {
                committed_regions,
                source,
            };

            let timestamp = chrono::Utc::now().to_rfc3339();
            let tx = conn.transaction().map_err(persistence)?;
            let mut histogram_rows = 0;
            for result in group {
                histogram_rows += write_region(&tx, key, cadence, result, &timestamp)
                    .map_err(persistence)?
                    .histogram_rows;
            }
            tx.commit().map_err(persistence)?;

            stats.regions += group.len();
            stats.status_rows += group.len();
            stats.histogram_rows += histogram_rows;
            stats.groups += 1;
            tracing::trace!(
                "Committed write group: {} regions, {} histogram rows",
                group.len(),
                histogram_rows
            );
        }

        Ok(stats)
    }

    /// Stored histograms of one region, oldest key first.
    ///
    /// With `ranges`, each histogram is collapsed to one sum per `[start, end)` bucket range.
    pub fn region_histograms(
        &self,
        region_id: RegionId,
        cadence: Cadence,
        filter: HistogramFilter,
        ranges: Option<&[(usize, usize)]>,
    ) -> Result<Vec<RegionHistogram>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT year, day, bucket, count FROM histogram_records
             WHERE region_id = ?1 AND cadence = ?2
               AND (year * 1000 + day) BETWEEN ?3 AND ?4
             ORDER BY year, day, bucket",
        )?;

        let lower = filter.start.map_or(i64::MIN, key_ordinal);
        let upper = filter.end.map_or(i64::MAX, key_ordinal);
        let rows = stmt
            .query_map(params![region_id, cadence.as_str(), lower, upper], |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u8>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut per_key: Vec<(TemporalKey, Histogram)> = Vec::new();
        for (year, day, bucket, count) in rows {
            let key = TemporalKey::new(year, day)?;
            if let Some((last, histogram)) = per_key.last_mut() {
                if *last == key {
                    histogram.add(bucket, count.max(0) as u64);
                    continue;
                }
            }
            per_key.push((key, Histogram::from_buckets([(bucket, count.max(0) as u64)])));
        }

        Ok(per_key
            .into_iter()
            .map(|(key, histogram)| RegionHistogram {
                key,
                counts: match ranges {
                    Some(ranges) => ranges
                        .iter()
                        .map(|&(start, end)| histogram.sum_range(start, end))
                        .collect(),
                    None => histogram.counts().to_vec(),
                },
            })
            .collect())
    }
}

//! SQLite persistence for resolved entities.
//!
//! Rows are keyed by `(source_name, canonical_key, record_fingerprint)`, so a
//! replayed batch merges into what is already there instead of duplicating it.
//! Every merge is a union/max/min, which makes the final table independent of
//! batch order and of how many times a batch was written.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::models::{pick_display_name, CanonicalEntity, PersistedRow};
use crate::retry::{Retriable, RetryError, RetryPolicy};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database is locked: {0}")]
    Busy(rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("failed to encode column: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => StoreError::Busy(e),
            _ => StoreError::Sqlite(e),
        }
    }
}

impl Retriable for StoreError {
    fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persisted_rows (
    source_name        TEXT NOT NULL,
    canonical_key      TEXT NOT NULL,
    record_fingerprint TEXT NOT NULL,
    display_name       TEXT NOT NULL,
    confidence         REAL NOT NULL,
    matched_reasons    TEXT NOT NULL,
    variants           TEXT NOT NULL,
    first_seen_unit    TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    PRIMARY KEY (source_name, canonical_key, record_fingerprint)
);
CREATE TABLE IF NOT EXISTS entities (
    source_name          TEXT NOT NULL,
    canonical_key        TEXT NOT NULL,
    display_name         TEXT NOT NULL,
    aggregate_confidence REAL NOT NULL,
    matched_reasons      TEXT NOT NULL,
    variants             TEXT NOT NULL,
    first_seen_unit      TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    PRIMARY KEY (source_name, canonical_key)
);
";

/// The mergeable part of both tables.
#[derive(Debug, Clone, PartialEq)]
struct Aggregate {
    confidence: f64,
    matched_reasons: BTreeSet<String>,
    variants: BTreeSet<String>,
    first_seen_unit: String,
}

impl Aggregate {
    fn of(row: &PersistedRow) -> Self {
        Self {
            confidence: row.confidence,
            matched_reasons: row.matched_reasons.iter().cloned().collect(),
            variants: row.variants.clone(),
            first_seen_unit: row.first_seen_unit.clone(),
        }
    }

    fn merged(&self, other: &Aggregate) -> Self {
        Self {
            confidence: self.confidence.max(other.confidence),
            matched_reasons: self.matched_reasons.union(&other.matched_reasons).cloned().collect(),
            variants: self.variants.union(&other.variants).cloned().collect(),
            first_seen_unit: self.first_seen_unit.clone().min(other.first_seen_unit.clone()),
        }
    }

    fn from_columns(
        confidence: f64,
        reasons: &str,
        variants: &str,
        first_seen_unit: String,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            confidence,
            matched_reasons: serde_json::from_str(reasons)?,
            variants: serde_json::from_str(variants)?,
            first_seen_unit,
        })
    }
}

type RawColumns = (f64, String, String, String);

fn read_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

pub struct EntityStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl EntityStore {
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), journal_mode = %mode, "Opened entity store");

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-transaction rolls back when the Transaction drops
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merges `rows` in one write transaction, retrying while the database is
    /// locked. Returns how many rows were inserted or changed; replaying a batch
    /// that is already stored returns 0 and touches nothing.
    pub fn upsert_batch(&self, rows: &[PersistedRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let result = self.retry.run("upsert_batch", |attempt| {
            let mut conn = self.conn();
            let changed = write_batch(&mut conn, rows)?;
            debug!(rows = rows.len(), changed, attempt, "Batch upserted");
            Ok::<_, StoreError>(changed)
        });

        result.map_err(|RetryError { attempts, last }| {
            if last.is_retriable() {
                StoreError::Exhausted {
                    attempts,
                    last: Box::new(last),
                }
            } else {
                last
            }
        })
    }

    pub fn row_count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM persisted_rows", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn entity_count(&self, source_name: &str) -> Result<u64, StoreError> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM entities WHERE source_name = ?1",
            params![source_name],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn entity(
        &self,
        source_name: &str,
        canonical_key: &str,
    ) -> Result<Option<CanonicalEntity>, StoreError> {
        let found = self
            .conn()
            .query_row(
                "SELECT aggregate_confidence, matched_reasons, variants, first_seen_unit, display_name
                 FROM entities WHERE source_name = ?1 AND canonical_key = ?2",
                params![source_name, canonical_key],
                |row| Ok((read_columns(row)?, row.get::<_, String>(4)?)),
            )
            .optional()?;

        let Some(((confidence, reasons, variants, first_seen_unit), display_name)) = found else {
            return Ok(None);
        };
        let agg = Aggregate::from_columns(confidence, &reasons, &variants, first_seen_unit)?;
        Ok(Some(CanonicalEntity {
            canonical_key: canonical_key.to_string(),
            display_name,
            variants: agg.variants,
            matched_reasons: agg.matched_reasons,
            first_seen_unit: agg.first_seen_unit,
            aggregate_confidence: agg.confidence,
        }))
    }

    /// All rows of a source, ordered by key then fingerprint.
    pub fn rows_for(&self, source_name: &str) -> Result<Vec<PersistedRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT confidence, matched_reasons, variants, first_seen_unit,
                    canonical_key, record_fingerprint, display_name
             FROM persisted_rows WHERE source_name = ?1
             ORDER BY canonical_key, record_fingerprint",
        )?;
        let raw = stmt
            .query_map(params![source_name], |row| {
                Ok((
                    read_columns(row)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|((confidence, reasons, variants, first_seen_unit), key, fp, display)| {
                let agg = Aggregate::from_columns(confidence, &reasons, &variants, first_seen_unit)?;
                Ok(PersistedRow {
                    source_name: source_name.to_string(),
                    canonical_key: key,
                    record_fingerprint: fp,
                    display_name: display,
                    confidence: agg.confidence,
                    matched_reasons: agg.matched_reasons.into_iter().collect(),
                    variants: agg.variants,
                    first_seen_unit: agg.first_seen_unit,
                })
            })
            .collect()
    }
}

fn write_batch(conn: &mut Connection, rows: &[PersistedRow]) -> Result<usize, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = Utc::now().to_rfc3339();
    let mut changed = 0;

    for row in rows {
        let incoming = Aggregate::of(row);

        let existing = tx
            .query_row(
                "SELECT confidence, matched_reasons, variants, first_seen_unit
                 FROM persisted_rows
                 WHERE source_name = ?1 AND canonical_key = ?2 AND record_fingerprint = ?3",
                params![row.source_name, row.canonical_key, row.record_fingerprint],
                read_columns,
            )
            .optional()?;
        if let Some(merged) = merge_with(existing, &incoming)? {
            tx.execute(
                "INSERT OR REPLACE INTO persisted_rows
                 (source_name, canonical_key, record_fingerprint, display_name, confidence,
                  matched_reasons, variants, first_seen_unit, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.source_name,
                    row.canonical_key,
                    row.record_fingerprint,
                    pick_display_name(&merged.variants),
                    merged.confidence,
                    serde_json::to_string(&merged.matched_reasons)?,
                    serde_json::to_string(&merged.variants)?,
                    merged.first_seen_unit,
                    now,
                ],
            )?;
            changed += 1;
        }

        let existing = tx
            .query_row(
                "SELECT aggregate_confidence, matched_reasons, variants, first_seen_unit
                 FROM entities WHERE source_name = ?1 AND canonical_key = ?2",
                params![row.source_name, row.canonical_key],
                read_columns,
            )
            .optional()?;
        if let Some(merged) = merge_with(existing, &incoming)? {
            tx.execute(
                "INSERT OR REPLACE INTO entities
                 (source_name, canonical_key, display_name, aggregate_confidence,
                  matched_reasons, variants, first_seen_unit, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.source_name,
                    row.canonical_key,
                    pick_display_name(&merged.variants),
                    merged.confidence,
                    serde_json::to_string(&merged.matched_reasons)?,
                    serde_json::to_string(&merged.variants)?,
                    merged.first_seen_unit,
                    now,
                ],
            )?;
        }
    }

    tx.commit()?;
    Ok(changed)
}

/// `None` when the stored value already covers `incoming`.
fn merge_with(
    existing: Option<RawColumns>,
    incoming: &Aggregate,
) -> Result<Option<Aggregate>, StoreError> {
    let Some((confidence, reasons, variants, first_seen_unit)) = existing else {
        return Ok(Some(incoming.clone()));
    };
    let stored = Aggregate::from_columns(confidence, &reasons, &variants, first_seen_unit)?;
    let merged = stored.merged(incoming);
    Ok(if merged == stored { None } else { Some(merged) })
}

/*!
SQLite-backed store of merged IP records.
Owns the merge rules: one row per address, maximum score wins, sources only grow.
*/

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::record::{CollectedEntry, IpRecord, is_valid_source, join_sources, split_sources};

/// Diagnostic snapshot of the store contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_count: usize,
    /// Record counts keyed by the normalized source list, e.g. `"abuseipdb,ipsum"`
    pub count_by_source_combination: BTreeMap<String, usize>,
}

/// Row as persisted, before timestamps are validated.
struct RawRecord {
    ip: String,
    sources: String,
    score: u32,
    last_seen: i64,
    created_at: i64,
}

impl RawRecord {
    fn into_record(self) -> Result<IpRecord> {
        let last_seen = from_unix(&self.ip, "last_seen", self.last_seen)?;
        let created_at = from_unix(&self.ip, "created_at", self.created_at)?;
        Ok(IpRecord {
            sources: split_sources(&self.sources),
            ip: self.ip,
            score: self.score,
            last_seen,
            created_at,
        })
    }
}

fn from_unix(ip: &str, column: &str, seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| StoreError::CorruptRecord {
        ip: ip.to_string(),
        reason: format!("{} out of range: {}", column, seconds),
    })
}

/// Keyed table of [`IpRecord`]s.
///
/// Writers need `&mut self`; callers sharing one store across tasks wrap it in a
/// mutex so writes are serialized.
pub struct RecordStore {
    conn: Connection,
}

impl RecordStore {
    /// Open (or create) the store at `path` and make sure the schema exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self::with_connection(conn)?;
        info!("Record store opened at {:?}", path.as_ref());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ip_records (
                ip TEXT PRIMARY KEY,
                sources TEXT NOT NULL,  -- sorted, comma separated
                score INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_last_seen ON ip_records(last_seen);
            CREATE INDEX IF NOT EXISTS idx_records_score ON ip_records(score);
        "#,
        )?;

        Ok(())
    }

    /// Merge a batch of sightings into the store.
    ///
    /// The whole batch is applied in one transaction: either every entry is
    /// merged or, on error, nothing is. Duplicate addresses inside the batch
    /// merge exactly as they would across batches. An empty batch never
    /// touches the database.
    ///
    /// Returns the number of entries merged.
    pub fn upsert_batch(&mut self, entries: &[CollectedEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        if let Some(bad) = entries.iter().find(|entry| !is_valid_source(&entry.source)) {
            return Err(StoreError::InvalidSource(bad.source.clone()));
        }

        let tx = self.conn.transaction()?;
        let mut inserted = 0usize;
        let mut updated = 0usize;

        {
            let mut select = tx.prepare_cached(
                "SELECT sources, score, last_seen FROM ip_records WHERE ip = ?1",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO ip_records (ip, sources, score, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
            )?;
            let mut update = tx.prepare_cached(
                "UPDATE ip_records SET sources = ?2, score = ?3, last_seen = ?4 WHERE ip = ?1",
            )?;

            for entry in entries {
                let observed = entry.observed_at.timestamp();

                let existing = select
                    .query_row([&entry.ip], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })
                    .optional()?;

                match existing {
                    Some((sources, score, last_seen)) => {
                        let mut merged = split_sources(&sources);
                        merged.insert(entry.source.clone());

                        update.execute(params![
                            entry.ip,
                            join_sources(&merged),
                            score.max(entry.score),
                            last_seen.max(observed),
                        ])?;
                        updated += 1;
                    }
                    None => {
                        insert.execute(params![entry.ip, entry.source, entry.score, observed])?;
                        inserted += 1;
                    }
                }
            }
        }

        tx.commit()?;
        debug!("Merged batch: {} inserted, {} updated", inserted, updated);
        Ok(inserted + updated)
    }

    /// Addresses with `score >= min_score`, highest score first, ties by address.
    pub fn qualifying_ips(&self, min_score: u32) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT ip FROM ip_records
             WHERE score >= ?1
             ORDER BY score DESC, ip ASC",
        )?;

        let ip_iter = stmt.query_map([min_score], |row| row.get::<_, String>(0))?;

        let mut ips = Vec::new();
        for ip in ip_iter {
            ips.push(ip?);
        }

        debug!("{} addresses qualify at min_score={}", ips.len(), min_score);
        Ok(ips)
    }

    /// Remove records not seen within `max_age` of now.
    pub fn purge_stale(&mut self, max_age: TimeDelta) -> Result<usize> {
        // An age reaching back past the earliest representable time purges nothing
        match Utc::now().checked_sub_signed(max_age) {
            Some(cutoff) => self.purge_older_than(cutoff),
            None => {
                debug!("Retention age {} predates any record, nothing to purge", max_age);
                Ok(0)
            }
        }
    }

    /// Remove records whose `last_seen` is strictly before `cutoff`.
    pub fn purge_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM ip_records WHERE last_seen < ?1",
            [cutoff.timestamp()],
        )?;

        if removed > 0 {
            info!("Purged {} records last seen before {}", removed, cutoff);
        }
        Ok(removed)
    }

    pub fn get(&self, ip: &str) -> Result<Option<IpRecord>> {
        let raw = self
            .conn
            .query_row(
                "SELECT ip, sources, score, last_seen, created_at
                 FROM ip_records WHERE ip = ?1",
                [ip],
                |row| {
                    Ok(RawRecord {
                        ip: row.get(0)?,
                        sources: row.get(1)?,
                        score: row.get(2)?,
                        last_seen: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;

        raw.map(RawRecord::into_record).transpose()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ip_records", [], |row| row.get(0))?;

        let mut stmt = self
            .conn
            .prepare("SELECT sources, COUNT(*) FROM ip_records GROUP BY sources")?;
        let group_iter = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        // Re-normalize so rows written with a different ordering still group together
        let mut count_by_source_combination = BTreeMap::new();
        for group in group_iter {
            let (sources, count) = group?;
            let key = join_sources(&split_sources(&sources));
            *count_by_source_combination.entry(key).or_insert(0) += count as usize;
        }

        Ok(StoreStats {
            total_count: total as usize,
            count_by_source_combination,
        })
    }
}

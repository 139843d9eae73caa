//! SQLite-backed key storage.
//!
//! One `KeyStore` wraps one connection to the shared database. There is no
//! in-memory key-selection state: every "current key" read re-queries the
//! store inside a fresh transaction, so multiple service instances stay
//! consistent without distributed locks.
//!
//! Transaction handles are explicit: every repository operation takes a
//! `&rusqlite::Transaction`, and callers decide the transaction boundary.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use uuid::Uuid;

use crate::error::BarrierError;
use crate::record::{KeyRecord, KeyTier};

/// How long sqlite waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS root_keys (
    id               TEXT PRIMARY KEY,
    wrapped_material BLOB NOT NULL,
    parent_key_id    TEXT NOT NULL,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    rotated_at       INTEGER
);
CREATE TABLE IF NOT EXISTS intermediate_keys (
    id               TEXT PRIMARY KEY,
    wrapped_material BLOB NOT NULL,
    parent_key_id    TEXT NOT NULL REFERENCES root_keys(id),
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    rotated_at       INTEGER
);
CREATE TABLE IF NOT EXISTS content_keys (
    id               TEXT PRIMARY KEY,
    wrapped_material BLOB NOT NULL,
    parent_key_id    TEXT NOT NULL REFERENCES intermediate_keys(id),
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    rotated_at       INTEGER
);
";

/// Connection handle to the shared key database.
pub struct KeyStore {
    conn: Mutex<Connection>,
}

impl KeyStore {
    /// Open (and initialize if needed) a file-backed key store.
    pub fn open(path: &Path) -> Result<Self, BarrierError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory key store. Data lives as long as this handle.
    pub fn open_in_memory() -> Result<Self, BarrierError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, BarrierError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside a deferred (read-oriented) transaction.
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<BarrierError>,
    {
        self.run(TransactionBehavior::Deferred, f)
    }

    /// Run `f` inside an immediate (write) transaction. A busy database
    /// surfaces as `RotationConflict` so callers can back off and retry.
    pub fn write_transaction<T, E>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<BarrierError>,
    {
        self.run(TransactionBehavior::Immediate, f)
    }

    fn run<T, E>(
        &self,
        behavior: TransactionBehavior,
        f: impl FnOnce(&Transaction) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<BarrierError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(behavior)
            .map_err(BarrierError::from_sqlite)?;
        let value = f(&tx)?;
        tx.commit().map_err(BarrierError::from_sqlite)?;
        Ok(value)
    }
}

/// Current time in the storage resolution (microseconds since epoch).
pub fn timestamp_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub fn timestamp_from_micros(micros: i64) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp {micros} out of range").into(),
        )
    })
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, rusqlite::Error> {
    Uuid::parse_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn read_record(row: &rusqlite::Row<'_>) -> Result<KeyRecord, rusqlite::Error> {
    let id: String = row.get(0)?;
    let parent: String = row.get(2)?;
    let rotated: Option<i64> = row.get(5)?;
    Ok(KeyRecord {
        id: parse_uuid(&id)?,
        wrapped_material: row.get(1)?,
        parent_key_id: parse_uuid(&parent)?,
        created_at: timestamp_from_micros(row.get(3)?)?,
        updated_at: timestamp_from_micros(row.get(4)?)?,
        rotated_at: rotated.map(timestamp_from_micros).transpose()?,
    })
}

/// Insert a new key record for `tier`.
pub fn insert_key(tx: &Transaction, tier: KeyTier, record: &KeyRecord) -> Result<(), BarrierError> {
    tx.execute(
        &format!(
            "INSERT INTO {} (id, wrapped_material, parent_key_id, created_at, updated_at, rotated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            tier.table()
        ),
        rusqlite::params![
            record.id.to_string(),
            record.wrapped_material,
            record.parent_key_id.to_string(),
            timestamp_micros(record.created_at),
            timestamp_micros(record.updated_at),
            record.rotated_at.map(timestamp_micros),
        ],
    )
    .map_err(BarrierError::from_sqlite)?;
    Ok(())
}

/// Load one key record by id, rotated or not.
pub fn load_key(
    tx: &Transaction,
    tier: KeyTier,
    id: Uuid,
) -> Result<Option<KeyRecord>, BarrierError> {
    let record = tx
        .query_row(
            &format!(
                "SELECT id, wrapped_material, parent_key_id, created_at, updated_at, rotated_at
                 FROM {} WHERE id = ?1",
                tier.table()
            ),
            [id.to_string()],
            read_record,
        )
        .optional()?;
    Ok(record)
}

/// All records of `tier` still eligible to be active (`rotated_at IS NULL`).
pub fn eligible_keys(tx: &Transaction, tier: KeyTier) -> Result<Vec<KeyRecord>, BarrierError> {
    let mut stmt = tx.prepare(&format!(
        "SELECT id, wrapped_material, parent_key_id, created_at, updated_at, rotated_at
         FROM {} WHERE rotated_at IS NULL",
        tier.table()
    ))?;
    let rows = stmt.query_map([], read_record)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

/// Set `rotated_at` on a still-active record. The `rotated_at IS NULL` guard
/// makes the transition single-shot: if a concurrent rotation already claimed
/// the record, this reports a conflict instead of overwriting.
pub fn mark_rotated(
    tx: &Transaction,
    tier: KeyTier,
    id: Uuid,
    at: DateTime<Utc>,
) -> Result<(), BarrierError> {
    let changed = tx
        .execute(
            &format!(
                "UPDATE {} SET rotated_at = ?1, updated_at = ?2 WHERE id = ?3 AND rotated_at IS NULL",
                tier.table()
            ),
            rusqlite::params![timestamp_micros(at), timestamp_micros(at), id.to_string()],
        )
        .map_err(BarrierError::from_sqlite)?;
    if changed != 1 {
        return Err(BarrierError::RotationConflict);
    }
    Ok(())
}

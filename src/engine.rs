//! Elastic keys and their rotating material.
//!
//! An elastic key is a stable, tenant-owned identity; the bytes actually
//! used for encryption live in material keys underneath it. Rotation adds a
//! fresh material and retires the previous one, so the elastic key id stays
//! valid across arbitrarily many rotations while old ciphertext remains
//! decryptable through the retained materials.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Transaction};
use sealbase_barrier::{
    select_active, timestamp_from_micros, timestamp_micros, Barrier, KeyCandidate, KeyStore,
};
use sealbase_crypto::{generate_key, EnvelopeAlg};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::{self, AuditAction, AuditEvent, AuditSink};
use crate::config::{validate_max_materials, EngineConfig};
use crate::error::EngineError;

const ROTATE_ATTEMPTS: u32 = 5;
const ROTATE_BACKOFF: Duration = Duration::from_millis(10);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS elastic_keys (
    id            TEXT PRIMARY KEY,
    tenant_id     TEXT NOT NULL,
    algorithm     TEXT NOT NULL,
    max_materials INTEGER NOT NULL,
    created_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_elastic_keys_tenant ON elastic_keys (tenant_id);

CREATE TABLE IF NOT EXISTS material_keys (
    id             TEXT PRIMARY KEY,
    elastic_key_id TEXT NOT NULL REFERENCES elastic_keys (id),
    encrypted_key  BLOB NOT NULL,
    created_at     INTEGER NOT NULL,
    rotated_at     INTEGER
);
CREATE INDEX IF NOT EXISTS idx_material_keys_elastic ON material_keys (elastic_key_id);
";

/// Symmetric algorithms an elastic key can be provisioned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Aes256Gcm,
    Aes128Gcm,
}

impl KeyAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyAlgorithm::Aes256Gcm => "A256GCM",
            KeyAlgorithm::Aes128Gcm => "A128GCM",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "A256GCM" => Ok(KeyAlgorithm::Aes256Gcm),
            "A128GCM" => Ok(KeyAlgorithm::Aes128Gcm),
            other => Err(EngineError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    fn envelope_alg(self) -> EnvelopeAlg {
        match self {
            KeyAlgorithm::Aes256Gcm => EnvelopeAlg::Aes256Gcm,
            KeyAlgorithm::Aes128Gcm => EnvelopeAlg::Aes128Gcm,
        }
    }
}

/// Stable per-tenant key identity. Callers reference this id; the bytes
/// backing it are the material keys below.
#[derive(Debug, Clone)]
pub struct ElasticKey {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub algorithm: KeyAlgorithm,
    pub max_materials: u32,
    pub created_at: DateTime<Utc>,
}

/// One generation of key bytes under an elastic key. The raw material is
/// never stored; `encrypted_key` is a barrier envelope over it.
#[derive(Debug, Clone)]
pub struct MaterialKey {
    pub id: Uuid,
    pub elastic_key_id: Uuid,
    pub encrypted_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

impl KeyCandidate for MaterialKey {
    fn candidate_id(&self) -> Uuid {
        self.id
    }
    fn candidate_created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn is_eligible(&self) -> bool {
        self.rotated_at.is_none()
    }
}

/// Manages elastic keys and rotates the material under them.
pub struct RotationEngine {
    store: Arc<KeyStore>,
    barrier: Arc<Barrier>,
    config: EngineConfig,
    audit: Arc<dyn AuditSink>,
}

impl RotationEngine {
    pub fn new(
        store: Arc<KeyStore>,
        barrier: Arc<Barrier>,
        config: EngineConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        store.write_transaction(|tx| {
            tx.execute_batch(SCHEMA)
                .map_err(EngineError::from)
        })?;
        Ok(Self {
            store,
            barrier,
            config,
            audit,
        })
    }

    /// Create an elastic key together with its first material. The optional
    /// `max_materials` overrides the engine default for this key only.
    pub fn create_elastic_key(
        &self,
        tenant_id: Uuid,
        algorithm: KeyAlgorithm,
        max_materials: Option<u32>,
    ) -> Result<(ElasticKey, MaterialKey), EngineError> {
        let max = match max_materials {
            Some(value) => {
                validate_max_materials(value)?;
                value
            }
            None => self.config.max_materials,
        };
        let key = ElasticKey {
            id: Uuid::new_v4(),
            tenant_id,
            algorithm,
            max_materials: max,
            created_at: Utc::now(),
        };
        let material = self.store.write_transaction(|tx| {
            tx.execute(
                "INSERT INTO elastic_keys (id, tenant_id, algorithm, max_materials, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    key.id.to_string(),
                    key.tenant_id.to_string(),
                    key.algorithm.as_str(),
                    key.max_materials,
                    timestamp_micros(key.created_at),
                ],
            )
            .map_err(EngineError::from)?;
            self.insert_material(tx, &key)
        })?;
        tracing::info!(elastic_key_id = %key.id, tenant_id = %tenant_id, "elastic key created");
        self.emit(AuditAction::MaterialCreated, &key, material.id);
        Ok((key, material))
    }

    /// Add a fresh material under `elastic_key_id` and retire the current
    /// one. Fails with `CapacityExceeded` once the key holds its maximum
    /// number of materials; retired materials stay readable until then.
    pub fn rotate(&self, tenant_id: Uuid, elastic_key_id: Uuid) -> Result<MaterialKey, EngineError> {
        let mut backoff = ROTATE_BACKOFF;
        for attempt in 1..=ROTATE_ATTEMPTS {
            let result = self.store.write_transaction(|tx| {
                let key = self.load_elastic(tx, tenant_id, elastic_key_id)?;
                let count: u32 = tx.query_row(
                    "SELECT COUNT(*) FROM material_keys WHERE elastic_key_id = ?1",
                    [elastic_key_id.to_string()],
                    |row| row.get(0),
                )?;
                if count >= key.max_materials {
                    return Err(EngineError::CapacityExceeded {
                        elastic_key_id,
                        max: key.max_materials,
                    });
                }
                let now = timestamp_micros(Utc::now());
                tx.execute(
                    "UPDATE material_keys SET rotated_at = ?1
                     WHERE elastic_key_id = ?2 AND rotated_at IS NULL",
                    rusqlite::params![now, elastic_key_id.to_string()],
                )?;
                let material = self.insert_material(tx, &key)?;
                Ok((key, material))
            });
            match result {
                Ok((key, material)) => {
                    tracing::info!(
                        elastic_key_id = %elastic_key_id,
                        material_key_id = %material.id,
                        "material rotated"
                    );
                    self.emit(AuditAction::MaterialRotated, &key, material.id);
                    return Ok(material);
                }
                Err(err) if err.is_retryable() && attempt < ROTATE_ATTEMPTS => {
                    tracing::debug!(attempt, "material rotation conflict, retrying");
                    thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
        Err(EngineError::Barrier(
            sealbase_barrier::BarrierError::RotationConflict,
        ))
    }

    /// Manually retire one material without provisioning a replacement.
    /// Retiring the sole active material is allowed; the key then has no
    /// active material until the next rotation. Idempotent for materials
    /// already retired.
    pub fn retire_material(
        &self,
        tenant_id: Uuid,
        elastic_key_id: Uuid,
        material_key_id: Uuid,
    ) -> Result<(), EngineError> {
        let key = self.store.write_transaction(|tx| {
            let key = self.load_elastic(tx, tenant_id, elastic_key_id)?;
            let exists: bool = tx.query_row(
                "SELECT COUNT(*) FROM material_keys WHERE id = ?1 AND elastic_key_id = ?2",
                rusqlite::params![material_key_id.to_string(), elastic_key_id.to_string()],
                |row| row.get::<_, u32>(0).map(|n| n > 0),
            )?;
            if !exists {
                return Err(EngineError::MaterialKeyNotFound {
                    id: material_key_id,
                });
            }
            tx.execute(
                "UPDATE material_keys SET rotated_at = ?1
                 WHERE id = ?2 AND rotated_at IS NULL",
                rusqlite::params![timestamp_micros(Utc::now()), material_key_id.to_string()],
            )?;
            Ok(key)
        })?;
        tracing::info!(
            elastic_key_id = %elastic_key_id,
            material_key_id = %material_key_id,
            "material retired"
        );
        self.emit(AuditAction::MaterialRetired, &key, material_key_id);
        Ok(())
    }

    /// The material currently used for new encryptions under this key.
    pub fn get_active_material(
        &self,
        tenant_id: Uuid,
        elastic_key_id: Uuid,
    ) -> Result<MaterialKey, EngineError> {
        self.store.transaction(|tx| {
            self.load_elastic(tx, tenant_id, elastic_key_id)?;
            let materials = load_materials(tx, elastic_key_id)?;
            let active = select_active(&materials, "material")?;
            Ok(active.clone())
        })
    }

    /// All materials under the key, oldest first. Retired generations are
    /// included so historical ciphertext can be mapped to its material.
    pub fn list_materials(
        &self,
        tenant_id: Uuid,
        elastic_key_id: Uuid,
    ) -> Result<Vec<MaterialKey>, EngineError> {
        self.store.transaction(|tx| {
            self.load_elastic(tx, tenant_id, elastic_key_id)?;
            load_materials(tx, elastic_key_id)
        })
    }

    /// Decrypt one material's key bytes through the barrier. Works for
    /// retired materials too; that is the whole point of retention.
    pub fn material_plaintext(
        &self,
        tenant_id: Uuid,
        elastic_key_id: Uuid,
        material_key_id: Uuid,
    ) -> Result<Zeroizing<Vec<u8>>, EngineError> {
        self.store.transaction(|tx| {
            self.load_elastic(tx, tenant_id, elastic_key_id)?;
            let material = tx
                .query_row(
                    "SELECT id, elastic_key_id, encrypted_key, created_at, rotated_at
                     FROM material_keys WHERE id = ?1 AND elastic_key_id = ?2",
                    rusqlite::params![material_key_id.to_string(), elastic_key_id.to_string()],
                    material_from_row,
                )
                .optional()?
                .ok_or(EngineError::MaterialKeyNotFound {
                    id: material_key_id,
                })?;
            let plaintext = self.barrier.decrypt_in(tx, &material.encrypted_key)?;
            Ok(Zeroizing::new(plaintext))
        })
    }

    pub fn get_elastic_key(
        &self,
        tenant_id: Uuid,
        elastic_key_id: Uuid,
    ) -> Result<ElasticKey, EngineError> {
        self.store
            .transaction(|tx| self.load_elastic(tx, tenant_id, elastic_key_id))
    }

    /// Decommission an elastic key and every material under it. Ciphertext
    /// produced with those materials becomes permanently unreadable.
    pub fn delete_elastic_key(
        &self,
        tenant_id: Uuid,
        elastic_key_id: Uuid,
    ) -> Result<(), EngineError> {
        self.store.write_transaction(|tx| -> Result<(), EngineError> {
            self.load_elastic(tx, tenant_id, elastic_key_id)?;
            tx.execute(
                "DELETE FROM material_keys WHERE elastic_key_id = ?1",
                [elastic_key_id.to_string()],
            )?;
            tx.execute(
                "DELETE FROM elastic_keys WHERE id = ?1",
                [elastic_key_id.to_string()],
            )?;
            Ok(())
        })?;
        tracing::info!(elastic_key_id = %elastic_key_id, "elastic key deleted");
        Ok(())
    }

    fn insert_material(
        &self,
        tx: &Transaction,
        key: &ElasticKey,
    ) -> Result<MaterialKey, EngineError> {
        let raw = generate_key(key.algorithm.envelope_alg())?;
        let encrypted_key = self.barrier.encrypt_in(tx, &raw)?;
        let material = MaterialKey {
            id: Uuid::new_v4(),
            elastic_key_id: key.id,
            encrypted_key,
            created_at: Utc::now(),
            rotated_at: None,
        };
        tx.execute(
            "INSERT INTO material_keys (id, elastic_key_id, encrypted_key, created_at, rotated_at)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            rusqlite::params![
                material.id.to_string(),
                material.elastic_key_id.to_string(),
                material.encrypted_key,
                timestamp_micros(material.created_at),
            ],
        )?;
        Ok(material)
    }

    /// Tenant ownership is checked here; a key owned by another tenant is
    /// indistinguishable from a missing one.
    fn load_elastic(
        &self,
        tx: &Transaction,
        tenant_id: Uuid,
        elastic_key_id: Uuid,
    ) -> Result<ElasticKey, EngineError> {
        tx.query_row(
            "SELECT id, tenant_id, algorithm, max_materials, created_at
             FROM elastic_keys WHERE id = ?1 AND tenant_id = ?2",
            rusqlite::params![elastic_key_id.to_string(), tenant_id.to_string()],
            elastic_from_row,
        )
        .optional()?
        .ok_or(EngineError::ElasticKeyNotFound { id: elastic_key_id })
    }

    fn emit(&self, action: AuditAction, key: &ElasticKey, material_key_id: Uuid) {
        audit::emit(
            self.audit.as_ref(),
            &self.config,
            AuditEvent::new(action, key.tenant_id, key.id, material_key_id),
        );
    }
}

fn load_materials(
    tx: &Transaction,
    elastic_key_id: Uuid,
) -> Result<Vec<MaterialKey>, EngineError> {
    let mut stmt = tx.prepare(
        "SELECT id, elastic_key_id, encrypted_key, created_at, rotated_at
         FROM material_keys WHERE elastic_key_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map([elastic_key_id.to_string()], material_from_row)?;
    let mut materials = Vec::new();
    for row in rows {
        materials.push(row?);
    }
    Ok(materials)
}

fn material_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MaterialKey> {
    let id: String = row.get(0)?;
    let elastic_key_id: String = row.get(1)?;
    let rotated_at: Option<i64> = row.get(4)?;
    Ok(MaterialKey {
        id: parse_uuid(&id)?,
        elastic_key_id: parse_uuid(&elastic_key_id)?,
        encrypted_key: row.get(2)?,
        created_at: timestamp_from_micros(row.get(3)?)?,
        rotated_at: rotated_at.map(timestamp_from_micros).transpose()?,
    })
}

fn elastic_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ElasticKey> {
    let id: String = row.get(0)?;
    let tenant_id: String = row.get(1)?;
    let algorithm: String = row.get(2)?;
    Ok(ElasticKey {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        algorithm: KeyAlgorithm::parse(&algorithm).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        max_materials: row.get(3)?,
        created_at: timestamp_from_micros(row.get(4)?)?,
    })
}

fn parse_uuid(value: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

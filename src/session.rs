//! Per-realm session keys for signing and encrypting short-lived tokens.
//!
//! Each (realm, purpose) pair holds exactly one active key plus every key it
//! has ever rotated out. Old keys stay loadable so tokens minted before a
//! rotation still verify or decrypt until they expire on their own.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use p256::ecdsa::SigningKey;
use rusqlite::{OptionalExtension, Transaction};
use sealbase_barrier::{
    select_active, timestamp_from_micros, timestamp_micros, Barrier, KeyCandidate, KeyStore,
};
use sealbase_crypto::{
    export_private_key_jwk, generate_key, generate_p256_key, import_private_key_jwk, EnvelopeAlg,
};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::EngineError;

const ROTATE_ATTEMPTS: u32 = 5;
const ROTATE_BACKOFF: Duration = Duration::from_millis(10);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_keys (
    id            TEXT PRIMARY KEY,
    realm         TEXT NOT NULL,
    purpose       TEXT NOT NULL,
    algorithm     TEXT NOT NULL,
    encrypted_key BLOB NOT NULL,
    created_at    INTEGER NOT NULL,
    active        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_keys_realm ON session_keys (realm, purpose);
";

/// Which caller population a session key serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealmType {
    Browser,
    Service,
}

impl RealmType {
    pub fn as_str(self) -> &'static str {
        match self {
            RealmType::Browser => "browser",
            RealmType::Service => "service",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Signing,
    Encryption,
}

impl KeyPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyPurpose::Signing => "signing",
            KeyPurpose::Encryption => "encryption",
        }
    }

    fn algorithm(self) -> &'static str {
        match self {
            KeyPurpose::Signing => "ES256",
            KeyPurpose::Encryption => "A256GCM",
        }
    }
}

/// One session key row. `encrypted_key` is a barrier envelope over the key
/// bytes (a JWK document for signing keys, raw AES bytes for encryption).
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub id: Uuid,
    pub realm: RealmType,
    pub purpose: KeyPurpose,
    pub algorithm: String,
    pub encrypted_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

impl KeyCandidate for SessionKey {
    fn candidate_id(&self) -> Uuid {
        self.id
    }
    fn candidate_created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn is_eligible(&self) -> bool {
        self.active
    }
}

/// Stores and rotates session keys behind the barrier.
pub struct SessionKeyStore {
    store: Arc<KeyStore>,
    barrier: Arc<Barrier>,
}

impl SessionKeyStore {
    pub fn new(store: Arc<KeyStore>, barrier: Arc<Barrier>) -> Result<Self, EngineError> {
        store.write_transaction(|tx| tx.execute_batch(SCHEMA).map_err(EngineError::from))?;
        Ok(Self { store, barrier })
    }

    /// The active signing key for `realm`, creating one on first use.
    pub fn get_signing_key(&self, realm: RealmType) -> Result<(SessionKey, SigningKey), EngineError> {
        let record = self.get_or_bootstrap(realm, KeyPurpose::Signing)?;
        let signing = self.decode_signing(&record)?;
        Ok((record, signing))
    }

    /// The active token-encryption key for `realm`, creating one on first
    /// use. Returns the raw 32-byte AES key alongside its record.
    pub fn get_encryption_key(
        &self,
        realm: RealmType,
    ) -> Result<(SessionKey, Zeroizing<Vec<u8>>), EngineError> {
        let record = self.get_or_bootstrap(realm, KeyPurpose::Encryption)?;
        let raw = self
            .store
            .transaction(|tx| self.barrier.decrypt_in(tx, &record.encrypted_key))
            .map_err(EngineError::Barrier)?;
        Ok((record, Zeroizing::new(raw)))
    }

    pub fn rotate_signing_key(&self, realm: RealmType) -> Result<SessionKey, EngineError> {
        self.rotate(realm, KeyPurpose::Signing)
    }

    pub fn rotate_encryption_key(&self, realm: RealmType) -> Result<SessionKey, EngineError> {
        self.rotate(realm, KeyPurpose::Encryption)
    }

    /// Fetch a key by id regardless of its active flag. Used to verify or
    /// decrypt tokens minted under a since-rotated key.
    pub fn get_key(&self, id: Uuid) -> Result<SessionKey, EngineError> {
        self.store.transaction(|tx| {
            tx.query_row(
                "SELECT id, realm, purpose, algorithm, encrypted_key, created_at, active
                 FROM session_keys WHERE id = ?1",
                [id.to_string()],
                session_from_row,
            )
            .optional()
            .map_err(EngineError::from)?
            .ok_or(EngineError::SessionKeyNotFound { id })
        })
    }

    /// Load a historical signing key for verifying old tokens.
    pub fn load_signing_key(&self, id: Uuid) -> Result<SigningKey, EngineError> {
        let record = self.get_key(id)?;
        self.decode_signing(&record)
    }

    fn get_or_bootstrap(
        &self,
        realm: RealmType,
        purpose: KeyPurpose,
    ) -> Result<SessionKey, EngineError> {
        let existing = self.store.transaction(|tx| {
            let keys = load_realm_keys(tx, realm, purpose)?;
            match select_active(&keys, purpose.as_str()) {
                Ok(key) => Ok(Some(key.clone())),
                Err(sealbase_barrier::BarrierError::NoActiveKey { .. }) => Ok(None),
                Err(err) => Err(EngineError::Barrier(err)),
            }
        })?;
        if let Some(key) = existing {
            return Ok(key);
        }
        self.store.write_transaction(|tx| {
            // Another instance may have bootstrapped while we were outside a
            // write transaction, so insert and then re-select. The selector
            // picks the same winner on every instance either way.
            let keys = load_realm_keys(tx, realm, purpose)?;
            if select_active(&keys, purpose.as_str()).is_err() {
                self.insert_key(tx, realm, purpose, true)?;
            }
            let keys = load_realm_keys(tx, realm, purpose)?;
            let active = select_active(&keys, purpose.as_str())?;
            Ok(active.clone())
        })
    }

    fn rotate(&self, realm: RealmType, purpose: KeyPurpose) -> Result<SessionKey, EngineError> {
        let mut backoff = ROTATE_BACKOFF;
        for attempt in 1..=ROTATE_ATTEMPTS {
            let result = self.store.write_transaction(|tx| {
                tx.execute(
                    "UPDATE session_keys SET active = 0
                     WHERE realm = ?1 AND purpose = ?2 AND active = 1",
                    rusqlite::params![realm.as_str(), purpose.as_str()],
                )?;
                self.insert_key(tx, realm, purpose, true)
            });
            match result {
                Ok(key) => {
                    tracing::info!(
                        realm = realm.as_str(),
                        purpose = purpose.as_str(),
                        session_key_id = %key.id,
                        "session key rotated"
                    );
                    return Ok(key);
                }
                Err(err) if err.is_retryable() && attempt < ROTATE_ATTEMPTS => {
                    tracing::debug!(attempt, "session key rotation conflict, retrying");
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

    fn insert_key(
        &self,
        tx: &Transaction,
        realm: RealmType,
        purpose: KeyPurpose,
        active: bool,
    ) -> Result<SessionKey, EngineError> {
        let plaintext: Zeroizing<Vec<u8>> = match purpose {
            KeyPurpose::Signing => {
                let signing = generate_p256_key();
                let jwk = export_private_key_jwk(&signing);
                Zeroizing::new(serde_json::to_vec(&jwk).map_err(|e| {
                    EngineError::Crypto(sealbase_crypto::CryptoError::InvalidJwk(e.to_string()))
                })?)
            }
            KeyPurpose::Encryption => generate_key(EnvelopeAlg::Aes256Gcm)?,
        };
        let encrypted_key = self.barrier.encrypt_in(tx, &plaintext)?;
        let key = SessionKey {
            id: Uuid::new_v4(),
            realm,
            purpose,
            algorithm: purpose.algorithm().to_string(),
            encrypted_key,
            created_at: Utc::now(),
            active,
        };
        tx.execute(
            "INSERT INTO session_keys (id, realm, purpose, algorithm, encrypted_key, created_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                key.id.to_string(),
                key.realm.as_str(),
                key.purpose.as_str(),
                key.algorithm,
                key.encrypted_key,
                timestamp_micros(key.created_at),
                key.active,
            ],
        )?;
        Ok(key)
    }

    fn decode_signing(&self, record: &SessionKey) -> Result<SigningKey, EngineError> {
        let raw = self
            .store
            .transaction(|tx| self.barrier.decrypt_in(tx, &record.encrypted_key))
            .map_err(EngineError::Barrier)?;
        let raw = Zeroizing::new(raw);
        let jwk: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| {
            EngineError::Crypto(sealbase_crypto::CryptoError::InvalidJwk(e.to_string()))
        })?;
        Ok(import_private_key_jwk(&jwk)?)
    }
}

fn load_realm_keys(
    tx: &Transaction,
    realm: RealmType,
    purpose: KeyPurpose,
) -> Result<Vec<SessionKey>, EngineError> {
    let mut stmt = tx.prepare(
        "SELECT id, realm, purpose, algorithm, encrypted_key, created_at, active
         FROM session_keys WHERE realm = ?1 AND purpose = ?2",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![realm.as_str(), purpose.as_str()],
        session_from_row,
    )?;
    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    Ok(keys)
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionKey> {
    let id: String = row.get(0)?;
    let realm: String = row.get(1)?;
    let purpose: String = row.get(2)?;
    let realm = match realm.as_str() {
        "browser" => RealmType::Browser,
        "service" => RealmType::Service,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown realm {other:?}").into(),
            ))
        }
    };
    let purpose = match purpose.as_str() {
        "signing" => KeyPurpose::Signing,
        "encryption" => KeyPurpose::Encryption,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown purpose {other:?}").into(),
            ))
        }
    };
    Ok(SessionKey {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        realm,
        purpose,
        algorithm: row.get(3)?,
        encrypted_key: row.get(4)?,
        created_at: timestamp_from_micros(row.get(5)?)?,
        active: row.get(6)?,
    })
}

use thiserror::Error;
use uuid::Uuid;

use sealbase_crypto::CryptoError;

use crate::record::KeyTier;

#[derive(Debug, Error)]
pub enum BarrierError {
    /// The barrier could not be opened with the provided unseal key.
    /// Fatal: the service must not start serving traffic.
    #[error("unseal failure: {0}")]
    UnsealFailure(String),

    /// A record's parent key could not be resolved or decrypted. Indicates
    /// data corruption or a misconfigured upstream KEK rotation.
    #[error("chain integrity failure at {tier} key {id}: parent key cannot be resolved or decrypted")]
    ChainIntegrity { tier: KeyTier, id: Uuid },

    /// Authentication failure on a specific ciphertext.
    #[error("decryption failed under content key {key_id}")]
    Decryption {
        key_id: Uuid,
        #[source]
        source: CryptoError,
    },

    /// No eligible active key exists for a tier/scope. Indicates a bootstrap
    /// or rotation-transaction bug.
    #[error("no active key for scope {scope}")]
    NoActiveKey { scope: String },

    /// A concurrent rotation won the write race. Recoverable via retry.
    #[error("rotation conflict: concurrent write detected")]
    RotationConflict,

    /// A ciphertext references a key record that does not exist.
    #[error("{tier} key {id} not found")]
    UnknownKey { tier: KeyTier, id: Uuid },

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl BarrierError {
    /// Map a sqlite error, turning busy/locked conditions into a retryable
    /// rotation conflict.
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::DatabaseBusy
                    || failure.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                BarrierError::RotationConflict
            }
            _ => BarrierError::Storage(err),
        }
    }

    /// Whether the operation that produced this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BarrierError::RotationConflict)
    }
}

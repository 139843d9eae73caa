use sealbase_barrier::BarrierError;
use sealbase_crypto::CryptoError;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;

/// Errors surfaced by the rotation engine and session key store.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Barrier(#[from] BarrierError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("max materials reached for elastic key {elastic_key_id} (limit {max})")]
    CapacityExceeded { elastic_key_id: Uuid, max: u32 },

    #[error("elastic key {id} not found")]
    ElasticKeyNotFound { id: Uuid },

    #[error("material key {id} not found")]
    MaterialKeyNotFound { id: Uuid },

    #[error("session key {id} not found")]
    SessionKeyNotFound { id: Uuid },

    #[error("unsupported key algorithm {0:?}")]
    UnsupportedAlgorithm(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Barrier(BarrierError::from_sqlite(err))
    }
}

impl EngineError {
    /// Whether retrying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Barrier(err) if err.is_retryable())
    }
}

//! Sealbase is an embeddable key-management core. All key material at rest
//! sits behind a layered encryption barrier opened by an external unseal
//! key; on top of that it provides tenant-scoped elastic keys with bounded
//! material rotation, and per-realm session keys for token signing and
//! encryption.
//!
//! Typical setup:
//!
//! ```no_run
//! use std::sync::Arc;
//! use sealbase::{
//!     Barrier, EngineConfig, KeyAlgorithm, KeyStore, LogAuditSink, RotationEngine,
//!     StaticUnsealProvider,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(KeyStore::open(std::path::Path::new("keys.db"))?);
//! let provider = StaticUnsealProvider::generate()?;
//! let barrier = Arc::new(Barrier::unseal(Arc::clone(&store), &provider)?);
//! let engine = RotationEngine::new(
//!     store,
//!     barrier,
//!     EngineConfig::default(),
//!     Arc::new(LogAuditSink),
//! )?;
//! let tenant = uuid::Uuid::new_v4();
//! let (key, _material) = engine.create_elastic_key(tenant, KeyAlgorithm::Aes256Gcm, None)?;
//! engine.rotate(tenant, key.id)?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;

pub use audit::{AuditAction, AuditEvent, AuditSink, LogAuditSink, MemoryAuditSink};
pub use config::{ConfigError, EngineConfig};
pub use engine::{ElasticKey, KeyAlgorithm, MaterialKey, RotationEngine};
pub use error::EngineError;
pub use session::{KeyPurpose, RealmType, SessionKey, SessionKeyStore};

pub use sealbase_barrier::{
    Barrier, BarrierError, KeyRecord, KeyStore, KeyTier, StaticUnsealProvider, UnsealKey,
    UnsealProvider,
};
pub use sealbase_crypto::CryptoError;

//! Layered key-encryption barrier.
//!
//! Secrets at rest are protected by a chain of wrapped keys: an external
//! unseal KEK wraps the Root tier, Root wraps Intermediate, Intermediate
//! wraps Content, and the active Content key seals everything else. Every
//! "current key" decision is a deterministic query over stored rows, never
//! cached mutable state, so any number of service instances sharing one
//! database converge without coordination.

pub mod barrier;
pub mod error;
pub mod record;
pub mod selector;
pub mod store;
pub mod tier;
pub mod unseal;

pub use barrier::Barrier;
pub use error::BarrierError;
pub use record::{KeyRecord, KeyTier};
pub use selector::{select_active, KeyCandidate};
pub use store::{timestamp_from_micros, timestamp_micros, KeyStore};
pub use tier::UnwrappedKey;
pub use unseal::{StaticUnsealProvider, UnsealKey, UnsealProvider};

//! Barrier facade.
//!
//! Composes the three key tiers into a single encrypt/decrypt surface backed
//! transitively by the active Content key. The facade holds exactly one
//! piece of long-lived secret state: the unseal KEK. Everything else is
//! re-read from the store on every operation.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Transaction;
use sealbase_crypto::{open, peek_key_id, seal, EnvelopeAlg};

use crate::error::BarrierError;
use crate::record::{KeyRecord, KeyTier};
use crate::store::KeyStore;
use crate::tier::{active_record, create_tier_key, rotate_tier, unwrap_key, UnwrappedKey};
use crate::unseal::{UnsealKey, UnsealProvider};

/// Rotation retry schedule: attempts and initial backoff (doubled per try).
const ROTATE_ATTEMPTS: u32 = 5;
const ROTATE_BACKOFF: Duration = Duration::from_millis(10);

/// The layered envelope-encryption subsystem protecting secrets at rest.
pub struct Barrier {
    store: Arc<KeyStore>,
    kek: UnsealKey,
}

impl Barrier {
    /// Open the barrier: obtain the KEK from the unseal provider, verify the
    /// Root tier actually opens under it, and bootstrap any missing tiers.
    ///
    /// A failure here must stop service startup. The service may never serve
    /// traffic believing it holds a barrier it cannot actually open.
    pub fn unseal(
        store: Arc<KeyStore>,
        provider: &dyn UnsealProvider,
    ) -> Result<Self, BarrierError> {
        let kek = provider.unseal()?;
        store.write_transaction(|tx| bootstrap(tx, &kek))?;
        tracing::info!(kek_id = %kek.id(), "barrier unsealed");
        Ok(Self { store, kek })
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// Encrypt `secret` under the active Content key, in a fresh transaction.
    pub fn encrypt(&self, secret: &[u8]) -> Result<Vec<u8>, BarrierError> {
        self.store.transaction(|tx| self.encrypt_in(tx, secret))
    }

    /// Encrypt within an enclosing transaction.
    pub fn encrypt_in(&self, tx: &Transaction, secret: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let active = active_record(tx, KeyTier::Content)?;
        let key = unwrap_key(tx, KeyTier::Content, &active, &self.kek)?;
        Ok(seal(EnvelopeAlg::Aes256Gcm, key.material(), key.id, secret)?)
    }

    /// Decrypt a barrier ciphertext, in a fresh transaction.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, BarrierError> {
        self.store.transaction(|tx| self.decrypt_in(tx, ciphertext))
    }

    /// Decrypt within an enclosing transaction. The envelope names the exact
    /// Content key version that sealed it, so rotated keys keep working.
    pub fn decrypt_in(&self, tx: &Transaction, ciphertext: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let key_id = peek_key_id(ciphertext)?;
        let record = load_content_key(tx, key_id)?;
        let key = unwrap_key(tx, KeyTier::Content, &record, &self.kek)?;
        open(key.material(), ciphertext).map_err(|source| BarrierError::Decryption {
            key_id,
            source,
        })
    }

    /// Rotate one tier, retrying transactional write conflicts with
    /// exponential backoff.
    pub fn rotate(&self, tier: KeyTier) -> Result<KeyRecord, BarrierError> {
        let mut backoff = ROTATE_BACKOFF;
        let mut attempt = 1;
        loop {
            let result = self
                .store
                .write_transaction(|tx| rotate_tier(tx, tier, &self.kek));
            match result {
                Err(err) if err.is_retryable() && attempt < ROTATE_ATTEMPTS => {
                    tracing::debug!(tier = %tier, attempt, "rotation conflict, backing off");
                    std::thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn load_content_key(tx: &Transaction, id: uuid::Uuid) -> Result<KeyRecord, BarrierError> {
    crate::store::load_key(tx, KeyTier::Content, id)?.ok_or(BarrierError::UnknownKey {
        tier: KeyTier::Content,
        id,
    })
}

/// First-run bootstrap and startup verification, in one transaction.
///
/// Verifies the existing Root key opens under the provided KEK (the unseal
/// check), then creates any missing tier down the chain.
fn bootstrap(tx: &Transaction, kek: &UnsealKey) -> Result<(), BarrierError> {
    let root = match crate::store::eligible_keys(tx, KeyTier::Root)? {
        candidates if candidates.is_empty() => {
            let parent = UnwrappedKey::from_unseal(kek);
            let record = create_tier_key(tx, KeyTier::Root, &parent)?;
            tracing::info!(id = %record.id, "bootstrapped root key");
            record
        }
        candidates => crate::selector::select_active(&candidates, KeyTier::Root.name())?.clone(),
    };

    // The verification step: an existing Root tier must open under this KEK.
    let root_key = unwrap_key(tx, KeyTier::Root, &root, kek)
        .map_err(|e| BarrierError::UnsealFailure(format!("root key {} unverifiable: {}", root.id, e)))?;

    let intermediate = match active_record(tx, KeyTier::Intermediate) {
        Ok(record) => record,
        Err(BarrierError::NoActiveKey { .. }) => {
            let record = create_tier_key(tx, KeyTier::Intermediate, &root_key)?;
            tracing::info!(id = %record.id, "bootstrapped intermediate key");
            record
        }
        Err(err) => return Err(err),
    };

    match active_record(tx, KeyTier::Content) {
        Ok(_) => {}
        Err(BarrierError::NoActiveKey { .. }) => {
            let intermediate_key = unwrap_key(tx, KeyTier::Intermediate, &intermediate, kek)?;
            let record = create_tier_key(tx, KeyTier::Content, &intermediate_key)?;
            tracing::info!(id = %record.id, "bootstrapped content key");
        }
        Err(err) => return Err(err),
    }

    Ok(())
}

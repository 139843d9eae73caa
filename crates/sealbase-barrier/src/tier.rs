//! Key tier lifecycle: create, unwrap, rotate.
//!
//! Each tier's key material is wrapped (AES-KW) under the active key of the
//! tier above at creation time. Unwrapping walks the recorded parent chain
//! down to the unseal KEK; it never consults "the current" parent, only the
//! exact parent each record was wrapped under, so rotated ancestors keep
//! working forever.

use chrono::Utc;
use rusqlite::Transaction;
use uuid::Uuid;
use zeroize::Zeroizing;

use sealbase_crypto::{generate_key, open, seal, EnvelopeAlg};

use crate::error::BarrierError;
use crate::record::{KeyRecord, KeyTier};
use crate::selector::select_active;
use crate::store::{eligible_keys, insert_key, load_key, mark_rotated};
use crate::unseal::UnsealKey;

/// A tier key in the clear, held only transiently during wrap/unwrap.
pub struct UnwrappedKey {
    pub id: Uuid,
    material: Zeroizing<Vec<u8>>,
}

impl UnwrappedKey {
    pub(crate) fn new(id: Uuid, material: Zeroizing<Vec<u8>>) -> Self {
        Self { id, material }
    }

    pub(crate) fn from_unseal(kek: &UnsealKey) -> Self {
        Self {
            id: kek.id(),
            material: Zeroizing::new(kek.material().to_vec()),
        }
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }
}

/// Resolve the active record of `tier` via the deterministic selector.
pub fn active_record(tx: &Transaction, tier: KeyTier) -> Result<KeyRecord, BarrierError> {
    let candidates = eligible_keys(tx, tier)?;
    Ok(select_active(&candidates, tier.name())?.clone())
}

/// Generate and persist a new key for `tier`, wrapped under `parent`.
/// The new record is created active (`rotated_at = NULL`).
pub fn create_tier_key(
    tx: &Transaction,
    tier: KeyTier,
    parent: &UnwrappedKey,
) -> Result<KeyRecord, BarrierError> {
    let material = generate_key(EnvelopeAlg::Aes256Gcm)?;
    let wrapped = seal(EnvelopeAlg::Aes256Kw, parent.material(), parent.id, &material)?;
    let now = Utc::now();
    let record = KeyRecord {
        id: Uuid::new_v4(),
        wrapped_material: wrapped,
        parent_key_id: parent.id,
        created_at: now,
        updated_at: now,
        rotated_at: None,
    };
    insert_key(tx, tier, &record)?;
    tracing::debug!(tier = %tier, id = %record.id, parent = %parent.id, "created tier key");
    Ok(record)
}

/// Unwrap a tier record by walking its recorded parent chain up to the
/// unseal KEK. Works for rotated records: the chain is fixed at wrap time.
pub fn unwrap_key(
    tx: &Transaction,
    tier: KeyTier,
    record: &KeyRecord,
    kek: &UnsealKey,
) -> Result<UnwrappedKey, BarrierError> {
    let parent = resolve_parent(tx, tier, record, kek)?;
    let material = open(parent.material(), &record.wrapped_material).map_err(|_| {
        BarrierError::ChainIntegrity {
            tier,
            id: record.id,
        }
    })?;
    Ok(UnwrappedKey::new(record.id, Zeroizing::new(material)))
}

fn resolve_parent(
    tx: &Transaction,
    tier: KeyTier,
    record: &KeyRecord,
    kek: &UnsealKey,
) -> Result<UnwrappedKey, BarrierError> {
    match tier.parent() {
        None => {
            // Root records are wrapped directly under the unseal KEK.
            if record.parent_key_id != kek.id() {
                return Err(BarrierError::ChainIntegrity {
                    tier,
                    id: record.id,
                });
            }
            Ok(UnwrappedKey::from_unseal(kek))
        }
        Some(parent_tier) => {
            let parent = load_key(tx, parent_tier, record.parent_key_id)?.ok_or(
                BarrierError::ChainIntegrity {
                    tier,
                    id: record.id,
                },
            )?;
            unwrap_key(tx, parent_tier, &parent, kek)
        }
    }
}

/// Rotate `tier` inside the caller's transaction: wrap a fresh key under the
/// *current* parent-tier active key, then retire the old active record. New
/// data is encrypted under the new key; the old one stays decrypt-capable.
pub fn rotate_tier(
    tx: &Transaction,
    tier: KeyTier,
    kek: &UnsealKey,
) -> Result<KeyRecord, BarrierError> {
    let current = active_record(tx, tier)?;
    let parent = match tier.parent() {
        None => UnwrappedKey::from_unseal(kek),
        Some(parent_tier) => {
            let active = active_record(tx, parent_tier)?;
            unwrap_key(tx, parent_tier, &active, kek)?
        }
    };
    let fresh = create_tier_key(tx, tier, &parent)?;
    mark_rotated(tx, tier, current.id, Utc::now())?;
    tracing::info!(tier = %tier, old = %current.id, new = %fresh.id, "rotated tier key");
    Ok(fresh)
}

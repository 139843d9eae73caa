//! Key records and the tier hierarchy.
//!
//! The Root → Intermediate → Content relationship is modeled as rows with a
//! `parent_key_id` reference, not as in-memory links: records are looked up
//! by id, which maps cleanly onto the shared relational store and avoids any
//! ownership cycles between tiers.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::selector::KeyCandidate;

/// One tier of the barrier hierarchy. Each tier's keys are wrapped by the
/// active key of the tier above; Root is wrapped by the external unseal KEK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTier {
    Root,
    Intermediate,
    Content,
}

impl KeyTier {
    /// The tier whose active key wraps this tier's keys. `None` for Root,
    /// whose parent is the unseal KEK.
    pub fn parent(self) -> Option<KeyTier> {
        match self {
            KeyTier::Root => None,
            KeyTier::Intermediate => Some(KeyTier::Root),
            KeyTier::Content => Some(KeyTier::Intermediate),
        }
    }

    /// Table holding this tier's records.
    pub(crate) fn table(self) -> &'static str {
        match self {
            KeyTier::Root => "root_keys",
            KeyTier::Intermediate => "intermediate_keys",
            KeyTier::Content => "content_keys",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            KeyTier::Root => "root",
            KeyTier::Intermediate => "intermediate",
            KeyTier::Content => "content",
        }
    }
}

impl std::fmt::Display for KeyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One versioned key of a tier. Immutable after creation except for the
/// single `rotated_at` transition, which is set exactly once and never
/// cleared. Records are never deleted: rotated keys must remain able to
/// decrypt data wrapped before rotation.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub id: Uuid,
    /// Envelope ciphertext of this tier's key, wrapped under the parent KEK.
    pub wrapped_material: Vec<u8>,
    /// The wrapping key one tier up (the unseal KEK id for Root records).
    pub parent_key_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` while this version is eligible to be active.
    pub rotated_at: Option<DateTime<Utc>>,
}

impl KeyCandidate for KeyRecord {
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

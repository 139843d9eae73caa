//! Unseal provider contract.
//!
//! The top-level KEK that opens the Root tier comes from outside the
//! barrier: an HSM, a cloud KMS, reconstructed Shamir shares. The barrier
//! only requires the [`UnsealProvider`] contract; key sources live with the
//! deployment, not here.

use uuid::Uuid;
use zeroize::Zeroizing;

use sealbase_crypto::{random_bytes, EnvelopeAlg};

use crate::error::BarrierError;

/// The top-level key-encrypting key recovered at startup. Material is
/// zeroized on drop and never leaves this type except by reference.
pub struct UnsealKey {
    id: Uuid,
    material: Zeroizing<Vec<u8>>,
}

impl UnsealKey {
    /// Expected KEK length: the Root tier is wrapped with AES-256.
    pub const KEY_LEN: usize = 32;

    pub fn new(id: Uuid, material: &[u8]) -> Result<Self, BarrierError> {
        if material.len() != Self::KEY_LEN {
            return Err(BarrierError::UnsealFailure(format!(
                "unseal key must be {} bytes, got {}",
                Self::KEY_LEN,
                material.len()
            )));
        }
        Ok(Self {
            id,
            material: Zeroizing::new(material.to_vec()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }
}

/// Source of the top-level KEK.
pub trait UnsealProvider {
    /// Recover the KEK, or fail. A failure here is fatal for startup.
    fn unseal(&self) -> Result<UnsealKey, BarrierError>;
}

/// Provider backed by fixed key bytes, for configuration-sourced keys and
/// tests. The stable `id` ties Root records to this KEK across restarts.
pub struct StaticUnsealProvider {
    id: Uuid,
    material: Zeroizing<Vec<u8>>,
}

impl StaticUnsealProvider {
    pub fn new(id: Uuid, material: &[u8]) -> Result<Self, BarrierError> {
        // Reuse the length validation.
        let key = UnsealKey::new(id, material)?;
        Ok(Self {
            id: key.id,
            material: key.material,
        })
    }

    /// Generate a fresh random KEK with a fresh id.
    pub fn generate() -> Result<Self, BarrierError> {
        let material = random_bytes(EnvelopeAlg::Aes256Gcm.key_len())?;
        Ok(Self {
            id: Uuid::new_v4(),
            material,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl UnsealProvider for StaticUnsealProvider {
    fn unseal(&self) -> Result<UnsealKey, BarrierError> {
        UnsealKey::new(self.id, &self.material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_provider_round_trip() {
        let provider = StaticUnsealProvider::generate().unwrap();
        let kek = provider.unseal().unwrap();
        assert_eq!(kek.id(), provider.id());
        assert_eq!(kek.material().len(), UnsealKey::KEY_LEN);

        // Unsealing twice yields the same key.
        let again = provider.unseal().unwrap();
        assert_eq!(kek.material(), again.material());
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(StaticUnsealProvider::new(Uuid::new_v4(), &[0u8; 16]).is_err());
        assert!(UnsealKey::new(Uuid::new_v4(), &[0u8; 31]).is_err());
    }
}

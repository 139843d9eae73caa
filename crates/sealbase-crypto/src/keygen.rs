//! Random key generation.

use zeroize::Zeroizing;

use crate::envelope::EnvelopeAlg;
use crate::error::CryptoError;

/// Generate random key material sized for `alg`. The returned buffer is
/// zeroized on drop.
pub fn generate_key(alg: EnvelopeAlg) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    random_bytes(alg.key_len())
}

/// Generate `len` random bytes, zeroized on drop.
pub fn random_bytes(len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_matches_algorithm() {
        assert_eq!(generate_key(EnvelopeAlg::Aes256Gcm).unwrap().len(), 32);
        assert_eq!(generate_key(EnvelopeAlg::Aes128Gcm).unwrap().len(), 16);
        assert_eq!(generate_key(EnvelopeAlg::Aes256Kw).unwrap().len(), 32);
    }

    #[test]
    fn keys_are_unique() {
        let a = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let b = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        assert_ne!(a.to_vec(), b.to_vec());
    }
}

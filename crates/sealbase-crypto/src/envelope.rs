//! Self-describing encrypted envelope.
//!
//! Every wrapped key and every barrier ciphertext is stored as an envelope
//! that carries enough metadata to decrypt without an external lookup:
//!
//! ```text
//! AEAD payloads:  [version:1][alg:1][key_id:16][iv:12][ciphertext + tag]
//! Key wrapping:   [version:1][alg:1][key_id:16][AES-KW(key, material)]
//! ```
//!
//! `key_id` is the UUID of the key the payload was sealed under, so a reader
//! can resolve the exact (possibly rotated) key version before opening.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use aes_kw::Kek;
use uuid::Uuid;

use crate::error::CryptoError;

/// Current envelope wire format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Envelope header size: version + algorithm + key UUID.
pub const ENVELOPE_HEADER_LEN: usize = 1 + 1 + 16;

/// AES-GCM IV size in bytes.
pub const IV_LEN: usize = 12;

/// AES-GCM authentication tag size in bytes.
pub const TAG_LEN: usize = 16;

/// AES-KW adds a 8-byte integrity block to the wrapped material.
const KW_OVERHEAD: usize = 8;

/// AEAD / key-wrap algorithm carried in the envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeAlg {
    /// AES-256-GCM authenticated encryption.
    Aes256Gcm,
    /// AES-128-GCM authenticated encryption.
    Aes128Gcm,
    /// AES-256 key wrapping (RFC 3394) for key material.
    Aes256Kw,
}

impl EnvelopeAlg {
    pub fn wire_id(self) -> u8 {
        match self {
            EnvelopeAlg::Aes256Gcm => 1,
            EnvelopeAlg::Aes128Gcm => 2,
            EnvelopeAlg::Aes256Kw => 3,
        }
    }

    pub fn from_wire_id(id: u8) -> Result<Self, CryptoError> {
        match id {
            1 => Ok(EnvelopeAlg::Aes256Gcm),
            2 => Ok(EnvelopeAlg::Aes128Gcm),
            3 => Ok(EnvelopeAlg::Aes256Kw),
            other => Err(CryptoError::UnsupportedAlgorithm(other)),
        }
    }

    /// Length of the key this algorithm is used with.
    pub fn key_len(self) -> usize {
        match self {
            EnvelopeAlg::Aes256Gcm | EnvelopeAlg::Aes256Kw => 32,
            EnvelopeAlg::Aes128Gcm => 16,
        }
    }
}

/// Generate a random 12-byte IV for AES-GCM.
fn generate_iv() -> Result<[u8; IV_LEN], CryptoError> {
    let mut iv = [0u8; IV_LEN];
    getrandom::getrandom(&mut iv).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(iv)
}

fn check_key_len(alg: EnvelopeAlg, key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != alg.key_len() {
        return Err(CryptoError::InvalidKeyLength {
            expected: alg.key_len(),
            got: key.len(),
        });
    }
    Ok(())
}

fn header(alg: EnvelopeAlg, key_id: Uuid, payload_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload_len);
    out.push(ENVELOPE_VERSION);
    out.push(alg.wire_id());
    out.extend_from_slice(key_id.as_bytes());
    out
}

/// Seal `plaintext` under `key`, embedding `key_id` (the id of the sealing
/// key) in the envelope header.
pub fn seal(
    alg: EnvelopeAlg,
    key: &[u8],
    key_id: Uuid,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_key_len(alg, key)?;

    match alg {
        EnvelopeAlg::Aes256Gcm | EnvelopeAlg::Aes128Gcm => {
            let iv = generate_iv()?;
            let nonce = Nonce::from_slice(&iv);
            let ciphertext = match alg {
                EnvelopeAlg::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                    .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?
                    .encrypt(nonce, plaintext),
                _ => Aes128Gcm::new_from_slice(key)
                    .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?
                    .encrypt(nonce, plaintext),
            }
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

            let mut out = header(alg, key_id, IV_LEN + ciphertext.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }
        EnvelopeAlg::Aes256Kw => {
            // RFC 3394 requires at least two 64-bit blocks of material.
            if plaintext.len() < 16 || plaintext.len() % 8 != 0 {
                return Err(CryptoError::InvalidWrapLength(plaintext.len()));
            }
            let key_array: [u8; 32] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                got: key.len(),
            })?;
            let kek = Kek::from(key_array);
            let mut wrapped = vec![0u8; plaintext.len() + KW_OVERHEAD];
            kek.wrap(plaintext, &mut wrapped)
                .map_err(|e| CryptoError::WrapFailed(format!("{:?}", e)))?;

            let mut out = header(alg, key_id, wrapped.len());
            out.extend_from_slice(&wrapped);
            Ok(out)
        }
    }
}

/// Read the envelope header without decrypting.
fn parse_header(blob: &[u8]) -> Result<(EnvelopeAlg, Uuid, &[u8]), CryptoError> {
    if blob.len() < ENVELOPE_HEADER_LEN {
        return Err(CryptoError::DataTooShort);
    }
    if blob[0] != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(blob[0]));
    }
    let alg = EnvelopeAlg::from_wire_id(blob[1])?;
    // Slice is exactly 16 bytes after the length check above.
    let key_id = Uuid::from_slice(&blob[2..ENVELOPE_HEADER_LEN])
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    Ok((alg, key_id, &blob[ENVELOPE_HEADER_LEN..]))
}

/// Read the embedded sealing-key id from an envelope without decrypting.
pub fn peek_key_id(blob: &[u8]) -> Result<Uuid, CryptoError> {
    let (_, key_id, _) = parse_header(blob)?;
    Ok(key_id)
}

/// Read the algorithm identifier from an envelope without decrypting.
pub fn peek_alg(blob: &[u8]) -> Result<EnvelopeAlg, CryptoError> {
    let (alg, _, _) = parse_header(blob)?;
    Ok(alg)
}

/// Open an envelope with `key`. Fails on authentication-tag mismatch or a
/// malformed envelope; never returns corrupt plaintext.
pub fn open(key: &[u8], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (alg, _, payload) = parse_header(blob)?;
    check_key_len(alg, key)?;

    match alg {
        EnvelopeAlg::Aes256Gcm | EnvelopeAlg::Aes128Gcm => {
            if payload.len() < IV_LEN + TAG_LEN {
                return Err(CryptoError::DataTooShort);
            }
            let nonce = Nonce::from_slice(&payload[..IV_LEN]);
            let ciphertext = &payload[IV_LEN..];
            match alg {
                EnvelopeAlg::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                    .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
                    .decrypt(nonce, ciphertext),
                _ => Aes128Gcm::new_from_slice(key)
                    .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
                    .decrypt(nonce, ciphertext),
            }
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
        }
        EnvelopeAlg::Aes256Kw => {
            if payload.len() < 16 + KW_OVERHEAD || payload.len() % 8 != 0 {
                return Err(CryptoError::DataTooShort);
            }
            let key_array: [u8; 32] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                got: key.len(),
            })?;
            let kek = Kek::from(key_array);
            let mut material = vec![0u8; payload.len() - KW_OVERHEAD];
            kek.unwrap(payload, &mut material)
                .map_err(|e| CryptoError::UnwrapFailed(format!("{:?}", e)))?;
            Ok(material)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::generate_key;

    #[test]
    fn gcm_round_trip() {
        let key = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let key_id = Uuid::new_v4();
        let sealed = seal(EnvelopeAlg::Aes256Gcm, &key, key_id, b"secret-A").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"secret-A");
    }

    #[test]
    fn aes128_round_trip() {
        let key = generate_key(EnvelopeAlg::Aes128Gcm).unwrap();
        let sealed = seal(EnvelopeAlg::Aes128Gcm, &key, Uuid::new_v4(), b"short key").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"short key");
    }

    #[test]
    fn key_wrap_round_trip() {
        let kek = generate_key(EnvelopeAlg::Aes256Kw).unwrap();
        let material = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let sealed = seal(EnvelopeAlg::Aes256Kw, &kek, Uuid::new_v4(), &material).unwrap();
        assert_eq!(open(&kek, &sealed).unwrap(), material.to_vec());
    }

    #[test]
    fn envelope_header_layout() {
        let key = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let key_id = Uuid::new_v4();
        let sealed = seal(EnvelopeAlg::Aes256Gcm, &key, key_id, b"x").unwrap();
        assert_eq!(sealed[0], ENVELOPE_VERSION);
        assert_eq!(sealed[1], EnvelopeAlg::Aes256Gcm.wire_id());
        assert_eq!(&sealed[2..18], key_id.as_bytes());
    }

    #[test]
    fn peek_key_id_without_key() {
        let key = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let key_id = Uuid::new_v4();
        let sealed = seal(EnvelopeAlg::Aes256Gcm, &key, key_id, b"payload").unwrap();
        assert_eq!(peek_key_id(&sealed).unwrap(), key_id);
        assert_eq!(peek_alg(&sealed).unwrap(), EnvelopeAlg::Aes256Gcm);
    }

    #[test]
    fn different_ciphertext_each_time() {
        let key = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let id = Uuid::new_v4();
        let a = seal(EnvelopeAlg::Aes256Gcm, &key, id, b"same").unwrap();
        let b = seal(EnvelopeAlg::Aes256Gcm, &key, id, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let mut sealed = seal(EnvelopeAlg::Aes256Gcm, &key, Uuid::new_v4(), b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let key1 = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let key2 = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let sealed = seal(EnvelopeAlg::Aes256Gcm, &key1, Uuid::new_v4(), b"secret").unwrap();
        assert!(open(&key2, &sealed).is_err());
    }

    #[test]
    fn tampered_wrapped_key_fails() {
        let kek = generate_key(EnvelopeAlg::Aes256Kw).unwrap();
        let material = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let mut sealed = seal(EnvelopeAlg::Aes256Kw, &kek, Uuid::new_v4(), &material).unwrap();
        sealed[ENVELOPE_HEADER_LEN] ^= 0xff;
        assert!(open(&kek, &sealed).is_err());
    }

    #[test]
    fn rejects_unknown_version() {
        let key = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let mut sealed = seal(EnvelopeAlg::Aes256Gcm, &key, Uuid::new_v4(), b"x").unwrap();
        sealed[0] = 9;
        let err = open(&key, &sealed).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let key = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let mut sealed = seal(EnvelopeAlg::Aes256Gcm, &key, Uuid::new_v4(), b"x").unwrap();
        sealed[1] = 77;
        assert!(open(&key, &sealed).is_err());
        assert!(peek_key_id(&sealed).is_err());
    }

    #[test]
    fn rejects_truncated() {
        let key = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        assert!(open(&key, &[1, 1, 0]).is_err());
        assert!(peek_key_id(&[ENVELOPE_VERSION]).is_err());
    }

    #[test]
    fn wrong_key_length_fails() {
        let sealed = seal(
            EnvelopeAlg::Aes256Gcm,
            &generate_key(EnvelopeAlg::Aes256Gcm).unwrap(),
            Uuid::new_v4(),
            b"x",
        )
        .unwrap();
        assert!(open(&[0u8; 16], &sealed).is_err());
        assert!(seal(EnvelopeAlg::Aes256Gcm, &[0u8; 16], Uuid::new_v4(), b"x").is_err());
    }

    #[test]
    fn key_wrap_rejects_short_material() {
        let kek = generate_key(EnvelopeAlg::Aes256Kw).unwrap();
        assert!(seal(EnvelopeAlg::Aes256Kw, &kek, Uuid::new_v4(), &[0u8; 7]).is_err());
        assert!(seal(EnvelopeAlg::Aes256Kw, &kek, Uuid::new_v4(), &[0u8; 12]).is_err());
    }

    #[test]
    fn empty_plaintext() {
        let key = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let sealed = seal(EnvelopeAlg::Aes256Gcm, &key, Uuid::new_v4(), b"").unwrap();
        assert!(open(&key, &sealed).unwrap().is_empty());
    }

    #[test]
    fn large_payload() {
        let key = generate_key(EnvelopeAlg::Aes256Gcm).unwrap();
        let mut payload = vec![0u8; 64 * 1024];
        getrandom::getrandom(&mut payload).unwrap();
        let sealed = seal(EnvelopeAlg::Aes256Gcm, &key, Uuid::new_v4(), &payload).unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), payload);
    }
}

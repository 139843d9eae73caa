//! ECDSA P-256 signing and verification.
//!
//! Produces IEEE P1363 format signatures (raw r||s, 64 bytes). Private keys
//! travel as JWK JSON so they can be sealed at rest and recovered later.

use ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde_json::Value;

use crate::base64url::{base64url_decode, base64url_encode};
use crate::error::CryptoError;

/// Generate a new P-256 signing key.
pub fn generate_p256_key() -> SigningKey {
    SigningKey::random(&mut p256::elliptic_curve::rand_core::OsRng)
}

/// Sign a message with ECDSA P-256 + SHA-256. Returns a 64-byte r||s signature.
pub fn sign(key: &SigningKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let signature: Signature = key
        .try_sign(message)
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
    Ok(signature.to_bytes().to_vec())
}

/// Verify an ECDSA P-256 + SHA-256 signature.
/// Returns false on any invalid signature; never errors.
pub fn verify(key: &VerifyingKey, message: &[u8], signature_bytes: &[u8]) -> bool {
    match Signature::from_slice(signature_bytes) {
        Ok(signature) => key.verify(message, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Export a P-256 private key to JWK format.
pub fn export_private_key_jwk(key: &SigningKey) -> Value {
    let point = key.verifying_key().to_encoded_point(false);
    let x = base64url_encode(point.x().map(|c| c.as_slice()).unwrap_or_default());
    let y = base64url_encode(point.y().map(|c| c.as_slice()).unwrap_or_default());
    let mut scalar_bytes = key.to_bytes().to_vec();
    let d = base64url_encode(&scalar_bytes);
    zeroize::Zeroize::zeroize(&mut scalar_bytes);

    serde_json::json!({
        "kty": "EC",
        "crv": "P-256",
        "x": x,
        "y": y,
        "d": d,
    })
}

/// Import a P-256 private key from JWK format.
pub fn import_private_key_jwk(jwk: &Value) -> Result<SigningKey, CryptoError> {
    let d_b64 = jwk
        .get("d")
        .and_then(|v| v.as_str())
        .ok_or(CryptoError::MissingJwkField("d"))?;
    let d_bytes =
        base64url_decode(d_b64).map_err(|e| CryptoError::InvalidJwk(format!("d: {}", e)))?;
    if d_bytes.len() != 32 {
        return Err(CryptoError::InvalidJwk(format!(
            "P-256 scalar must be 32 bytes, got {}",
            d_bytes.len()
        )));
    }
    SigningKey::from_bytes(d_bytes.as_slice().into())
        .map_err(|e| CryptoError::InvalidJwk(format!("P-256 scalar: {}", e)))
}

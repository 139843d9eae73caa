use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Encrypted data too short")]
    DataTooShort,

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported envelope algorithm: {0}")]
    UnsupportedAlgorithm(u8),

    #[error("Key material length {0} is not valid for key wrapping")]
    InvalidWrapLength(usize),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key wrap failed: {0}")]
    WrapFailed(String),

    #[error("Key unwrap failed: {0}")]
    UnwrapFailed(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("JWK missing {0}")]
    MissingJwkField(&'static str),

    #[error("Invalid JWK: {0}")]
    InvalidJwk(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(String),

    #[error("Random number generation failed: {0}")]
    RngFailed(String),
}

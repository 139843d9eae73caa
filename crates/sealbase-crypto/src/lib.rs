pub mod base64url;
pub mod envelope;
pub mod error;
pub mod keygen;
pub mod signing;

pub use base64url::{base64url_decode, base64url_encode};
pub use envelope::{
    open, peek_alg, peek_key_id, seal, EnvelopeAlg, ENVELOPE_HEADER_LEN, ENVELOPE_VERSION, IV_LEN,
    TAG_LEN,
};
pub use error::CryptoError;
pub use keygen::{generate_key, random_bytes};
pub use signing::{
    export_private_key_jwk, generate_p256_key, import_private_key_jwk, sign, verify,
};

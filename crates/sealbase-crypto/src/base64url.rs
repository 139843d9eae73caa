//! Unpadded base64url encoding, used for JWK field values.

use base64ct::{Base64UrlUnpadded, Encoding};

use crate::error::CryptoError;

pub fn base64url_encode(data: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(data)
}

pub fn base64url_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    Base64UrlUnpadded::decode_vec(s).map_err(|e| CryptoError::Base64Decode(e.to_string()))
}

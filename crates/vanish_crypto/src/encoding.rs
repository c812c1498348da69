//! Base64 as it appears in packets and published keys: standard alphabet,
//! padded. Decoding ignores embedded whitespace and line breaks because keys
//! are routinely pasted or stored with wrapping.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::CryptoError;

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_b64(s: &str) -> Result<Vec<u8>, CryptoError> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(STANDARD.decode(cleaned)?)
}

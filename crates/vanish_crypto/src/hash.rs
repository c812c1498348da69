//! SHA-512 utilities: public key fingerprints (full digest, base64).

use sha2::{Digest, Sha512};

use crate::encoding::encode_b64;

pub fn digest(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

/// SHA-512 of `data`, base64 encoded.
pub fn digest_b64(data: &[u8]) -> String {
    encode_b64(&digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_b64_is_88_chars() {
        assert_eq!(digest_b64(b"hello").len(), 88);
    }

    #[test]
    fn digest_differs_per_input() {
        assert_ne!(digest(b"key one"), digest(b"key two"));
    }
}

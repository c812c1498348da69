//! Encrypted message packet: what the store and the realtime feed see.
//!
//! Wire shape (JSON string):
//!   { "iv": base64(12 bytes), "content": base64(ciphertext || tag),
//!     "keys": { "<recipient id>": base64(RSA-OAEP wrapped AES key), ... } }
//!
//! `keys` carries one entry per recipient, the sender included, so the sender
//! can re-read what they sent. Field order and the sorted recipient map make
//! encoding deterministic.
//!
//! Historical records predate this format, so decoding accepts three shapes:
//! an already-parsed JSON object, a JSON string, and bare legacy text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vanish_crypto::cipher::IV_LEN;
use vanish_crypto::encoding::{decode_b64, encode_b64};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Malformed packet: {0}")]
    Format(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub iv: String,
    pub content: String,
    pub keys: BTreeMap<String, String>,
}

/// Input accepted by [`decode`].
#[derive(Debug, Clone, Copy)]
pub enum RawPacket<'a> {
    Text(&'a str),
    Structured(&'a serde_json::Value),
}

impl<'a> From<&'a str> for RawPacket<'a> {
    fn from(s: &'a str) -> Self {
        RawPacket::Text(s)
    }
}

impl<'a> From<&'a String> for RawPacket<'a> {
    fn from(s: &'a String) -> Self {
        RawPacket::Text(s)
    }
}

impl<'a> From<&'a serde_json::Value> for RawPacket<'a> {
    fn from(v: &'a serde_json::Value) -> Self {
        RawPacket::Structured(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Packet(Packet),
    /// Not a packet at all: legacy plaintext, rendered as-is.
    Raw(String),
}

/// Result of looking up the caller's wrapped key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLookup<'a> {
    Exact(&'a str),
    /// Matched only after ignoring ASCII case. Tolerated for records written
    /// while recipient ids were issued with inconsistent casing.
    CaseInsensitive { matched_id: &'a str, wrapped: &'a str },
    Missing,
}

impl<'a> KeyLookup<'a> {
    pub fn wrapped(&self) -> Option<&'a str> {
        match *self {
            KeyLookup::Exact(w) => Some(w),
            KeyLookup::CaseInsensitive { wrapped, .. } => Some(wrapped),
            KeyLookup::Missing => None,
        }
    }
}

impl Packet {
    pub fn new(iv: &[u8], ciphertext: &[u8], keys: BTreeMap<String, String>) -> Self {
        Self {
            iv: encode_b64(iv),
            content: encode_b64(ciphertext),
            keys,
        }
    }

    pub fn encode(&self) -> Result<String, PacketError> {
        serde_json::to_string(self).map_err(|e| PacketError::Format(e.to_string()))
    }

    pub fn iv_bytes(&self) -> Result<Vec<u8>, PacketError> {
        let iv = decode_b64(&self.iv).map_err(|e| PacketError::Format(format!("iv: {e}")))?;
        if iv.len() != IV_LEN {
            return Err(PacketError::Format(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        Ok(iv)
    }

    pub fn content_bytes(&self) -> Result<Vec<u8>, PacketError> {
        decode_b64(&self.content).map_err(|e| PacketError::Format(format!("content: {e}")))
    }

    /// Exact match first, then a case-insensitive scan.
    pub fn recipient_key(&self, user_id: &str) -> KeyLookup<'_> {
        if let Some(wrapped) = self.keys.get(user_id) {
            return KeyLookup::Exact(wrapped);
        }
        self.keys
            .iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(user_id))
            .map_or(KeyLookup::Missing, |(id, wrapped)| KeyLookup::CaseInsensitive {
                matched_id: id,
                wrapped,
            })
    }
}

/// Serialize a packet from its parts.
pub fn encode(
    iv: &[u8],
    ciphertext: &[u8],
    recipient_keys: BTreeMap<String, String>,
) -> Result<String, PacketError> {
    Packet::new(iv, ciphertext, recipient_keys).encode()
}

/// Parse any stored packet shape.
///
/// Text that does not open with `{` is legacy plaintext and comes back as
/// [`Decoded::Raw`]. Text that does, but is not a complete packet, is a
/// format error: it was meant to be a packet and got damaged.
pub fn decode<'a>(raw: impl Into<RawPacket<'a>>) -> Result<Decoded, PacketError> {
    match raw.into() {
        RawPacket::Text(text) => decode_text(text),
        RawPacket::Structured(value) => match value {
            serde_json::Value::String(text) => decode_text(text),
            serde_json::Value::Object(_) => Packet::deserialize(value)
                .map(Decoded::Packet)
                .map_err(|e| PacketError::Format(e.to_string())),
            other => Err(PacketError::Format(format!(
                "expected a packet object, got {other}"
            ))),
        },
    }
}

fn decode_text(text: &str) -> Result<Decoded, PacketError> {
    if !text.trim_start().starts_with('{') {
        return Ok(Decoded::Raw(text.to_string()));
    }
    serde_json::from_str::<Packet>(text)
        .map(Decoded::Packet)
        .map_err(|e| PacketError::Format(e.to_string()))
}

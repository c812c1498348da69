//! Decrypt-side fallbacks.
//!
//! Decryption never fails past this module: every outcome is a
//! [`MessageBody`]. The variants separate the remedies:
//! - `SignalMismatch`: the wrapped key does not open with our private key
//!   (rotated identity). Offer identity repair.
//! - `Corrupted`: the packet itself is damaged. Render a placeholder, drop it.
//! - `KeyUnavailable`: the packet has no entry for us at all.
//! - `Locked`: the vault was locked when the record arrived. Retried once
//!   the vault is unlocked again.

use std::fmt;

use tracing::{debug, warn};
use vanish_crypto::cipher::{decrypt_content, unwrap_key};
use vanish_crypto::IdentityKeyPair;
use vanish_proto::packet::{self, Decoded, KeyLookup, Packet, RawPacket};
use vanish_proto::MessageRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Plaintext(String),
    /// Pre-encryption record, or packet text that was never JSON.
    Legacy(String),
    KeyUnavailable,
    Locked,
    SignalMismatch,
    Corrupted,
    /// View-once content that has been used up. Cached plaintext is dropped.
    Purged,
}

impl MessageBody {
    /// Readable text, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageBody::Plaintext(s) | MessageBody::Legacy(s) => Some(s),
            _ => None,
        }
    }

    pub fn needs_identity_repair(&self) -> bool {
        matches!(self, MessageBody::SignalMismatch)
    }
}

impl fmt::Display for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageBody::Plaintext(s) | MessageBody::Legacy(s) => f.write_str(s),
            MessageBody::KeyUnavailable => f.write_str("🔒 Encrypted signal (key unavailable)"),
            MessageBody::Locked => f.write_str("🔒 Unlock to read"),
            MessageBody::SignalMismatch => {
                f.write_str("⚠️ Signal mismatch: this device's identity key has changed")
            }
            MessageBody::Corrupted => f.write_str("🚫 Packet corrupted during transmission"),
            MessageBody::Purged => f.write_str("Content no longer available"),
        }
    }
}

/// Decrypt the body of a stored record for `own_id`.
pub fn decrypt_record(
    record: &MessageRecord,
    own_id: &str,
    identity: &IdentityKeyPair,
) -> MessageBody {
    match &record.encrypted_packet {
        Some(raw) => decrypt_packet(raw.as_str(), own_id, identity),
        None => MessageBody::Legacy(record.content.clone().unwrap_or_default()),
    }
}

pub fn decrypt_packet<'a>(
    raw: impl Into<RawPacket<'a>>,
    own_id: &str,
    identity: &IdentityKeyPair,
) -> MessageBody {
    match packet::decode(raw) {
        Ok(Decoded::Packet(p)) => open_packet(&p, own_id, identity),
        Ok(Decoded::Raw(text)) => MessageBody::Legacy(text),
        Err(e) => {
            debug!(error = %e, "undecodable packet");
            MessageBody::Corrupted
        }
    }
}

fn open_packet(p: &Packet, own_id: &str, identity: &IdentityKeyPair) -> MessageBody {
    let lookup = p.recipient_key(own_id);
    if let KeyLookup::CaseInsensitive { matched_id, .. } = lookup {
        // Upstream id casing drift; tolerated, but worth seeing in logs.
        warn!(user_id = own_id, matched_id, "recipient key matched case-insensitively");
    }
    let Some(wrapped) = lookup.wrapped() else {
        return MessageBody::KeyUnavailable;
    };

    let (iv, ciphertext) = match (p.iv_bytes(), p.content_bytes()) {
        (Ok(iv), Ok(ct)) => (iv, ct),
        (Err(e), _) | (_, Err(e)) => {
            debug!(error = %e, "packet fields malformed");
            return MessageBody::Corrupted;
        }
    };

    let key = match unwrap_key(wrapped, identity) {
        Ok(k) => k,
        Err(e) => {
            debug!(error = %e, "key unwrap failed");
            return MessageBody::SignalMismatch;
        }
    };
    match decrypt_content(&ciphertext, &iv, &key) {
        Ok(plain) => match std::str::from_utf8(&plain) {
            Ok(text) => MessageBody::Plaintext(text.to_string()),
            Err(_) => MessageBody::Corrupted,
        },
        Err(_) => MessageBody::SignalMismatch,
    }
}

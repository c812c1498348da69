//! vanish_proto: wire packet, message records and lifecycle rules for Vanish
//!
//! The packet is the only bit-exact contract: stored records written by
//! earlier clients must keep decoding. Everything else here is plain data
//! plus pure functions; nothing in this crate performs I/O.
//!
//! # Modules
//! - `packet`: `{iv, content, keys}` envelope, decode fallbacks, recipient lookup
//! - `record`: `MessageRecord`, partial-update patches, reactions, conversation filter
//! - `policy`: per-send lifecycle policy (none / view-once / fixed duration)
//! - `lifecycle`: view-once, expiry and save state machine
//! - `event`: realtime insert/update/delete events

pub mod event;
pub mod lifecycle;
pub mod packet;
pub mod policy;
pub mod record;

pub use event::{EventKind, RealtimeEvent};
pub use lifecycle::LifecycleError;
pub use packet::{Decoded, KeyLookup, Packet, PacketError, RawPacket};
pub use policy::{LifecyclePolicy, PolicyParseError};
pub use record::{Conversation, MediaAttachment, MediaType, MessageRecord, Reactions, RecordPatch};

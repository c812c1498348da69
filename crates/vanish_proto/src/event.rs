//! Realtime change events for one conversation.

use serde::{Deserialize, Serialize};

use crate::record::MessageRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// Delivery order across the bus is not guaranteed; consumers reconcile by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "lowercase")]
pub enum RealtimeEvent {
    Insert(MessageRecord),
    Update(MessageRecord),
    Delete { id: String },
}

impl RealtimeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RealtimeEvent::Insert(_) => EventKind::Insert,
            RealtimeEvent::Update(_) => EventKind::Update,
            RealtimeEvent::Delete { .. } => EventKind::Delete,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            RealtimeEvent::Insert(r) | RealtimeEvent::Update(r) => &r.id,
            RealtimeEvent::Delete { id } => id,
        }
    }
}

//! Collaborator interfaces consumed by the conversation core.
//!
//! The core never owns storage, transport or key discovery. It talks to:
//! - [`MessageStore`]: persists opaque records
//! - [`RealtimeBus`]: per-conversation insert/update/delete feed
//! - [`Directory`]: published identity public keys

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use vanish_proto::lifecycle;
use vanish_proto::{Conversation, MessageRecord, RealtimeEvent, RecordPatch};

use crate::error::StoreError;

/// Server-side selection for bulk deletes and id queries.
///
/// Purge filters carry their predicate to the store, so a record saved
/// after the caller last looked is never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    /// Every record exchanged between the two participants.
    Conversation(Conversation),
    /// `is_view_once AND is_viewed AND NOT is_saved`
    ViewedViewOnce,
    /// `expires_at < cutoff AND NOT is_saved`
    ExpiredBefore(DateTime<Utc>),
    /// `id IN ids AND expires_at <= now AND NOT is_saved`: a client sweep.
    ExpiredAmong {
        ids: BTreeSet<String>,
        now: DateTime<Utc>,
    },
}

impl RecordFilter {
    pub fn matches(&self, record: &MessageRecord) -> bool {
        match self {
            RecordFilter::Conversation(c) => c.contains(record),
            RecordFilter::ViewedViewOnce => lifecycle::is_viewed_view_once(record),
            RecordFilter::ExpiredBefore(cutoff) => lifecycle::is_expired_before(record, *cutoff),
            RecordFilter::ExpiredAmong { ids, now } => {
                ids.contains(&record.id) && lifecycle::is_expired(record, *now)
            }
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, record: &MessageRecord) -> Result<(), StoreError>;

    /// Apply the set fields of `patch` to record `id`.
    async fn update_fields(&self, id: &str, patch: &RecordPatch) -> Result<(), StoreError>;

    /// Returns the number of records actually removed. Unknown ids are ignored.
    async fn delete_by_ids(&self, ids: &BTreeSet<String>) -> Result<u64, StoreError>;

    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<u64, StoreError>;

    /// Records of one conversation, `created_at` ascending.
    async fn query(&self, conversation: &Conversation) -> Result<Vec<MessageRecord>, StoreError>;

    async fn query_ids(&self, filter: &RecordFilter) -> Result<BTreeSet<String>, StoreError>;
}

/// Lazy, non-restartable event feed for one conversation. Dropping it
/// unsubscribes.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<RealtimeEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::UnboundedReceiver<RealtimeEvent>) -> Self {
        Self { rx }
    }

    /// `None` once the bus side has gone away.
    pub async fn next(&mut self) -> Option<RealtimeEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_next(&mut self) -> Option<RealtimeEvent> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait RealtimeBus: Send + Sync {
    async fn subscribe(&self, conversation: &Conversation) -> Result<EventStream, StoreError>;
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Base64 SPKI public key, or `None` if the user never published one.
    async fn get_public_key(&self, user_id: &str) -> Result<Option<String>, StoreError>;

    async fn publish_public_key(
        &self,
        user_id: &str,
        public_key_b64: &str,
    ) -> Result<(), StoreError>;
}

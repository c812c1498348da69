//! Local view of one conversation.
//!
//! A single `Timeline` lives behind the session's mutex; every realtime
//! event, sweep and user action mutates it in one locked step. Ids deleted
//! from the store are remembered so a late insert or update cannot
//! resurrect them. Records dropped locally because they expired are not:
//! the store may still hold them if the peer saved them meanwhile.

use std::collections::{BTreeSet, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use vanish_proto::lifecycle;
use vanish_proto::{MessageRecord, RecordPatch};

use crate::decrypt::MessageBody;

/// Deleted ids remembered per session; the oldest are forgotten first.
pub const TOMBSTONE_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    pub record: MessageRecord,
    /// Decrypted once on ingest, kept across updates.
    pub body: MessageBody,
}

impl LocalMessage {
    /// Countdown text for an expiring, unsaved record.
    pub fn expiry_label(&self, now: DateTime<Utc>) -> Option<String> {
        if self.record.is_saved {
            return None;
        }
        self.record
            .expires_at
            .map(|at| lifecycle::remaining_label(at, now))
    }
}

#[derive(Debug, Default)]
struct Tombstones {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl Tombstones {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn add(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > TOMBSTONE_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Default)]
pub struct Timeline {
    /// Ascending `created_at`; ties keep arrival order.
    messages: Vec<LocalMessage>,
    removed: Tombstones,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.record.id == id)
    }

    /// Whether an event for `id` would change anything: unknown and not removed.
    pub fn is_new(&self, id: &str) -> bool {
        !self.removed.contains(id) && !self.contains(id)
    }

    /// Insert in `created_at` order. No-op (returns false) if the id is
    /// already present or was removed.
    pub fn insert(&mut self, msg: LocalMessage) -> bool {
        if !self.is_new(&msg.record.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.record.created_at <= msg.record.created_at);
        self.messages.insert(at, msg);
        true
    }

    /// Merge a record from the feed, keeping the decrypted body. Lifecycle
    /// flags never move backwards. Returns false if the id is unknown.
    pub fn update_record(&mut self, record: MessageRecord) -> bool {
        match self.get_mut(&record.id) {
            Some(m) => {
                m.record = lifecycle::reconcile(&m.record, record);
                true
            }
            None => false,
        }
    }

    pub fn patch(&mut self, id: &str, patch: &RecordPatch) -> bool {
        match self.get_mut(id) {
            Some(m) => {
                patch.apply(&mut m.record);
                true
            }
            None => false,
        }
    }

    pub fn set_body(&mut self, id: &str, body: MessageBody) {
        if let Some(m) = self.get_mut(id) {
            m.body = body;
        }
    }

    /// Drop a record the store deleted, remembering its id.
    pub fn remove(&mut self, id: &str) -> Option<LocalMessage> {
        self.removed.add(id.to_string());
        let at = self.messages.iter().position(|m| m.record.id == id)?;
        Some(self.messages.remove(at))
    }

    /// Drop records that expired locally. Their ids are not remembered.
    pub fn expire_many(&mut self, ids: &BTreeSet<String>) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| !ids.contains(&m.record.id));
        before - self.messages.len()
    }

    /// Drop every message, remembering their ids as removed.
    pub fn clear(&mut self) -> usize {
        let ids: Vec<String> = self.messages.drain(..).map(|m| m.record.id).collect();
        let n = ids.len();
        for id in ids {
            self.removed.add(id);
        }
        n
    }

    pub fn get(&self, id: &str) -> Option<&LocalMessage> {
        self.messages.iter().find(|m| m.record.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut LocalMessage> {
        self.messages.iter_mut().find(|m| m.record.id == id)
    }

    pub fn records(&self) -> impl Iterator<Item = &MessageRecord> {
        self.messages.iter().map(|m| &m.record)
    }

    /// Records still waiting for the vault to unlock.
    pub fn locked(&self) -> Vec<MessageRecord> {
        self.messages
            .iter()
            .filter(|m| m.body == MessageBody::Locked)
            .map(|m| m.record.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<LocalMessage> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn tombstone_count(&self) -> usize {
        self.removed.len()
    }
}

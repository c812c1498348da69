//! Message records as persisted by the store and mirrored by the realtime feed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::policy::LifecyclePolicy;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    Location,
    /// Camera capture. Always view-once.
    Snapshot,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown media type: {0}")]
pub struct UnknownMediaType(pub String);

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Text => "text",
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Location => "location",
            MediaType::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = UnknownMediaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MediaType::Text),
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            "location" => Ok(MediaType::Location),
            "snapshot" => Ok(MediaType::Snapshot),
            other => Err(UnknownMediaType(other.to_string())),
        }
    }
}

/// Reference to an uploaded media object. The object itself lives in external
/// storage; only its URL travels with the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub media_type: MediaType,
    pub url: String,
}

/// emoji -> users who reacted with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reactions(BTreeMap<String, BTreeSet<String>>);

impl Reactions {
    /// Flip `user_id`'s membership for `emoji`. Returns whether the user now
    /// reacts with it. Emojis left with no users are dropped.
    pub fn toggle(&mut self, emoji: &str, user_id: &str) -> bool {
        let users = self.0.entry(emoji.to_string()).or_default();
        let added = if users.remove(user_id) {
            false
        } else {
            users.insert(user_id.to_string());
            true
        };
        if users.is_empty() {
            self.0.remove(emoji);
        }
        added
    }

    pub fn users(&self, emoji: &str) -> Option<&BTreeSet<String>> {
        self.0.get(emoji)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    /// Packet in string form. `None` for records written before encryption.
    #[serde(rename = "encrypted_content", default)]
    pub encrypted_packet: Option<String>,
    /// Legacy plaintext body.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub media_type: MediaType,
    #[serde(default)]
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_viewed: bool,
    #[serde(default)]
    pub viewed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_delivered: bool,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_view_once: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub view_count: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_saved: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reactions: Reactions,
}

/// Stored rows may carry explicit nulls where a value was never set.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl MessageRecord {
    /// Build a freshly sent record with `policy` applied.
    pub fn outgoing(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        encrypted_packet: String,
        media: Option<MediaAttachment>,
        policy: LifecyclePolicy,
        created_at: DateTime<Utc>,
    ) -> Self {
        let (media_type, media_url) = match media {
            Some(m) => (m.media_type, Some(m.url)),
            None => (MediaType::Text, None),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            encrypted_packet: Some(encrypted_packet),
            content: None,
            media_type,
            media_url,
            created_at,
            is_viewed: false,
            viewed_at: None,
            is_delivered: false,
            delivered_at: None,
            is_view_once: policy.is_view_once() || media_type == MediaType::Snapshot,
            view_count: 0,
            is_saved: false,
            expires_at: policy.expires_at(created_at),
            reactions: Reactions::default(),
        }
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }

    pub fn is_addressed_to(&self, user_id: &str) -> bool {
        self.receiver_id == user_id
    }
}

/// Partial update for `MessageStore::update_fields`. Unset fields are left
/// untouched and are omitted when serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_viewed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_delivered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_saved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Reactions>,
}

impl RecordPatch {
    pub fn viewed(mut self, at: DateTime<Utc>) -> Self {
        self.is_viewed = Some(true);
        self.viewed_at = Some(at);
        self
    }

    pub fn delivered(mut self, at: DateTime<Utc>) -> Self {
        self.is_delivered = Some(true);
        self.delivered_at = Some(at);
        self
    }

    pub fn view_count(mut self, count: u32) -> Self {
        self.view_count = Some(count);
        self
    }

    pub fn saved(mut self) -> Self {
        self.is_saved = Some(true);
        self
    }

    pub fn reactions(mut self, reactions: Reactions) -> Self {
        self.reactions = Some(reactions);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, record: &mut MessageRecord) {
        if let Some(v) = self.is_viewed {
            record.is_viewed = v;
        }
        if let Some(at) = self.viewed_at {
            record.viewed_at = Some(at);
        }
        if let Some(v) = self.is_delivered {
            record.is_delivered = v;
        }
        if let Some(at) = self.delivered_at {
            record.delivered_at = Some(at);
        }
        if let Some(n) = self.view_count {
            record.view_count = n;
        }
        if let Some(v) = self.is_saved {
            record.is_saved = v;
        }
        if let Some(r) = &self.reactions {
            record.reactions = r.clone();
        }
    }
}

/// The two participants of a direct conversation. Order does not matter:
/// `between(a, b) == between(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Conversation {
    low: String,
    high: String,
}

impl Conversation {
    pub fn between(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }

    pub fn contains(&self, record: &MessageRecord) -> bool {
        (record.sender_id == self.low && record.receiver_id == self.high)
            || (record.sender_id == self.high && record.receiver_id == self.low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn toggle_is_a_set_flip() {
        let mut r = Reactions::default();
        assert!(r.toggle("🔥", "alice"));
        assert!(r.toggle("🔥", "bob"));
        assert_eq!(r.users("🔥").unwrap().len(), 2);
        assert!(!r.toggle("🔥", "alice"));
        assert!(!r.toggle("🔥", "bob"));
        assert!(r.users("🔥").is_none());
        assert!(r.is_empty());
    }

    #[test]
    fn duplicate_reactors_collapse_on_decode() {
        let r: Reactions = serde_json::from_value(json!({"👍": ["a", "a", "b"]})).unwrap();
        assert_eq!(r.users("👍").unwrap().len(), 2);
    }

    #[test]
    fn outgoing_applies_policy() {
        let plain = MessageRecord::outgoing(
            "a",
            "b",
            "{}".into(),
            None,
            LifecyclePolicy::None,
            now(),
        );
        assert!(!plain.is_view_once);
        assert_eq!(plain.expires_at, None);
        assert_eq!(plain.media_type, MediaType::Text);

        let timed = MessageRecord::outgoing(
            "a",
            "b",
            "{}".into(),
            None,
            LifecyclePolicy::Expiring(Duration::hours(1)),
            now(),
        );
        assert_eq!(timed.expires_at, Some(now() + Duration::seconds(3600)));

        let once = MessageRecord::outgoing(
            "a",
            "b",
            "{}".into(),
            None,
            LifecyclePolicy::ViewOnce,
            now(),
        );
        assert!(once.is_view_once);
        assert_eq!(once.view_count, 0);
        assert_ne!(plain.id, once.id);
    }

    #[test]
    fn snapshots_are_always_view_once() {
        let media = MediaAttachment {
            media_type: MediaType::Snapshot,
            url: "https://media.example/snap.jpg".into(),
        };
        let rec = MessageRecord::outgoing(
            "a",
            "b",
            "{}".into(),
            Some(media),
            LifecyclePolicy::None,
            now(),
        );
        assert!(rec.is_view_once);
        assert_eq!(rec.media_url.as_deref(), Some("https://media.example/snap.jpg"));
    }

    #[test]
    fn nulls_in_stored_rows_become_defaults() {
        let rec: MessageRecord = serde_json::from_value(json!({
            "id": "m1",
            "sender_id": "a",
            "receiver_id": "b",
            "encrypted_content": null,
            "content": "old school",
            "media_type": null,
            "created_at": "2024-05-01T12:00:00Z",
            "is_viewed": null,
            "view_count": null,
            "is_saved": null,
            "reactions": null
        }))
        .unwrap();
        assert_eq!(rec.encrypted_packet, None);
        assert_eq!(rec.content.as_deref(), Some("old school"));
        assert_eq!(rec.media_type, MediaType::Text);
        assert_eq!(rec.view_count, 0);
        assert!(!rec.is_saved);
        assert!(rec.reactions.is_empty());
    }

    #[test]
    fn packet_field_uses_store_column_name() {
        let rec = MessageRecord::outgoing(
            "a",
            "b",
            "pkt".into(),
            None,
            LifecyclePolicy::None,
            now(),
        );
        let value = serde_json::to_value(&rec).unwrap();
        assert_eq!(value["encrypted_content"], "pkt");
        assert_eq!(value["media_type"], "text");
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let mut rec = MessageRecord::outgoing(
            "a",
            "b",
            "pkt".into(),
            None,
            LifecyclePolicy::ViewOnce,
            now(),
        );
        let patch = RecordPatch::default().view_count(1);
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({"view_count": 1}));
        patch.apply(&mut rec);
        assert_eq!(rec.view_count, 1);
        assert!(!rec.is_viewed);

        RecordPatch::default().saved().viewed(now()).apply(&mut rec);
        assert!(rec.is_saved && rec.is_viewed);
        assert_eq!(rec.viewed_at, Some(now()));
        assert!(RecordPatch::default().is_empty());
    }

    #[test]
    fn conversation_is_unordered() {
        let c = Conversation::between("bob", "alice");
        assert_eq!(c, Conversation::between("alice", "bob"));
        let ab = MessageRecord::outgoing(
            "alice",
            "bob",
            "x".into(),
            None,
            LifecyclePolicy::None,
            now(),
        );
        let ba = MessageRecord::outgoing(
            "bob",
            "alice",
            "x".into(),
            None,
            LifecyclePolicy::None,
            now(),
        );
        let ac = MessageRecord::outgoing(
            "alice",
            "carol",
            "x".into(),
            None,
            LifecyclePolicy::None,
            now(),
        );
        assert!(c.contains(&ab) && c.contains(&ba));
        assert!(!c.contains(&ac));
    }

    #[test]
    fn media_type_parses_its_own_names() {
        for t in [
            MediaType::Text,
            MediaType::Image,
            MediaType::Video,
            MediaType::Audio,
            MediaType::Location,
            MediaType::Snapshot,
        ] {
            assert_eq!(t.as_str().parse::<MediaType>().unwrap(), t);
        }
        assert!("gif".parse::<MediaType>().is_err());
    }
}

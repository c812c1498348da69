//! In-process implementations of the collaborator traits.
//!
//! `InMemoryStore` publishes every mutation to an attached `InMemoryBus`,
//! the way a hosted database with change feeds would. Both can be switched
//! into an unavailable state to exercise transient-failure paths.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;
use vanish_proto::{Conversation, MessageRecord, RealtimeEvent, RecordPatch};

use crate::error::StoreError;
use crate::traits::{Directory, EventStream, MessageStore, RealtimeBus, RecordFilter};

// ── Realtime bus ──────────────────────────────────────────────────────────────

type Subscriber = (Conversation, mpsc::UnboundedSender<RealtimeEvent>);

#[derive(Clone, Default)]
pub struct InMemoryBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan `event` out to every live subscriber of `conversation`.
    /// Returns how many received it.
    pub async fn publish(&self, conversation: &Conversation, event: RealtimeEvent) -> usize {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|(_, tx)| !tx.is_closed());
        subs.iter()
            .filter(|(c, _)| c == conversation)
            .filter(|(_, tx)| tx.send(event.clone()).is_ok())
            .count()
    }

    pub async fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|(_, tx)| !tx.is_closed());
        subs.len()
    }
}

#[async_trait]
impl RealtimeBus for InMemoryBus {
    async fn subscribe(&self, conversation: &Conversation) -> Result<EventStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push((conversation.clone(), tx));
        Ok(EventStream::new(rx))
    }
}

// ── Message store ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct StoreInner {
    records: Vec<MessageRecord>,
    unavailable: Option<String>,
}

impl StoreInner {
    fn check(&self) -> Result<(), StoreError> {
        match &self.unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<StoreInner>>,
    bus: Option<InMemoryBus>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish inserts, updates and deletes to `bus`.
    pub fn with_bus(bus: InMemoryBus) -> Self {
        Self {
            inner: Arc::default(),
            bus: Some(bus),
        }
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`
    /// (`Some`) or succeed again (`None`).
    pub async fn set_unavailable(&self, reason: Option<&str>) {
        self.inner.lock().await.unavailable = reason.map(str::to_string);
    }

    pub async fn get(&self, id: &str) -> Option<MessageRecord> {
        self.inner.lock().await.records.iter().find(|r| r.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn publish_all(&self, events: Vec<(Conversation, RealtimeEvent)>) {
        if let Some(bus) = &self.bus {
            for (conversation, event) in events {
                bus.publish(&conversation, event).await;
            }
        }
    }

    async fn remove_where(
        &self,
        pred: impl Fn(&MessageRecord) -> bool + Send,
    ) -> Result<u64, StoreError> {
        let removed: Vec<MessageRecord> = {
            let mut inner = self.inner.lock().await;
            inner.check()?;
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.records)
                .into_iter()
                .partition(|r| pred(r));
            inner.records = kept;
            gone
        };
        let count = removed.len() as u64;
        self.publish_all(
            removed
                .into_iter()
                .map(|r| {
                    let conversation = Conversation::between(&r.sender_id, &r.receiver_id);
                    (conversation, RealtimeEvent::Delete { id: r.id })
                })
                .collect(),
        )
        .await;
        debug!(count, "in-memory store removed records");
        Ok(count)
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn insert(&self, record: &MessageRecord) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().await;
            inner.check()?;
            if inner.records.iter().any(|r| r.id == record.id) {
                return Err(StoreError::InvalidRow(format!("duplicate id {}", record.id)));
            }
            inner.records.push(record.clone());
        }
        let conversation = Conversation::between(&record.sender_id, &record.receiver_id);
        self.publish_all(vec![(conversation, RealtimeEvent::Insert(record.clone()))])
            .await;
        Ok(())
    }

    async fn update_fields(&self, id: &str, patch: &RecordPatch) -> Result<(), StoreError> {
        let updated = {
            let mut inner = self.inner.lock().await;
            inner.check()?;
            let record = inner
                .records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            patch.apply(record);
            record.clone()
        };
        let conversation = Conversation::between(&updated.sender_id, &updated.receiver_id);
        self.publish_all(vec![(conversation, RealtimeEvent::Update(updated))])
            .await;
        Ok(())
    }

    async fn delete_by_ids(&self, ids: &BTreeSet<String>) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.remove_where(|r| ids.contains(&r.id)).await
    }

    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        self.remove_where(|r| filter.matches(r)).await
    }

    async fn query(&self, conversation: &Conversation) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check()?;
        let mut out: Vec<MessageRecord> = inner
            .records
            .iter()
            .filter(|r| conversation.contains(r))
            .cloned()
            .collect();
        // Stable: equal timestamps keep insertion order.
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn query_ids(&self, filter: &RecordFilter) -> Result<BTreeSet<String>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check()?;
        Ok(inner
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| r.id.clone())
            .collect())
    }
}

// ── Directory ─────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    keys: Arc<RwLock<HashMap<String, String>>>,
    unavailable: Arc<RwLock<Option<String>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.write().await = reason.map(str::to_string);
    }

    async fn check(&self) -> Result<(), StoreError> {
        match self.unavailable.read().await.as_ref() {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn get_public_key(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        self.check().await?;
        Ok(self.keys.read().await.get(user_id).cloned())
    }

    async fn publish_public_key(
        &self,
        user_id: &str,
        public_key_b64: &str,
    ) -> Result<(), StoreError> {
        self.check().await?;
        self.keys
            .write()
            .await
            .insert(user_id.to_string(), public_key_b64.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use vanish_proto::LifecyclePolicy;

    fn record(from: &str, to: &str) -> MessageRecord {
        MessageRecord::outgoing(from, to, "pkt".into(), None, LifecyclePolicy::None, Utc::now())
    }

    #[tokio::test]
    async fn mutations_are_published_to_the_conversation() {
        let bus = InMemoryBus::new();
        let store = InMemoryStore::with_bus(bus.clone());
        let ab = Conversation::between("a", "b");
        let mut feed = bus.subscribe(&ab).await.unwrap();
        let mut other = bus.subscribe(&Conversation::between("a", "c")).await.unwrap();

        let rec = record("a", "b");
        store.insert(&rec).await.unwrap();
        store
            .update_fields(&rec.id, &RecordPatch::default().saved())
            .await
            .unwrap();
        store.delete_by_ids(&BTreeSet::from([rec.id.clone()])).await.unwrap();

        assert!(matches!(feed.next().await, Some(RealtimeEvent::Insert(r)) if r.id == rec.id));
        assert!(matches!(feed.next().await, Some(RealtimeEvent::Update(r)) if r.is_saved));
        assert_eq!(feed.next().await, Some(RealtimeEvent::Delete { id: rec.id.clone() }));
        assert_eq!(other.try_next(), None);
    }

    #[tokio::test]
    async fn dropped_streams_unsubscribe() {
        let bus = InMemoryBus::new();
        let feed = bus.subscribe(&Conversation::between("a", "b")).await.unwrap();
        assert_eq!(bus.subscriber_count().await, 1);
        drop(feed);
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn query_orders_by_creation_time() {
        let store = InMemoryStore::new();
        let mut late = record("a", "b");
        late.created_at = Utc::now() + Duration::minutes(5);
        let early = record("b", "a");
        store.insert(&late).await.unwrap();
        store.insert(&early).await.unwrap();
        store.insert(&record("a", "c")).await.unwrap();

        let got = store.query(&Conversation::between("a", "b")).await.unwrap();
        let ids: Vec<_> = got.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![early.id.as_str(), late.id.as_str()]);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryStore::new();
        let rec = record("a", "b");
        store.insert(&rec).await.unwrap();
        assert!(store.insert(&rec).await.is_err());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(Some("maintenance")).await;
        assert!(matches!(
            store.insert(&record("a", "b")).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(None).await;
        assert!(store.insert(&record("a", "b")).await.is_ok());
    }

    #[tokio::test]
    async fn filters_select_purge_candidates() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut viewed_once = record("a", "b");
        viewed_once.is_view_once = true;
        viewed_once.is_viewed = true;
        let mut saved_once = viewed_once.clone();
        saved_once.id = "saved".into();
        saved_once.is_saved = true;
        let mut expired = record("a", "b");
        expired.expires_at = Some(now - Duration::seconds(1));
        let plain = record("a", "b");

        for r in [&viewed_once, &saved_once, &expired, &plain] {
            store.insert(r).await.unwrap();
        }

        assert_eq!(
            store.query_ids(&RecordFilter::ViewedViewOnce).await.unwrap(),
            BTreeSet::from([viewed_once.id.clone()])
        );
        assert_eq!(
            store.query_ids(&RecordFilter::ExpiredBefore(now)).await.unwrap(),
            BTreeSet::from([expired.id.clone()])
        );
        let removed = store
            .delete_by_filter(&RecordFilter::Conversation(Conversation::between("b", "a")))
            .await
            .unwrap();
        assert_eq!(removed, 4);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_filter_spares_records_saved_meanwhile() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut expired = record("a", "b");
        expired.expires_at = Some(now);
        let mut saved = expired.clone();
        saved.id = "saved".into();
        store.insert(&expired).await.unwrap();
        store.insert(&saved).await.unwrap();
        store
            .update_fields("saved", &RecordPatch::default().saved())
            .await
            .unwrap();

        let filter = RecordFilter::ExpiredAmong {
            ids: BTreeSet::from([expired.id.clone(), "saved".to_string()]),
            now,
        };
        assert_eq!(store.delete_by_filter(&filter).await.unwrap(), 1);
        assert!(store.get(&expired.id).await.is_none());
        assert!(store.get("saved").await.is_some());
    }

    #[tokio::test]
    async fn directory_roundtrip() {
        let dir = InMemoryDirectory::new();
        assert_eq!(dir.get_public_key("a").await.unwrap(), None);
        dir.publish_public_key("a", "cGs=").await.unwrap();
        assert_eq!(dir.get_public_key("a").await.unwrap().as_deref(), Some("cGs="));
        dir.set_unavailable(Some("offline")).await;
        assert!(dir.get_public_key("a").await.is_err());
    }
}

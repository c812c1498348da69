use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Notify;
use vanish_crypto::IdentityKeyPair;
use vanish_proto::{Conversation, LifecyclePolicy, MessageRecord, RecordPatch};
use vanish_session::{Collaborators, ConversationSession, Outgoing, SessionError, SessionSettings};
use vanish_store::{
    Directory, InMemoryBus, InMemoryDirectory, InMemoryStore, MessageStore, RecordFilter,
    StoreError, Vault,
};

fn alice_key() -> &'static IdentityKeyPair {
    static KEY: OnceLock<IdentityKeyPair> = OnceLock::new();
    KEY.get_or_init(|| IdentityKeyPair::generate_with_bits(2048).unwrap())
}

fn bob_key() -> &'static IdentityKeyPair {
    static KEY: OnceLock<IdentityKeyPair> = OnceLock::new();
    KEY.get_or_init(|| IdentityKeyPair::generate_with_bits(2048).unwrap())
}

/// Holds a call open until the test lets it through.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

struct GatedDirectory {
    inner: InMemoryDirectory,
    gate: Arc<Gate>,
}

#[async_trait]
impl Directory for GatedDirectory {
    async fn get_public_key(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        self.gate.pass().await;
        self.inner.get_public_key(user_id).await
    }

    async fn publish_public_key(
        &self,
        user_id: &str,
        public_key_b64: &str,
    ) -> Result<(), StoreError> {
        self.inner.publish_public_key(user_id, public_key_b64).await
    }
}

/// Store whose history queries are gated.
struct GatedStore {
    inner: InMemoryStore,
    gate: Arc<Gate>,
}

#[async_trait]
impl MessageStore for GatedStore {
    async fn insert(&self, record: &MessageRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn update_fields(&self, id: &str, patch: &RecordPatch) -> Result<(), StoreError> {
        self.inner.update_fields(id, patch).await
    }

    async fn delete_by_ids(&self, ids: &BTreeSet<String>) -> Result<u64, StoreError> {
        self.inner.delete_by_ids(ids).await
    }

    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        self.inner.delete_by_filter(filter).await
    }

    async fn query(&self, conversation: &Conversation) -> Result<Vec<MessageRecord>, StoreError> {
        let records = self.inner.query(conversation).await;
        self.gate.pass().await;
        records
    }

    async fn query_ids(&self, filter: &RecordFilter) -> Result<BTreeSet<String>, StoreError> {
        self.inner.query_ids(filter).await
    }
}

async fn directory() -> InMemoryDirectory {
    let directory = InMemoryDirectory::new();
    for (user, key) in [("alice", alice_key()), ("bob", bob_key())] {
        directory
            .publish_public_key(user, &key.public_b64().unwrap())
            .await
            .unwrap();
    }
    directory
}

async fn vault_for(key: &IdentityKeyPair) -> Vault {
    let vault = Vault::with_auto_lock(0);
    vault.unlock_with_identity(key.clone()).await;
    vault
}

fn session(
    me: &str,
    peer: &str,
    vault: Vault,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn Directory>,
    bus: &InMemoryBus,
    settings: SessionSettings,
) -> Arc<ConversationSession> {
    let collaborators = Collaborators {
        store,
        bus: Arc::new(bus.clone()),
        directory,
    };
    Arc::new(ConversationSession::new(me, peer, vault, collaborators, settings))
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn send_finishing_after_close_is_discarded() {
    let store = InMemoryStore::new();
    let bus = InMemoryBus::new();
    let gate = Arc::new(Gate::default());
    let gated = GatedDirectory {
        inner: directory().await,
        gate: Arc::clone(&gate),
    };
    let alice = session(
        "alice",
        "bob",
        vault_for(alice_key()).await,
        Arc::new(store.clone()),
        Arc::new(gated),
        &bus,
        SessionSettings::default(),
    );

    let sending = tokio::spawn({
        let alice = Arc::clone(&alice);
        async move {
            alice
                .send(Outgoing::text("too late"), LifecyclePolicy::None)
                .await
        }
    });
    gate.entered.notified().await;
    alice.close().await;
    gate.release.notify_one();

    let result = sending.await.unwrap();
    assert!(matches!(result, Err(SessionError::Closed)));
    assert!(store.is_empty().await);
    assert!(alice.messages().await.is_empty());
}

#[tokio::test]
async fn history_decrypted_after_close_is_discarded() {
    let store = InMemoryStore::new();
    let bus = InMemoryBus::new();
    let directory = directory().await;

    let alice = session(
        "alice",
        "bob",
        vault_for(alice_key()).await,
        Arc::new(store.clone()),
        Arc::new(directory.clone()),
        &bus,
        SessionSettings::default(),
    );
    let sent = alice
        .send(Outgoing::text("hello"), LifecyclePolicy::None)
        .await
        .unwrap();

    let gate = Arc::new(Gate::default());
    let gated = GatedStore {
        inner: store.clone(),
        gate: Arc::clone(&gate),
    };
    let bob = session(
        "bob",
        "alice",
        vault_for(bob_key()).await,
        Arc::new(gated),
        Arc::new(directory),
        &bus,
        SessionSettings::default(),
    );

    let loading = tokio::spawn({
        let bob = Arc::clone(&bob);
        async move { bob.load_history().await }
    });
    gate.entered.notified().await;
    bob.close().await;
    gate.release.notify_one();

    assert!(matches!(loading.await.unwrap(), Err(SessionError::Closed)));
    assert!(bob.messages().await.is_empty());
    // No delivery ack was written for the discarded record.
    assert!(!store.get(&sent.id).await.unwrap().is_delivered);
}

#[tokio::test]
async fn close_stops_the_sweep_timer_and_the_feed() {
    let store = InMemoryStore::new();
    let bus = InMemoryBus::new();
    let directory = directory().await;
    let settings = SessionSettings {
        sweep_interval_secs: 1,
        ..SessionSettings::default()
    };

    let now = Utc::now();
    let mut to_bob =
        MessageRecord::outgoing("alice", "bob", "pkt".into(), None, LifecyclePolicy::None, now);
    to_bob.expires_at = Some(now + ChronoDuration::seconds(1));
    let mut to_carol = to_bob.clone();
    to_carol.id = "to-carol".into();
    to_carol.receiver_id = "carol".into();
    store.insert(&to_bob).await.unwrap();
    store.insert(&to_carol).await.unwrap();

    let make = |peer: &str, vault: Vault| {
        session(
            "alice",
            peer,
            vault,
            Arc::new(store.clone()),
            Arc::new(directory.clone()),
            &bus,
            settings.clone(),
        )
    };
    let closed = make("bob", vault_for(alice_key()).await);
    let open = make("carol", vault_for(alice_key()).await);
    closed.start().await.unwrap();
    open.start().await.unwrap();
    assert_eq!(closed.messages().await.len(), 1);
    assert_eq!(bus.subscriber_count().await, 2);

    tokio::time::timeout(Duration::from_secs(5), closed.close())
        .await
        .expect("close waits for its own tasks");
    assert_eq!(bus.subscriber_count().await, 1);

    // The open session's timer deletes its expired record...
    eventually(|| {
        let store = store.clone();
        async move { store.get("to-carol").await.is_none() }
    })
    .await;
    // ...while the closed one never sweeps again.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(store.get(&to_bob.id).await.is_some());
    assert!(matches!(
        closed.sweep_expired(Utc::now()).await,
        Err(SessionError::Closed)
    ));

    open.close().await;
}

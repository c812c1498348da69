//! One conversation between the local user and a peer.
//!
//! `ConversationSession` owns the local view of the conversation and talks to
//! the three collaborators. Every mutation of the local view runs under the
//! timeline mutex as a single read-modify-write step, so realtime events,
//! the expiry sweep and user actions cannot lose each other's updates.
//!
//! Lifecycle: `new` → `start` (subscribe, load history, sweep, spawn the
//! realtime consumer and sweep timer) → `close` (stop both tasks; crypto
//! finishing afterwards is discarded).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vanish_crypto::cipher::{encrypt_content, generate_symmetric_key, wrap_key_for_recipient};
use vanish_crypto::{CryptoError, IdentityKeyPair, PublicIdentityKey};
use vanish_proto::lifecycle;
use vanish_proto::packet;
use vanish_proto::{
    Conversation, LifecyclePolicy, MediaAttachment, MessageRecord, RealtimeEvent, RecordPatch,
};
use vanish_store::{Directory, EventStream, MessageStore, RealtimeBus, RecordFilter, Vault};

use crate::config::SessionSettings;
use crate::decrypt::{decrypt_packet, decrypt_record, MessageBody};
use crate::error::SessionError;
use crate::identity::{IdentityService, RegenerationConsent};
use crate::state::{LocalMessage, Timeline};

/// External services a session depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MessageStore>,
    pub bus: Arc<dyn RealtimeBus>,
    pub directory: Arc<dyn Directory>,
}

/// What the user typed or attached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outgoing {
    pub text: String,
    pub media: Option<MediaAttachment>,
}

impl Outgoing {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: None,
        }
    }

    pub fn media(media: MediaAttachment, caption: impl Into<String>) -> Self {
        Self {
            text: caption.into(),
            media: Some(media),
        }
    }

    /// Text that gets encrypted. Media without a caption carries a single space.
    fn body(&self) -> Result<String, SessionError> {
        let text = self.text.trim();
        match (&self.media, text.is_empty()) {
            (None, true) => Err(SessionError::EmptyMessage),
            (Some(_), true) => Ok(" ".to_string()),
            (_, false) => Ok(text.to_string()),
        }
    }
}

pub struct ConversationSession {
    local_user: String,
    peer: String,
    conversation: Conversation,
    vault: Vault,
    store: Arc<dyn MessageStore>,
    bus: Arc<dyn RealtimeBus>,
    directory: Arc<dyn Directory>,
    identity: IdentityService,
    settings: SessionSettings,
    timeline: Mutex<Timeline>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConversationSession {
    pub fn new(
        local_user: impl Into<String>,
        peer: impl Into<String>,
        vault: Vault,
        collaborators: Collaborators,
        settings: SessionSettings,
    ) -> Self {
        let local_user = local_user.into();
        let peer = peer.into();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            conversation: Conversation::between(&local_user, &peer),
            identity: IdentityService::new(
                &local_user,
                vault.clone(),
                Arc::clone(&collaborators.directory),
            ),
            local_user,
            peer,
            vault,
            store: collaborators.store,
            bus: collaborators.bus,
            directory: collaborators.directory,
            settings,
            timeline: Mutex::new(Timeline::new()),
            closed: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Modulus size used when regenerating the identity.
    pub fn with_identity_bits(mut self, bits: usize) -> Self {
        self.identity = self.identity.with_modulus_bits(bits);
        self
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Policy to preselect for the next `send`.
    pub fn default_policy(&self) -> LifecyclePolicy {
        self.settings.default_policy
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Subscribe before loading history so nothing written in between is
    /// missed; duplicates are dropped by id.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        self.ensure_open()?;
        let stream = self.bus.subscribe(&self.conversation).await?;
        let loaded = self.load_history().await?;
        self.sweep_expired(Utc::now()).await?;

        let consumer =
            spawn_event_consumer(Arc::downgrade(self), stream, self.shutdown_tx.subscribe());
        let sweeper = spawn_sweep_loop(
            Arc::downgrade(self),
            self.settings.sweep_interval(),
            self.shutdown_tx.subscribe(),
        );
        self.tasks.lock().await.extend([consumer, sweeper]);
        info!(peer = %self.peer, loaded, "conversation session started");
        Ok(())
    }

    /// Stop the sweep timer and the realtime consumer. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "session task ended abnormally");
            }
        }
        info!(peer = %self.peer, "conversation session closed");
    }

    // ── Messaging ────────────────────────────────────────────────────────────

    /// Encrypt for both participants, persist, then append locally.
    ///
    /// The recipient's key is fetched on every call. Precondition failures
    /// (empty message, no local identity, no recipient key) happen before any
    /// store write, and a failed insert leaves no local record.
    pub async fn send(
        &self,
        outgoing: Outgoing,
        policy: LifecyclePolicy,
    ) -> Result<MessageRecord, SessionError> {
        self.ensure_open()?;
        let body = outgoing.body()?;
        let identity = self.vault.identity().await?;

        let recipient_b64 = self
            .directory
            .get_public_key(&self.peer)
            .await?
            .ok_or_else(|| SessionError::RecipientKeyUnavailable(self.peer.clone()))?;
        let recipient = PublicIdentityKey::from_b64(&recipient_b64)?;

        let sender_id = self.local_user.clone();
        let receiver_id = self.peer.clone();
        let plaintext = body.clone();
        let packet = tokio::task::spawn_blocking(move || {
            seal_message(
                &plaintext,
                &[(sender_id.as_str(), identity.public()), (receiver_id.as_str(), &recipient)],
            )
        })
        .await??;
        self.ensure_open()?;

        let record = MessageRecord::outgoing(
            &self.local_user,
            &self.peer,
            packet,
            outgoing.media,
            policy,
            Utc::now(),
        );
        self.store.insert(&record).await?;

        self.timeline.lock().await.insert(LocalMessage {
            record: record.clone(),
            body: MessageBody::Plaintext(body),
        });
        info!(message_id = %record.id, %policy, "message sent");
        Ok(record)
    }

    /// Decrypt a raw packet addressed to the local user. Decrypt failures
    /// come back as placeholder bodies, never as errors.
    pub async fn receive(&self, raw: &str) -> Result<MessageBody, SessionError> {
        self.ensure_open()?;
        let identity = self.vault.identity().await?;
        let own_id = self.local_user.clone();
        let raw = raw.to_string();
        let body =
            tokio::task::spawn_blocking(move || decrypt_packet(raw.as_str(), &own_id, &identity))
                .await?;
        self.ensure_open()?;
        Ok(body)
    }

    /// Reconcile one realtime event with the local view.
    ///
    /// Inserts of known ids are dropped. Updates keep the decrypted body and
    /// never roll lifecycle flags back; an update for an id not seen yet
    /// (delivered ahead of its insert) is ingested like an insert unless it
    /// has already expired. Deletes remove by id and are remembered.
    pub async fn apply_event(&self, event: RealtimeEvent) -> Result<(), SessionError> {
        self.ensure_open()?;
        debug!(kind = ?event.kind(), message_id = event.record_id(), "realtime event");
        match event {
            RealtimeEvent::Insert(record) => {
                self.ingest(record).await?;
            }
            RealtimeEvent::Update(record) => {
                if !self.conversation.contains(&record) {
                    return Ok(());
                }
                let updated = self.timeline.lock().await.update_record(record.clone());
                if !updated && !lifecycle::is_expired(&record, Utc::now()) {
                    self.ingest(record).await?;
                }
            }
            RealtimeEvent::Delete { id } => {
                self.timeline.lock().await.remove(&id);
            }
        }
        Ok(())
    }

    /// Load the stored conversation. Returns how many records were new.
    pub async fn load_history(&self) -> Result<usize, SessionError> {
        self.ensure_open()?;
        let records = self.store.query(&self.conversation).await?;
        let mut loaded = 0;
        for record in records {
            if self.ingest(record).await? {
                loaded += 1;
            }
        }
        debug!(peer = %self.peer, loaded, "history loaded");
        Ok(loaded)
    }

    async fn ingest(&self, record: MessageRecord) -> Result<bool, SessionError> {
        if !self.conversation.contains(&record) {
            debug!(message_id = %record.id, "record outside this conversation ignored");
            return Ok(false);
        }
        if !self.timeline.lock().await.is_new(&record.id) {
            return Ok(false);
        }

        let body = self.decrypt_for_timeline(&record).await?;
        self.ensure_open()?;
        let ack = self.acknowledgement(&record, Utc::now());

        let mut timeline = self.timeline.lock().await;
        let id = record.id.clone();
        if !timeline.insert(LocalMessage { record, body }) {
            return Ok(false);
        }
        if let Some(patch) = ack {
            // Acks are hints; a failed write must not drop the message.
            match self.store.update_fields(&id, &patch).await {
                Ok(()) => {
                    timeline.patch(&id, &patch);
                }
                Err(e) => warn!(message_id = %id, error = %e, "acknowledgement not stored"),
            }
        }
        Ok(true)
    }

    async fn decrypt_for_timeline(
        &self,
        record: &MessageRecord,
    ) -> Result<MessageBody, SessionError> {
        let identity: Arc<IdentityKeyPair> = match self.vault.identity().await {
            Ok(identity) => identity,
            Err(_) => {
                warn!(message_id = %record.id, "vault locked; message kept encrypted");
                return Ok(MessageBody::Locked);
            }
        };
        let record = record.clone();
        let own_id = self.local_user.clone();
        let body =
            tokio::task::spawn_blocking(move || decrypt_record(&record, &own_id, &identity)).await?;
        if body.needs_identity_repair() {
            warn!("received a packet this identity cannot open; identity repair suggested");
        }
        Ok(body)
    }

    /// Decrypt records that arrived while the vault was locked. Returns how
    /// many now have a body. Also run on every sweep tick.
    pub async fn retry_locked(&self) -> Result<usize, SessionError> {
        self.ensure_open()?;
        if self.vault.is_locked().await {
            return Ok(0);
        }
        let pending = self.timeline.lock().await.locked();
        let mut decrypted = 0;
        for record in pending {
            let body = self.decrypt_for_timeline(&record).await?;
            self.ensure_open()?;
            if body == MessageBody::Locked {
                break;
            }
            let mut timeline = self.timeline.lock().await;
            if timeline
                .get(&record.id)
                .is_some_and(|m| m.body == MessageBody::Locked)
            {
                timeline.set_body(&record.id, body);
                decrypted += 1;
            }
        }
        if decrypted > 0 {
            info!(count = decrypted, "messages decrypted after unlock");
        }
        Ok(decrypted)
    }

    /// Delivery and read receipts owed for a record we received.
    fn acknowledgement(&self, record: &MessageRecord, now: DateTime<Utc>) -> Option<RecordPatch> {
        if !record.is_addressed_to(&self.local_user) || record.is_from(&self.local_user) {
            return None;
        }
        let mut patch = RecordPatch::default();
        if !record.is_delivered {
            patch = patch.delivered(now);
        }
        if !record.is_view_once && !record.is_viewed {
            patch = patch.viewed(now);
        }
        (!patch.is_empty()).then_some(patch)
    }

    // ── Viewing and lifecycle ────────────────────────────────────────────────

    /// Reveal a message. View-once records count the receiver's opens; an
    /// exhausted or expired record fails and its cached plaintext is dropped.
    pub async fn open(&self, id: &str) -> Result<MessageBody, SessionError> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut timeline = self.timeline.lock().await;
        let (record, body) = match timeline.get(id) {
            Some(m) => (m.record.clone(), m.body.clone()),
            None => return Err(SessionError::UnknownMessage(id.to_string())),
        };
        match lifecycle::open(&record, &self.local_user, now) {
            Ok(patch) => {
                if !patch.is_empty() {
                    self.store.update_fields(id, &patch).await?;
                    timeline.patch(id, &patch);
                }
                Ok(body)
            }
            Err(e) => {
                timeline.set_body(id, MessageBody::Purged);
                Err(e.into())
            }
        }
    }

    /// Close a revealed message. A receiver closing an unsaved view-once
    /// record archives it.
    pub async fn close_message(&self, id: &str) -> Result<MessageRecord, SessionError> {
        self.ensure_open()?;
        let local_user = self.local_user.clone();
        self.mutate(id, |record| lifecycle::close(record, &local_user, Utc::now()))
            .await
    }

    /// Explicit save. Saved records are never purged.
    pub async fn save_to_vault(&self, id: &str) -> Result<MessageRecord, SessionError> {
        self.ensure_open()?;
        self.mutate(id, |record| {
            if record.is_saved {
                RecordPatch::default()
            } else {
                RecordPatch::default().saved()
            }
        })
        .await
    }

    /// Flip the local user's `emoji` reaction. Returns true if it is now set.
    /// The whole reaction map is written back (last writer wins).
    pub async fn toggle_reaction(&self, id: &str, emoji: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        let mut added = false;
        self.mutate(id, |record| {
            let mut reactions = record.reactions.clone();
            added = reactions.toggle(emoji, &self.local_user);
            RecordPatch::default().reactions(reactions)
        })
        .await?;
        Ok(added)
    }

    /// Compute a patch from the current record, store it, then apply it
    /// locally, all under the timeline lock.
    async fn mutate<F>(&self, id: &str, make_patch: F) -> Result<MessageRecord, SessionError>
    where
        F: FnOnce(&MessageRecord) -> RecordPatch,
    {
        let mut timeline = self.timeline.lock().await;
        let patch = match timeline.get(id) {
            Some(m) => make_patch(&m.record),
            None => return Err(SessionError::UnknownMessage(id.to_string())),
        };
        if !patch.is_empty() {
            self.store.update_fields(id, &patch).await?;
            timeline.patch(id, &patch);
        }
        timeline
            .get(id)
            .map(|m| m.record.clone())
            .ok_or_else(|| SessionError::UnknownMessage(id.to_string()))
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Drop every locally expired, unsaved record in one batch, then delete
    /// them from the store. The store re-checks expiry and `is_saved` per
    /// record, so a save this session has not heard of yet survives and
    /// comes back with its update event. Store failures are logged; the
    /// batch purge job picks up anything left behind.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionError> {
        self.ensure_open()?;
        let (expired, removed) = {
            let mut timeline = self.timeline.lock().await;
            let expired = lifecycle::select_expired(timeline.records(), now);
            if expired.is_empty() {
                return Ok(0);
            }
            let removed = timeline.expire_many(&expired);
            (expired, removed)
        };
        let count = expired.len();
        let filter = RecordFilter::ExpiredAmong { ids: expired, now };
        match self.store.delete_by_filter(&filter).await {
            Ok(deleted) => debug!(requested = count, deleted, "expired records deleted"),
            Err(e) => warn!(count, error = %e, "expired records not deleted from store"),
        }
        info!(count = removed, "expired messages purged");
        Ok(removed)
    }

    /// Delete the whole conversation for both participants.
    pub async fn clear_conversation(&self) -> Result<u64, SessionError> {
        self.ensure_open()?;
        let mut timeline = self.timeline.lock().await;
        let deleted = self
            .store
            .delete_by_filter(&RecordFilter::Conversation(self.conversation.clone()))
            .await?;
        timeline.clear();
        info!(peer = %self.peer, deleted, "conversation cleared");
        Ok(deleted)
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    /// Republish the local public key; the remedy for `SignalMismatch`.
    pub async fn repair_identity(&self) -> Result<String, SessionError> {
        self.identity.repair().await
    }

    pub async fn regenerate_identity(
        &self,
        consent: RegenerationConsent,
    ) -> Result<Arc<IdentityKeyPair>, SessionError> {
        self.identity.regenerate(consent).await
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Local view in `created_at` order.
    pub async fn messages(&self) -> Vec<LocalMessage> {
        self.timeline.lock().await.snapshot()
    }

    pub async fn message(&self, id: &str) -> Option<LocalMessage> {
        self.timeline.lock().await.get(id).cloned()
    }
}

/// Encrypt once, wrap the content key for every recipient, encode the packet.
fn seal_message(
    plaintext: &str,
    recipients: &[(&str, &PublicIdentityKey)],
) -> Result<String, SessionError> {
    let key = generate_symmetric_key()?;
    let sealed = encrypt_content(plaintext.as_bytes(), &key)?;
    let keys = recipients
        .iter()
        .map(|(id, public)| Ok((id.to_string(), wrap_key_for_recipient(&key, public)?)))
        .collect::<Result<BTreeMap<_, _>, CryptoError>>()?;
    Ok(packet::encode(&sealed.iv, &sealed.ciphertext, keys)?)
}

fn shutdown_requested(
    changed: Result<(), watch::error::RecvError>,
    rx: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *rx.borrow()
}

fn spawn_event_consumer(
    session: Weak<ConversationSession>,
    mut stream: EventStream,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = stream.next() => {
                    let Some(event) = event else {
                        debug!("realtime feed ended");
                        return;
                    };
                    let Some(session) = session.upgrade() else { return };
                    match session.apply_event(event).await {
                        Ok(()) => {}
                        Err(SessionError::Closed) => return,
                        Err(e) => warn!(error = %e, "realtime event not applied"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if shutdown_requested(changed, &shutdown_rx) {
                        debug!("realtime consumer stopped");
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_sweep_loop(
    session: Weak<ConversationSession>,
    interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown_rx.changed() => {
                    if shutdown_requested(changed, &shutdown_rx) {
                        debug!("sweep timer stopped");
                        return;
                    }
                }
            }
            let Some(session) = session.upgrade() else { return };
            match session.sweep_expired(Utc::now()).await {
                Ok(_) => {}
                Err(SessionError::Closed) => return,
                Err(e) => warn!(error = %e, "expiry sweep failed"),
            }
            match session.retry_locked().await {
                Ok(_) => {}
                Err(SessionError::Closed) => return,
                Err(e) => warn!(error = %e, "locked messages not decrypted"),
            }
        }
    })
}

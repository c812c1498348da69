//! SQLite-backed `MessageStore` and `Directory` via sqlx.
//!
//! Records are stored column-per-field with timestamps as epoch milliseconds;
//! reactions are a JSON column. The packet stays an opaque string: this store
//! never sees plaintext.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, info};
use vanish_proto::{Conversation, MediaType, MessageRecord, Reactions, RecordPatch};

use crate::error::StoreError;
use crate::traits::{Directory, MessageStore, RecordFilter};

/// SQLite caps bound parameters per statement.
const DELETE_CHUNK: usize = 500;

const SELECT_COLUMNS: &str = "SELECT id, sender_id, receiver_id, encrypted_content, content, \
     media_type, media_url, created_at, is_viewed, viewed_at, is_delivered, delivered_at, \
     is_view_once, view_count, is_saved, expires_at, reactions FROM messages";

/// Cheap to clone (the pool is reference counted).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run pending migrations.
    ///
    /// WAL mode is set on the connection, not in a migration: SQLite refuses
    /// to change `journal_mode` inside the transaction sqlx wraps migrations in.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!(path = %db_path.display(), "message store opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub encrypted_content: Option<String>,
    pub content: Option<String>,
    pub media_type: String,
    pub media_url: Option<String>,
    pub created_at: i64,
    pub is_viewed: bool,
    pub viewed_at: Option<i64>,
    pub is_delivered: bool,
    pub delivered_at: Option<i64>,
    pub is_view_once: bool,
    pub view_count: i64,
    pub is_saved: bool,
    pub expires_at: Option<i64>,
    /// JSON of `Reactions`
    pub reactions: String,
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::InvalidRow(format!("timestamp {ms} out of range")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

impl TryFrom<MessageRow> for MessageRecord {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let media_type: MediaType = row
            .media_type
            .parse()
            .map_err(|e| StoreError::InvalidRow(format!("{}: {e}", row.id)))?;
        let view_count = u32::try_from(row.view_count).map_err(|_| {
            StoreError::InvalidRow(format!("{}: view_count {}", row.id, row.view_count))
        })?;
        let reactions: Reactions = serde_json::from_str(&row.reactions)?;
        Ok(MessageRecord {
            created_at: from_millis(row.created_at)?,
            viewed_at: opt_from_millis(row.viewed_at)?,
            delivered_at: opt_from_millis(row.delivered_at)?,
            expires_at: opt_from_millis(row.expires_at)?,
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            encrypted_packet: row.encrypted_content,
            content: row.content,
            media_type,
            media_url: row.media_url,
            is_viewed: row.is_viewed,
            is_delivered: row.is_delivered,
            is_view_once: row.is_view_once,
            view_count,
            is_saved: row.is_saved,
            reactions,
        })
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &RecordFilter) {
    match filter {
        RecordFilter::Conversation(c) => {
            let (a, b) = c.participants();
            qb.push("((sender_id = ")
                .push_bind(a.to_string())
                .push(" AND receiver_id = ")
                .push_bind(b.to_string())
                .push(") OR (sender_id = ")
                .push_bind(b.to_string())
                .push(" AND receiver_id = ")
                .push_bind(a.to_string())
                .push("))");
        }
        RecordFilter::ViewedViewOnce => {
            qb.push("is_view_once = 1 AND is_viewed = 1 AND is_saved = 0");
        }
        RecordFilter::ExpiredBefore(cutoff) => {
            qb.push("expires_at IS NOT NULL AND expires_at < ")
                .push_bind(cutoff.timestamp_millis())
                .push(" AND is_saved = 0");
        }
        RecordFilter::ExpiredAmong { ids, now } => {
            qb.push("id IN (");
            {
                let mut list = qb.separated(", ");
                for id in ids {
                    list.push_bind(id.clone());
                }
            }
            qb.push(") AND expires_at IS NOT NULL AND expires_at <= ")
                .push_bind(now.timestamp_millis())
                .push(" AND is_saved = 0");
        }
    }
}

/// Split id-bearing filters so no statement exceeds the bind limit.
fn chunked(filter: &RecordFilter) -> Vec<RecordFilter> {
    match filter {
        RecordFilter::ExpiredAmong { ids, now } => {
            let ids: Vec<&String> = ids.iter().collect();
            ids.chunks(DELETE_CHUNK)
                .map(|chunk| RecordFilter::ExpiredAmong {
                    ids: chunk.iter().map(|id| id.to_string()).collect(),
                    now: *now,
                })
                .collect()
        }
        other => vec![other.clone()],
    }
}

// ── MessageStore ──────────────────────────────────────────────────────────────

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert(&self, record: &MessageRecord) -> Result<(), StoreError> {
        let reactions = serde_json::to_string(&record.reactions)?;
        sqlx::query(
            "INSERT INTO messages (id, sender_id, receiver_id, encrypted_content, content, \
             media_type, media_url, created_at, is_viewed, viewed_at, is_delivered, delivered_at, \
             is_view_once, view_count, is_saved, expires_at, reactions) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.sender_id)
        .bind(&record.receiver_id)
        .bind(&record.encrypted_packet)
        .bind(&record.content)
        .bind(record.media_type.as_str())
        .bind(&record.media_url)
        .bind(record.created_at.timestamp_millis())
        .bind(record.is_viewed)
        .bind(record.viewed_at.map(|t| t.timestamp_millis()))
        .bind(record.is_delivered)
        .bind(record.delivered_at.map(|t| t.timestamp_millis()))
        .bind(record.is_view_once)
        .bind(i64::from(record.view_count))
        .bind(record.is_saved)
        .bind(record.expires_at.map(|t| t.timestamp_millis()))
        .bind(reactions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_fields(&self, id: &str, patch: &RecordPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE messages SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(v) = patch.is_viewed {
                set.push("is_viewed = ").push_bind_unseparated(v);
            }
            if let Some(at) = patch.viewed_at {
                set.push("viewed_at = ").push_bind_unseparated(at.timestamp_millis());
            }
            if let Some(v) = patch.is_delivered {
                set.push("is_delivered = ").push_bind_unseparated(v);
            }
            if let Some(at) = patch.delivered_at {
                set.push("delivered_at = ").push_bind_unseparated(at.timestamp_millis());
            }
            if let Some(n) = patch.view_count {
                set.push("view_count = ").push_bind_unseparated(i64::from(n));
            }
            if let Some(v) = patch.is_saved {
                set.push("is_saved = ").push_bind_unseparated(v);
            }
            if let Some(r) = &patch.reactions {
                set.push("reactions = ")
                    .push_bind_unseparated(serde_json::to_string(r)?);
            }
        }
        qb.push(" WHERE id = ").push_bind(id.to_string());

        let done = qb.build().execute(&self.pool).await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_by_ids(&self, ids: &BTreeSet<String>) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<&String> = ids.iter().collect();
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM messages WHERE id IN (");
            {
                let mut list = qb.separated(", ");
                for id in chunk {
                    list.push_bind(id.to_string());
                }
            }
            qb.push(")");
            removed += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        debug!(requested = ids.len(), removed, "deleted records by id");
        Ok(removed)
    }

    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for part in chunked(filter) {
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM messages WHERE ");
            push_filter(&mut qb, &part);
            removed += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        debug!(removed, "deleted records by filter");
        Ok(removed)
    }

    async fn query(&self, conversation: &Conversation) -> Result<Vec<MessageRecord>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        qb.push(" WHERE ");
        push_filter(&mut qb, &RecordFilter::Conversation(conversation.clone()));
        qb.push(" ORDER BY created_at ASC, rowid ASC");
        let rows: Vec<MessageRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(MessageRecord::try_from).collect()
    }

    async fn query_ids(&self, filter: &RecordFilter) -> Result<BTreeSet<String>, StoreError> {
        let mut out = BTreeSet::new();
        for part in chunked(filter) {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT id FROM messages WHERE ");
            push_filter(&mut qb, &part);
            let rows: Vec<(String,)> = qb.build_query_as().fetch_all(&self.pool).await?;
            out.extend(rows.into_iter().map(|(id,)| id));
        }
        Ok(out)
    }
}

// ── Directory ─────────────────────────────────────────────────────────────────

#[async_trait]
impl Directory for SqliteStore {
    async fn get_public_key(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let key = sqlx::query_scalar::<_, String>(
            "SELECT public_key FROM public_keys WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    async fn publish_public_key(
        &self,
        user_id: &str,
        public_key_b64: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO public_keys (user_id, public_key, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET public_key = excluded.public_key, \
             updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(public_key_b64)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        info!(user_id, "public key published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vanish_proto::{LifecyclePolicy, MediaAttachment};

    async fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("vanish.db")).await.unwrap();
        (dir, store)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_714_564_800 + secs, 0).unwrap()
    }

    const EMPTY_PACKET: &str = r#"{"iv":"","content":"","keys":{}}"#;

    fn record(from: &str, to: &str, created: DateTime<Utc>) -> MessageRecord {
        let packet = EMPTY_PACKET.to_string();
        MessageRecord::outgoing(from, to, packet, None, LifecyclePolicy::None, created)
    }

    #[tokio::test]
    async fn records_survive_the_row_mapping() {
        let (_dir, store) = open_temp().await;
        let mut rec = MessageRecord::outgoing(
            "alice",
            "bob",
            "packet".into(),
            Some(MediaAttachment {
                media_type: MediaType::Snapshot,
                url: "https://media.example/1.jpg".into(),
            }),
            LifecyclePolicy::hours(3).unwrap(),
            at(0),
        );
        rec.reactions.toggle("🔥", "bob");
        store.insert(&rec).await.unwrap();

        let got = store.query(&Conversation::between("bob", "alice")).await.unwrap();
        assert_eq!(got, vec![rec]);
    }

    #[tokio::test]
    async fn update_applies_only_patched_columns() {
        let (_dir, store) = open_temp().await;
        let rec = record("alice", "bob", at(0));
        store.insert(&rec).await.unwrap();

        let mut reactions = Reactions::default();
        reactions.toggle("👍", "alice");
        let patch = RecordPatch::default()
            .view_count(1)
            .delivered(at(5))
            .reactions(reactions.clone());
        store.update_fields(&rec.id, &patch).await.unwrap();

        let got = &store.query(&Conversation::between("alice", "bob")).await.unwrap()[0];
        assert_eq!(got.view_count, 1);
        assert!(got.is_delivered);
        assert_eq!(got.delivered_at, Some(at(5)));
        assert_eq!(got.reactions, reactions);
        assert!(!got.is_viewed);
        assert!(!got.is_saved);
    }

    #[tokio::test]
    async fn update_of_missing_record_is_not_found() {
        let (_dir, store) = open_temp().await;
        let err = store
            .update_fields("nope", &RecordPatch::default().saved())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn query_is_ascending_and_scoped() {
        let (_dir, store) = open_temp().await;
        let late = record("alice", "bob", at(60));
        let early = record("bob", "alice", at(0));
        let elsewhere = record("alice", "carol", at(30));
        for r in [&late, &early, &elsewhere] {
            store.insert(r).await.unwrap();
        }
        let got = store.query(&Conversation::between("alice", "bob")).await.unwrap();
        let ids: Vec<_> = got.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn purge_filters_match_the_store_predicates() {
        let (_dir, store) = open_temp().await;
        let now = at(10_000);

        let mut viewed_once = record("alice", "bob", at(0));
        viewed_once.is_view_once = true;
        viewed_once.is_viewed = true;
        let mut kept_once = record("alice", "bob", at(1));
        kept_once.is_view_once = true;
        kept_once.is_viewed = true;
        kept_once.is_saved = true;
        let mut expired = record("alice", "bob", at(2));
        expired.expires_at = Some(now - Duration::seconds(1));
        let mut at_deadline = record("alice", "bob", at(3));
        at_deadline.expires_at = Some(now);
        let mut saved_expired = expired.clone();
        saved_expired.id = "saved-expired".into();
        saved_expired.is_saved = true;

        for r in [&viewed_once, &kept_once, &expired, &at_deadline, &saved_expired] {
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

        let ids = BTreeSet::from([viewed_once.id.clone(), expired.id.clone(), "ghost".to_string()]);
        assert_eq!(store.delete_by_ids(&ids).await.unwrap(), 2);
        assert_eq!(store.delete_by_ids(&ids).await.unwrap(), 0);
        assert_eq!(store.query(&Conversation::between("alice", "bob")).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn sweep_filter_rechecks_expiry_and_save_in_the_store() {
        let (_dir, store) = open_temp().await;
        let now = at(10_000);

        let mut expired = record("alice", "bob", at(0));
        expired.expires_at = Some(now);
        let mut saved_meanwhile = expired.clone();
        saved_meanwhile.id = "saved-meanwhile".into();
        saved_meanwhile.is_saved = true;
        let mut not_yet = expired.clone();
        not_yet.id = "not-yet".into();
        not_yet.expires_at = Some(now + Duration::seconds(1));
        for r in [&expired, &saved_meanwhile, &not_yet] {
            store.insert(r).await.unwrap();
        }

        let filter = RecordFilter::ExpiredAmong {
            ids: BTreeSet::from([
                expired.id.clone(),
                saved_meanwhile.id.clone(),
                not_yet.id.clone(),
            ]),
            now,
        };
        assert_eq!(
            store.query_ids(&filter).await.unwrap(),
            BTreeSet::from([expired.id.clone()])
        );
        assert_eq!(store.delete_by_filter(&filter).await.unwrap(), 1);
        let left = store.query(&Conversation::between("alice", "bob")).await.unwrap();
        let ids: BTreeSet<_> = left.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, BTreeSet::from(["saved-meanwhile".to_string(), "not-yet".to_string()]));
    }

    #[tokio::test]
    async fn large_sweeps_are_chunked() {
        let (_dir, store) = open_temp().await;
        let mut ids = BTreeSet::new();
        for i in 0..(DELETE_CHUNK as i64 + 20) {
            let mut r = record("alice", "bob", at(i));
            r.expires_at = Some(at(i));
            ids.insert(r.id.clone());
            store.insert(&r).await.unwrap();
        }
        let filter = RecordFilter::ExpiredAmong { ids: ids.clone(), now: at(100_000) };
        assert_eq!(store.delete_by_filter(&filter).await.unwrap(), ids.len() as u64);
    }

    #[tokio::test]
    async fn conversation_filter_clears_both_directions_only() {
        let (_dir, store) = open_temp().await;
        for r in [
            record("alice", "bob", at(0)),
            record("bob", "alice", at(1)),
            record("alice", "carol", at(2)),
        ] {
            store.insert(&r).await.unwrap();
        }
        let removed = store
            .delete_by_filter(&RecordFilter::Conversation(Conversation::between("alice", "bob")))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.query(&Conversation::between("alice", "carol")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn large_id_sets_are_chunked() {
        let (_dir, store) = open_temp().await;
        let mut ids = BTreeSet::new();
        for i in 0..(DELETE_CHUNK as i64 + 20) {
            let r = record("alice", "bob", at(i));
            ids.insert(r.id.clone());
            store.insert(&r).await.unwrap();
        }
        assert_eq!(store.delete_by_ids(&ids).await.unwrap(), ids.len() as u64);
    }

    #[tokio::test]
    async fn directory_upserts() {
        let (_dir, store) = open_temp().await;
        assert_eq!(store.get_public_key("alice").await.unwrap(), None);
        store.publish_public_key("alice", "b2xk").await.unwrap();
        store.publish_public_key("alice", "bmV3").await.unwrap();
        assert_eq!(store.get_public_key("alice").await.unwrap().as_deref(), Some("bmV3"));
    }
}

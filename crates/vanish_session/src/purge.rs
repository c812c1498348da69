//! Store-wide purge maintenance job.
//!
//! Runs over the whole store, not just loaded conversations, with the two
//! purge predicates:
//!   (view-once AND viewed AND NOT saved) OR (expires_at < now AND NOT saved)
//! Candidate ids are collected per predicate, de-duplicated, then deleted in
//! one call. Deleting an id a client already purged is harmless, so the job
//! is idempotent and safe to run alongside client sweeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vanish_store::{MessageStore, RecordFilter};

use crate::error::SessionError;

#[derive(Clone)]
pub struct PurgeJob {
    store: Arc<dyn MessageStore>,
}

impl PurgeJob {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// One purge pass. Returns the number of records deleted.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<u64, SessionError> {
        let mut ids = self.store.query_ids(&RecordFilter::ViewedViewOnce).await?;
        ids.extend(self.store.query_ids(&RecordFilter::ExpiredBefore(now)).await?);

        if ids.is_empty() {
            debug!("purge: nothing to delete");
            return Ok(0);
        }
        let removed = self.store.delete_by_ids(&ids).await?;
        info!(candidates = ids.len(), removed, "purge complete");
        Ok(removed)
    }
}

/// Handle for a running purge loop. Send `true` to stop it.
pub struct PurgeLoopHandle {
    pub shutdown_tx: watch::Sender<bool>,
}

/// Run `job` every `interval` until shut down. Failures are logged and the
/// loop keeps going. `on_pass` receives each pass's deleted count.
pub fn spawn_purge_loop<F>(
    job: PurgeJob,
    interval: Duration,
    on_pass: F,
) -> (JoinHandle<()>, PurgeLoopHandle)
where
    F: Fn(u64) + Send + Sync + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "purge loop started");
        loop {
            match job.run(Utc::now()).await {
                Ok(count) => on_pass(count),
                Err(e) => warn!(error = %e, "purge pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("purge loop shutting down");
                        return;
                    }
                }
            }
        }
    });

    (handle, PurgeLoopHandle { shutdown_tx })
}

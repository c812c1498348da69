//! View-once / expiry / save state machine.
//!
//! States as seen by the receiving participant:
//!
//! ```text
//!   view-once:  Hidden --open--> Revealed --open--> (exhausted) Purged
//!                  |                 |
//!                  +-----close / save-----> Saved (terminal, never purged)
//!   expiring:   Active --expires_at <= now--> Purged
//!   plain:      Active
//! ```
//!
//! Every transition is a pure function returning a [`RecordPatch`]; the caller
//! applies it locally and forwards it to the store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::{MessageRecord, RecordPatch};

/// Receiver opens allowed on an unsaved view-once record.
pub const MAX_VIEWS: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Content no longer available")]
    ContentPurged,
}

/// Unsaved view-once record whose views are used up.
pub fn is_exhausted(record: &MessageRecord) -> bool {
    record.is_view_once && !record.is_saved && record.view_count >= MAX_VIEWS
}

/// Client-side expiry check (`expires_at <= now`).
pub fn is_expired(record: &MessageRecord, now: DateTime<Utc>) -> bool {
    !record.is_saved && record.expires_at.is_some_and(|at| at <= now)
}

/// Batch purge predicate: unsaved view-once record marked viewed.
pub fn is_viewed_view_once(record: &MessageRecord) -> bool {
    record.is_view_once && record.is_viewed && !record.is_saved
}

/// Batch purge predicate: unsaved record whose deadline is strictly before
/// `cutoff`. Strict, unlike the client-side [`is_expired`].
pub fn is_expired_before(record: &MessageRecord, cutoff: DateTime<Utc>) -> bool {
    !record.is_saved && record.expires_at.is_some_and(|at| at < cutoff)
}

/// Open a record for display.
///
/// Fails with [`LifecycleError::ContentPurged`] for exhausted or expired
/// records, whoever the viewer is. Only the receiver's opens count toward
/// [`MAX_VIEWS`]; the open that reaches the limit also marks the record viewed.
pub fn open(
    record: &MessageRecord,
    viewer_id: &str,
    now: DateTime<Utc>,
) -> Result<RecordPatch, LifecycleError> {
    if is_exhausted(record) || is_expired(record, now) {
        return Err(LifecycleError::ContentPurged);
    }
    let mut patch = RecordPatch::default();
    if record.is_view_once && record.is_addressed_to(viewer_id) && record.view_count < MAX_VIEWS {
        let views = record.view_count + 1;
        patch = patch.view_count(views);
        if views >= MAX_VIEWS {
            patch = patch.viewed(now);
        }
    }
    Ok(patch)
}

/// Close a record after viewing. A receiver closing an unsaved view-once
/// record archives it: `is_saved` and `is_viewed` are both set.
pub fn close(record: &MessageRecord, viewer_id: &str, now: DateTime<Utc>) -> RecordPatch {
    if record.is_view_once && record.is_addressed_to(viewer_id) && !record.is_saved {
        RecordPatch::default().saved().viewed(now)
    } else {
        RecordPatch::default()
    }
}

/// Ids of every record in `records` that has expired client-side.
pub fn select_expired<'a>(
    records: impl IntoIterator<Item = &'a MessageRecord>,
    now: DateTime<Utc>,
) -> BTreeSet<String> {
    records
        .into_iter()
        .filter(|r| is_expired(r, now))
        .map(|r| r.id.clone())
        .collect()
}

/// Merge a record delivered by the feed into the one held locally.
///
/// Events can arrive out of order, so lifecycle flags only move forward:
/// `view_count` takes the maximum, `is_saved`, `is_viewed` and
/// `is_delivered` stay set once set, and a set flag keeps its timestamp.
/// Everything else (reactions included) comes from `incoming`.
pub fn reconcile(current: &MessageRecord, mut incoming: MessageRecord) -> MessageRecord {
    incoming.view_count = incoming.view_count.max(current.view_count);
    incoming.is_saved |= current.is_saved;
    if current.is_viewed {
        incoming.is_viewed = true;
        incoming.viewed_at = current.viewed_at.or(incoming.viewed_at);
    }
    if current.is_delivered {
        incoming.is_delivered = true;
        incoming.delivered_at = current.delivered_at.or(incoming.delivered_at);
    }
    incoming
}

/// Countdown text shown next to an expiring message.
pub fn remaining_label(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = expires_at - now;
    if remaining.num_milliseconds() <= 0 {
        return "Expiring...".to_string();
    }
    let mins = remaining.num_minutes();
    if mins < 60 {
        format!("{mins}m left")
    } else {
        format!("{}h {}m left", mins / 60, mins % 60)
    }
}

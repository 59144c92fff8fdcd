//! Reverse queue: durable outbound intent with coalescing, retry, and
//! quarantine.
//!
//! Items enter through capture, leave through ack reconciliation, and
//! are compacted per-bookmark (last write wins) only at flush time so a
//! failed transmit still retries the predecessors it would have
//! subsumed.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};

use super::dedupe::{self, OUTBOUND_CLIENT};
use super::state::{BridgeState, QueueItem, ReverseEvent};
use super::timeline::DebugTimeline;

/// Debounce between a capture and the deferred flush it schedules.
pub const FLUSH_DEBOUNCE_MS: u64 = 2_000;

/// Period of the standing flush alarm that guarantees progress.
pub const FLUSH_ALARM_MS: u64 = 3_000;

/// Transport failures after which an item is quarantined.
pub const QUARANTINE_RETRIES: u32 = 3;

/// Append a captured event unless its id was already enqueued recently.
///
/// Returns `true` when the event was appended.
pub fn enqueue(
    state: &mut BridgeState,
    timeline: &mut DebugTimeline,
    event: ReverseEvent,
    now: DateTime<Utc>,
) -> bool {
    if !dedupe::record_and_check(
        &mut state.dedupe,
        OUTBOUND_CLIENT,
        &event.event_id,
        now.timestamp_millis(),
    ) {
        log::debug!("duplicate outbound event {} dropped", event.event_id);
        timeline.record(
            "debug",
            "capture_skip",
            format!("duplicate eventId {}", event.event_id),
            now,
        );
        return false;
    }
    state.reverse_queue.push(QueueItem {
        event,
        retry_count: 0,
        enqueued_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
    });
    true
}

/// Per-bookmark last-write-wins compaction, order preserving.
///
/// Items with an empty `bookmarkId` always survive; for each non-empty
/// `bookmarkId` only the last occurrence does.
pub fn coalesce(items: &[QueueItem]) -> Vec<QueueItem> {
    let mut last_index: HashMap<&str, usize> = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        if !item.event.bookmark_id.is_empty() {
            last_index.insert(item.event.bookmark_id.as_str(), i);
        }
    }
    items
        .iter()
        .enumerate()
        .filter(|(i, item)| {
            item.event.bookmark_id.is_empty()
                || last_index.get(item.event.bookmark_id.as_str()) == Some(i)
        })
        .map(|(_, item)| item.clone())
        .collect()
}

/// Apply a transport failure to every queue item in the failed set.
///
/// Retry counts reaching the quarantine threshold drop the item with a
/// `quarantine` timeline record; everything else is retained.
pub fn mark_failures(
    state: &mut BridgeState,
    timeline: &mut DebugTimeline,
    failed: &[QueueItem],
    reason: &str,
    now: DateTime<Utc>,
) {
    let failed_ids: HashSet<&str> = failed
        .iter()
        .map(|item| item.event.event_id.as_str())
        .collect();
    let mut kept = Vec::with_capacity(state.reverse_queue.len());
    for mut item in state.reverse_queue.drain(..) {
        if !failed_ids.contains(item.event.event_id.as_str()) {
            kept.push(item);
            continue;
        }
        item.retry_count += 1;
        if item.retry_count >= QUARANTINE_RETRIES {
            log::warn!(
                "quarantining event {} after {} failures: {}",
                item.event.event_id,
                item.retry_count,
                reason
            );
            timeline.record(
                "warn",
                "quarantine",
                format!(
                    "eventId={} bookmarkId={} retryCount={} reason={}",
                    item.event.event_id, item.event.bookmark_id, item.retry_count, reason
                ),
                now,
            );
        } else {
            kept.push(item);
        }
    }
    state.reverse_queue = kept;
}

/// Remove predecessors subsumed by a successfully-transmitted coalesced
/// set, so coalesced-away duplicates cannot reappear on retry.
///
/// Only items that existed when the flush snapshot was taken
/// (`snapshot_ids`) are candidates; events captured mid-flight survive.
pub fn sweep_superseded(
    state: &mut BridgeState,
    coalesced: &[QueueItem],
    snapshot_ids: &HashSet<String>,
) {
    let coalesced_ids: HashSet<&str> = coalesced
        .iter()
        .map(|item| item.event.event_id.as_str())
        .collect();
    let coalesced_bookmarks: HashSet<&str> = coalesced
        .iter()
        .filter(|item| !item.event.bookmark_id.is_empty())
        .map(|item| item.event.bookmark_id.as_str())
        .collect();
    state.reverse_queue.retain(|item| {
        let superseded = snapshot_ids.contains(&item.event.event_id)
            && !coalesced_ids.contains(item.event.event_id.as_str())
            && coalesced_bookmarks.contains(item.event.bookmark_id.as_str());
        !superseded
    });
}

/// Ids of every item currently in the queue (flush snapshot helper).
pub fn queue_event_ids(state: &BridgeState) -> HashSet<String> {
    state
        .reverse_queue
        .iter()
        .map(|item| item.event.event_id.clone())
        .collect()
}

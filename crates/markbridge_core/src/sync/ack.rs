//! Ack reconciliation: apply per-event bridge results to the reverse
//! queue and the managed-node index.
//!
//! Results arrive either as the legacy HTTP batch response or as single
//! WebSocket `ack` envelopes bridged into a one-result batch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node_index;
use super::state::{BridgeState, QueueItem};
use super::timeline::DebugTimeline;

/// One per-event result in a batch ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAckResult {
    /// Event id being acknowledged.
    pub event_id: String,
    /// Result in the legacy vocabulary.
    pub status: String,
    /// Failure or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Bridge-assigned stable key for the event's bookmark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_key: Option<String>,
    /// Bridge-side resolved path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
}

/// A batch of ack results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAckResponse {
    /// Batch being acknowledged.
    pub batch_id: String,
    /// Per-event results.
    pub results: Vec<BatchAckResult>,
}

/// Apply a batch of results to the queue and the key map.
///
/// Terminal statuses remove the event from the queue; `applied` with a
/// `resolvedKey` additionally records the bookmark mapping. Unknown
/// statuses retain the item for a later retry.
pub fn reconcile(
    state: &mut BridgeState,
    timeline: &mut DebugTimeline,
    ack: &BatchAckResponse,
    now: DateTime<Utc>,
) {
    // Snapshot before any mutation so resolvedKey attribution survives
    // queue edits mid-loop.
    let by_event_id: HashMap<String, QueueItem> = state
        .reverse_queue
        .iter()
        .map(|item| (item.event.event_id.clone(), item.clone()))
        .collect();

    for result in &ack.results {
        match result.status.as_str() {
            "applied" => {
                if let Some(key) = result.resolved_key.as_deref().filter(|k| !k.is_empty()) {
                    if let Some(item) = by_event_id.get(&result.event_id) {
                        if !item.event.bookmark_id.is_empty() {
                            node_index::record_mapping(state, &item.event.bookmark_id, key);
                        }
                    }
                }
                remove_event(state, &result.event_id);
            }
            "duplicate" | "skipped_ambiguous" | "skipped_unmanaged" | "rejected_invalid" => {
                remove_event(state, &result.event_id);
            }
            other => {
                log::warn!(
                    "ack for {} carried unknown status {:?}; keeping item",
                    result.event_id,
                    other
                );
                timeline.record(
                    "warn",
                    "ack_unknown_status",
                    format!("eventId={} reason=unknown_status status={}", result.event_id, other),
                    now,
                );
            }
        }
    }
}

fn remove_event(state: &mut BridgeState, event_id: &str) {
    state
        .reverse_queue
        .retain(|item| item.event.event_id != event_id);
}

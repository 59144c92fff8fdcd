//! Durable state model: the managed-node index, the reverse queue, the
//! dedupe ledger, the suppression window, and the session summary, plus
//! the store that loads/migrates/persists them.
//!
//! All mutation happens in memory through the component modules; this
//! module only owns record shapes and bytes. Migration is lenient by
//! contract: any input shape yields a fully-defaulted record, recognized
//! fields are preserved, and queue items are never silently dropped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::dedupe::DedupeMap;
use super::suppression::SuppressionState;
use super::timeline::DebugTimeline;
use crate::error::Result;
use crate::storage::KeyValueStore;

/// Storage key for the managed bridge state.
pub const STATE_KEY: &str = "markbridge.state";
/// Storage key for the bridge configuration.
pub const CONFIG_KEY: &str = "markbridge.config";
/// Storage key for the debug timeline.
pub const TIMELINE_KEY: &str = "markbridge.timeline";
/// Storage key for the WebSocket session summary.
pub const SESSION_KEY: &str = "markbridge.session";

/// Reserved managed-folder key for the gateway root.
pub const ROOT_FOLDER_KEY: &str = "__root__";

/// Schema version stamped on every reverse event.
pub const REVERSE_SCHEMA_VERSION: &str = "1";

/// Kind of a captured local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReverseEventKind {
    /// A bookmark link was created.
    BookmarkCreated,
    /// A bookmark link changed (title, url, or position).
    BookmarkUpdated,
    /// A bookmark link was removed.
    BookmarkDeleted,
    /// A managed folder was renamed.
    FolderRenamed,
}

impl ReverseEventKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReverseEventKind::BookmarkCreated => "bookmark_created",
            ReverseEventKind::BookmarkUpdated => "bookmark_updated",
            ReverseEventKind::BookmarkDeleted => "bookmark_deleted",
            ReverseEventKind::FolderRenamed => "folder_renamed",
        }
    }
}

/// One captured local mutation, queued for delivery to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseEvent {
    /// Event schema version (`"1"`).
    pub schema_version: String,
    /// Batch this event was minted under; doubles as the idempotency key
    /// on the WebSocket path.
    pub batch_id: String,
    /// Unique event id.
    pub event_id: String,
    /// What happened.
    #[serde(rename = "type")]
    pub kind: ReverseEventKind,
    /// Local node id the event concerns.
    pub bookmark_id: String,
    /// Bridge-visible key; finalized before enqueue.
    pub managed_key: String,
    /// Title after the mutation, when relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Url after the mutation, when relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Parent folder id, when relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Link-only position within the parent for same-parent moves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_index: Option<u32>,
    /// When the mutation was observed (ISO-8601).
    pub occurred_at: String,
}

/// A reverse-queue slot: the event plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// The captured event.
    pub event: ReverseEvent,
    /// Transport failures so far.
    pub retry_count: u32,
    /// When the item entered the queue (ISO-8601).
    pub enqueued_at: String,
}

/// The single durable state record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeState {
    /// Managed folder key -> local folder id.
    pub folders: HashMap<String, String>,
    /// Managed bookmark key -> local bookmark id.
    pub bookmarks: HashMap<String, String>,
    /// Local id -> managed key (inverse map; rebuilt on full apply).
    pub id_to_key: HashMap<String, String>,
    /// Outbound reverse queue.
    pub reverse_queue: Vec<QueueItem>,
    /// Idempotency ledger, bucketed per logical client id.
    pub dedupe: DedupeMap,
    /// Echo-suppression window.
    pub suppression: SuppressionState,
    /// Whether a bulk bookmark import is in progress.
    pub import_in_progress: bool,
}

/// Connection lifecycle phase, persisted for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No socket.
    Disconnected,
    /// First connect in flight.
    Connecting,
    /// Socket open and handshaken.
    Connected,
    /// Connect in flight after at least one failure.
    Reconnecting,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Disconnected
    }
}

/// Persisted WebSocket session summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSummary {
    /// Lifecycle phase.
    pub status: SessionStatus,
    /// Client id of the active profile.
    pub active_client_id: String,
    /// Sanitized WebSocket URL (scheme + host only).
    pub ws_url: String,
    /// Consecutive reconnect attempts since the last successful open.
    pub reconnect_attempt: u32,
    /// Negotiated heartbeat interval, clamped to 1000..=120000 ms.
    pub heartbeat_ms: u64,
    /// Last successful open (ISO-8601).
    pub last_connected_at: Option<String>,
    /// Last failure, as `<reason>:<detail>`.
    pub last_error: Option<String>,
    /// Depth of the in-process inbound queue.
    pub queued_inbound: usize,
    /// Depth of the in-process outbound queue.
    pub queued_outbound: usize,
}

impl Default for SessionSummary {
    fn default() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            active_client_id: String::new(),
            ws_url: String::new(),
            reconnect_attempt: 0,
            heartbeat_ms: 25_000,
            last_connected_at: None,
            last_error: None,
            queued_inbound: 0,
            queued_outbound: 0,
        }
    }
}

// ==================== Migration ====================

/// Build a `BridgeState` from whatever was read from storage.
///
/// `None`, scalars, and arrays all yield the defaulted record. Objects
/// keep every recognized field, with per-field fallbacks; legacy string
/// `cooldownUntil` values are coerced to epoch-ms.
pub fn migrate(raw: Option<&Value>) -> BridgeState {
    let obj = match raw {
        Some(Value::Object(map)) => map,
        _ => return BridgeState::default(),
    };

    let mut state = BridgeState {
        folders: string_map(obj.get("folders")),
        bookmarks: string_map(obj.get("bookmarks")),
        id_to_key: string_map(obj.get("idToKey")),
        reverse_queue: Vec::new(),
        dedupe: dedupe_map(obj.get("dedupe")),
        suppression: suppression(obj.get("suppression")),
        import_in_progress: obj
            .get("importInProgress")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    };

    if let Some(Value::Array(items)) = obj.get("reverseQueue") {
        for item in items {
            match queue_item(item) {
                Some(item) => state.reverse_queue.push(item),
                None => log::warn!("dropping unreadable reverse-queue entry: {}", item),
            }
        }
    }

    state
}

fn string_map(value: Option<&Value>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(Value::Object(map)) = value {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}

fn dedupe_map(value: Option<&Value>) -> DedupeMap {
    let mut out = DedupeMap::new();
    if let Some(Value::Object(buckets)) = value {
        for (client, bucket) in buckets {
            if let Value::Object(entries) = bucket {
                let parsed = entries
                    .iter()
                    .filter_map(|(key, at)| epoch_ms(at).map(|ms| (key.clone(), ms)))
                    .collect::<HashMap<_, _>>();
                if !parsed.is_empty() {
                    out.insert(client.clone(), parsed);
                }
            }
        }
    }
    out
}

fn suppression(value: Option<&Value>) -> SuppressionState {
    let obj = match value {
        Some(Value::Object(map)) => map,
        _ => return SuppressionState::default(),
    };
    SuppressionState {
        apply_epoch: obj
            .get("applyEpoch")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        epoch_started_at: obj
            .get("epochStartedAt")
            .and_then(Value::as_str)
            .map(str::to_string),
        cooldown_until: obj.get("cooldownUntil").and_then(epoch_ms),
    }
}

/// Accept an epoch-ms number, a numeric string, or an ISO-8601 string.
fn epoch_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|t| t.timestamp_millis())),
        _ => None,
    }
}

fn queue_item(value: &Value) -> Option<QueueItem> {
    let obj = value.as_object()?;
    let event = obj.get("event")?;
    let event: ReverseEvent = serde_json::from_value(event.clone()).ok()?;
    let enqueued_at = obj
        .get("enqueuedAt")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| event.occurred_at.clone());
    Some(QueueItem {
        event,
        retry_count: obj
            .get("retryCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        enqueued_at,
    })
}

// ==================== State store ====================

/// Loads, migrates, and persists the four durable records.
#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KeyValueStore>,
}

impl StateStore {
    /// Wrap a key/value capability.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Load and migrate the managed state.
    pub async fn load_state(&self) -> Result<BridgeState> {
        let raw = self.kv.get(STATE_KEY).await?;
        Ok(migrate(raw.as_ref()))
    }

    /// Persist the whole managed state record.
    pub async fn save_state(&self, state: &BridgeState) -> Result<()> {
        let value = serde_json::to_value(state).expect("state serializes");
        self.kv.set(STATE_KEY, value).await?;
        Ok(())
    }

    /// Load the bridge settings, defaulted when absent or unreadable.
    pub async fn load_settings(&self) -> Result<super::config::BridgeSettings> {
        let raw = self.kv.get(CONFIG_KEY).await?;
        Ok(raw
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    /// Persist the bridge settings.
    pub async fn save_settings(&self, settings: &super::config::BridgeSettings) -> Result<()> {
        let value = serde_json::to_value(settings).expect("settings serialize");
        self.kv.set(CONFIG_KEY, value).await?;
        Ok(())
    }

    /// Load the debug timeline, empty when absent or unreadable.
    pub async fn load_timeline(&self) -> Result<DebugTimeline> {
        let raw = self.kv.get(TIMELINE_KEY).await?;
        Ok(raw
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    /// Persist the debug timeline.
    pub async fn save_timeline(&self, timeline: &DebugTimeline) -> Result<()> {
        let value = serde_json::to_value(timeline).expect("timeline serializes");
        self.kv.set(TIMELINE_KEY, value).await?;
        Ok(())
    }

    /// Load the session summary, defaulted when absent or unreadable.
    pub async fn load_session(&self) -> Result<SessionSummary> {
        let raw = self.kv.get(SESSION_KEY).await?;
        Ok(raw
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    /// Persist the session summary.
    pub async fn save_session(&self, session: &SessionSummary) -> Result<()> {
        let value = serde_json::to_value(session).expect("session serializes");
        self.kv.set(SESSION_KEY, value).await?;
        Ok(())
    }
}

//! The sync engine: single owner of the durable records.
//!
//! Every mutation follows the load-modify-save discipline: the engine
//! holds the records in memory behind one async mutex, mutates through
//! the component modules, and persists what changed before releasing
//! control. Capability handles (bookmark store, key/value store) live
//! outside the lock.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::Notify;

use crate::bookmarks::{BookmarkEvent, BookmarkStore};
use crate::error::Result;
use crate::storage::KeyValueStore;

use super::ack::{self, BatchAckResponse};
use super::apply::{self, ApplyOutcome};
use super::capture::{self, CaptureOutcome};
use super::config::{sanitize_url, BridgeSettings};
use super::dedupe;
use super::envelope::{clamp_heartbeat, Envelope, EnvelopeBody, EnvelopeMeta};
use super::reverse_queue::{self, coalesce};
use super::state::{
    BridgeState, QueueItem, ReverseEvent, SessionStatus, SessionSummary, StateStore,
};
use super::suppression::COOLDOWN_MS;
use super::timeline::{DebugTimeline, TimelineEntry};
use super::transport::Transport;

/// Session-summary lifecycle updates applied by the connection loop.
#[derive(Debug, Clone, Copy)]
pub enum SessionStatusUpdate<'a> {
    /// A connect attempt is starting.
    Connecting {
        /// Active profile's client id.
        client_id: &'a str,
        /// WebSocket URL (sanitized before persisting).
        ws_url: &'a str,
    },
    /// The socket opened and the handshake went out.
    Connected,
    /// The socket died or could not be opened.
    Disconnected {
        /// Status reason (e.g. `close_1006`, `constructor_error`).
        reason: &'a str,
        /// Free-form detail.
        detail: &'a str,
    },
    /// The resolved profile is disabled.
    ProfileDisabled,
    /// The bridge negotiated a heartbeat interval.
    Heartbeat(u64),
}

/// Result of one reverse-flush round.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing queued.
    Empty,
    /// Another flush was already in flight.
    SkippedBusy,
    /// Every coalesced item was transmitted.
    Sent(usize),
    /// The transmit round failed; retries were recorded.
    Failed(String),
}

struct EngineInner {
    state: BridgeState,
    timeline: DebugTimeline,
    session: SessionSummary,
    settings: BridgeSettings,
    in_flight: bool,
}

/// Owns durable state and offers the component operations over it.
pub struct SyncEngine {
    store: StateStore,
    bookmarks: Arc<dyn BookmarkStore>,
    inner: tokio::sync::Mutex<EngineInner>,
    sync_signal: Notify,
    flush_signal: Notify,
}

impl SyncEngine {
    /// Load every durable record (migrating as needed) and build the
    /// engine.
    pub async fn load(
        kv: Arc<dyn KeyValueStore>,
        bookmarks: Arc<dyn BookmarkStore>,
    ) -> Result<Arc<Self>> {
        let store = StateStore::new(kv);
        let state = store.load_state().await?;
        let timeline = store.load_timeline().await?;
        let mut settings = store.load_settings().await?;
        settings.normalize();
        let mut session = store.load_session().await?;
        // In-process queues died with the previous process.
        session.status = SessionStatus::Disconnected;
        session.queued_inbound = 0;
        session.queued_outbound = 0;
        Ok(Arc::new(Self {
            store,
            bookmarks,
            inner: tokio::sync::Mutex::new(EngineInner {
                state,
                timeline,
                session,
                settings,
                in_flight: false,
            }),
            sync_signal: Notify::new(),
            flush_signal: Notify::new(),
        }))
    }

    /// The bookmark store capability.
    pub fn bookmarks(&self) -> Arc<dyn BookmarkStore> {
        Arc::clone(&self.bookmarks)
    }

    // ==================== Ops surface ====================

    /// Current bridge settings.
    pub async fn settings(&self) -> BridgeSettings {
        self.inner.lock().await.settings.clone()
    }

    /// Replace the bridge settings (normalized) and persist them.
    pub async fn update_settings(&self, mut settings: BridgeSettings) -> Result<BridgeSettings> {
        settings.normalize();
        let mut inner = self.inner.lock().await;
        inner.settings = settings.clone();
        self.store.save_settings(&inner.settings).await?;
        // A profile change should be picked up promptly.
        self.sync_signal.notify_one();
        Ok(settings)
    }

    /// Current session summary.
    pub async fn session_summary(&self) -> SessionSummary {
        self.inner.lock().await.session.clone()
    }

    /// Depth of the durable reverse queue.
    pub async fn reverse_queue_len(&self) -> usize {
        self.inner.lock().await.state.reverse_queue.len()
    }

    /// Snapshot of the debug timeline.
    pub async fn timeline_entries(&self) -> Vec<TimelineEntry> {
        self.inner
            .lock()
            .await
            .timeline
            .entries()
            .cloned()
            .collect()
    }

    /// Drop every timeline entry.
    pub async fn clear_timeline(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.timeline.clear();
        self.store.save_timeline(&inner.timeline).await?;
        Ok(())
    }

    /// Record a timeline entry from outside the components.
    pub async fn record_timeline(&self, level: &str, event: &str, summary: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.timeline.record(level, event, summary, Utc::now());
        self.store.save_timeline(&inner.timeline).await?;
        Ok(())
    }

    /// Ask the connection loop to ensure a connection now.
    pub fn request_sync(&self) {
        self.sync_signal.notify_one();
    }

    /// Await the next manual sync request.
    pub async fn sync_requested(&self) {
        self.sync_signal.notified().await;
    }

    /// Await the next capture-driven flush request.
    pub async fn flush_requested(&self) {
        self.flush_signal.notified().await;
    }

    // ==================== Capture (J) ====================

    /// Route one observed bookmark event through the capture gates and
    /// persist the result.
    pub async fn on_bookmark_event(&self, event: &BookmarkEvent) -> Result<CaptureOutcome> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let EngineInner {
            state, timeline, ..
        } = &mut *inner;
        let outcome =
            capture::handle_event(state, timeline, self.bookmarks.as_ref(), event, now).await;
        self.store.save_state(&inner.state).await?;
        self.store.save_timeline(&inner.timeline).await?;
        if outcome == CaptureOutcome::Enqueued {
            self.flush_signal.notify_one();
        }
        Ok(outcome)
    }

    // ==================== Inbound (D, E, H) ====================

    /// Dedupe, apply, and ack-classify one inbound `action` envelope.
    ///
    /// Returns `None` when the envelope was a duplicate (dropped) or not
    /// an action at all; otherwise the outcome for ack construction. The
    /// apply epoch is held open around the store mutations and the
    /// cooldown tail is armed on the way out, success or failure.
    pub async fn handle_inbound_action(&self, env: &Envelope) -> Result<Option<ApplyOutcome>> {
        let (op, target, payload) = match &env.body {
            EnvelopeBody::Action { op, target, payload } => {
                (op.clone(), target.clone(), payload.clone())
            }
            _ => return Ok(None),
        };
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let dedupe_key = env
            .meta
            .idempotency_key
            .clone()
            .unwrap_or_else(|| env.meta.event_id.clone());
        if !dedupe::record_and_check(
            &mut inner.state.dedupe,
            &env.meta.client_id,
            &dedupe_key,
            now.timestamp_millis(),
        ) {
            log::debug!(
                "duplicate inbound action from {} dropped",
                env.meta.client_id
            );
            inner.timeline.record(
                "debug",
                "ws_action_skip",
                format!("duplicate idempotencyKey from {}", env.meta.client_id),
                now,
            );
            self.store.save_state(&inner.state).await?;
            self.store.save_timeline(&inner.timeline).await?;
            return Ok(None);
        }

        inner.state.suppression.set_apply_epoch(true, now);
        self.store.save_state(&inner.state).await?;

        let EngineInner {
            state, timeline, ..
        } = &mut *inner;
        let outcome =
            apply::apply_action(state, self.bookmarks.as_ref(), &op, &target, &payload).await;

        let done = Utc::now();
        inner.state.suppression.set_apply_epoch(false, done);
        inner
            .state
            .suppression
            .set_cooldown(COOLDOWN_MS, done.timestamp_millis());
        let level = match outcome.status {
            super::envelope::LegacyAckStatus::Applied => "info",
            _ => "warn",
        };
        inner.timeline.record(
            level,
            "ws_action",
            format!("op={} status={}", op, outcome.status.as_str()),
            done,
        );
        self.store.save_state(&inner.state).await?;
        self.store.save_timeline(&inner.timeline).await?;
        Ok(Some(outcome))
    }

    // ==================== Acks (G) ====================

    /// Apply a batch of ack results and persist.
    pub async fn reconcile_acks(&self, batch: &BatchAckResponse) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let EngineInner {
            state, timeline, ..
        } = &mut *inner;
        ack::reconcile(state, timeline, batch, now);
        self.store.save_state(&inner.state).await?;
        self.store.save_timeline(&inner.timeline).await?;
        Ok(())
    }

    // ==================== Reverse flush (F, I) ====================

    /// Transmit the coalesced reverse queue as `action` envelopes.
    ///
    /// The queue itself drains only through acks; a fully-successful
    /// round additionally sweeps the coalesced-away predecessors so they
    /// cannot reappear on a later retry. A failed round records a retry
    /// against every coalesced item (quarantining at the threshold).
    pub async fn flush_reverse<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        client_id: &str,
    ) -> Result<FlushOutcome> {
        let (coalesced, snapshot_ids) = {
            let mut inner = self.inner.lock().await;
            if inner.in_flight {
                return Ok(FlushOutcome::SkippedBusy);
            }
            let coalesced = coalesce(&inner.state.reverse_queue);
            if coalesced.is_empty() {
                return Ok(FlushOutcome::Empty);
            }
            inner.in_flight = true;
            let snapshot_ids = reverse_queue::queue_event_ids(&inner.state);
            (coalesced, snapshot_ids)
        };

        let mut send_error: Option<String> = None;
        for item in &coalesced {
            let env = reverse_action_envelope(client_id, &item.event, Utc::now());
            if let Err(e) = transport.send_text(env.to_text()).await {
                send_error = Some(e.to_string());
                break;
            }
        }

        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.in_flight = false;
        let outcome = match send_error {
            Some(reason) => {
                let EngineInner {
                    state, timeline, ..
                } = &mut *inner;
                reverse_queue::mark_failures(state, timeline, &coalesced, &reason, now);
                FlushOutcome::Failed(reason)
            }
            None => {
                reverse_queue::sweep_superseded(&mut inner.state, &coalesced, &snapshot_ids);
                FlushOutcome::Sent(coalesced.len())
            }
        };
        self.store.save_state(&inner.state).await?;
        self.store.save_timeline(&inner.timeline).await?;
        Ok(outcome)
    }

    /// Snapshot the coalesced queue (legacy HTTP path).
    pub async fn coalesced_snapshot(&self) -> (Vec<QueueItem>, HashSet<String>) {
        let inner = self.inner.lock().await;
        (
            coalesce(&inner.state.reverse_queue),
            reverse_queue::queue_event_ids(&inner.state),
        )
    }

    /// Record a failed HTTP transmit round.
    pub async fn mark_flush_failure(&self, coalesced: &[QueueItem], reason: &str) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let EngineInner {
            state, timeline, ..
        } = &mut *inner;
        reverse_queue::mark_failures(state, timeline, coalesced, reason, now);
        self.store.save_state(&inner.state).await?;
        self.store.save_timeline(&inner.timeline).await?;
        Ok(())
    }

    /// Sweep predecessors after a successful transmit round.
    pub async fn sweep_after_send(
        &self,
        coalesced: &[QueueItem],
        snapshot_ids: &HashSet<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        reverse_queue::sweep_superseded(&mut inner.state, coalesced, snapshot_ids);
        self.store.save_state(&inner.state).await?;
        Ok(())
    }

    // ==================== Session summary ====================

    /// Apply a session lifecycle update and persist the summary.
    pub async fn update_session(&self, update: SessionStatusUpdate<'_>) -> Result<u32> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let attempt = apply_session_update(&mut inner.session, update, now);
        self.store.save_session(&inner.session).await?;
        Ok(attempt)
    }

    /// Update the in-process queue depth counters.
    pub async fn set_queue_depths(&self, inbound: usize, outbound: usize) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.session.queued_inbound == inbound && inner.session.queued_outbound == outbound {
            return Ok(());
        }
        inner.session.queued_inbound = inbound;
        inner.session.queued_outbound = outbound;
        self.store.save_session(&inner.session).await?;
        Ok(())
    }
}

fn apply_session_update(
    session: &mut SessionSummary,
    update: SessionStatusUpdate<'_>,
    now: DateTime<Utc>,
) -> u32 {
    match update {
        SessionStatusUpdate::Connecting { client_id, ws_url } => {
            session.status = if session.reconnect_attempt > 0 {
                SessionStatus::Reconnecting
            } else {
                SessionStatus::Connecting
            };
            session.active_client_id = client_id.to_string();
            session.ws_url = sanitize_url(ws_url);
        }
        SessionStatusUpdate::Connected => {
            session.status = SessionStatus::Connected;
            session.reconnect_attempt = 0;
            session.last_connected_at =
                Some(now.to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        SessionStatusUpdate::Disconnected { reason, detail } => {
            session.status = SessionStatus::Disconnected;
            session.reconnect_attempt += 1;
            session.last_error = Some(if detail.is_empty() {
                reason.to_string()
            } else {
                format!("{}:{}", reason, detail)
            });
        }
        SessionStatusUpdate::ProfileDisabled => {
            session.status = SessionStatus::Disconnected;
            session.last_error = Some("active_profile_disabled".to_string());
        }
        SessionStatusUpdate::Heartbeat(ms) => {
            session.heartbeat_ms = clamp_heartbeat(ms);
        }
    }
    session.reconnect_attempt
}

/// Build the outbound `action` envelope for one reverse event.
///
/// `idempotencyKey` is the event's batch id; `target` prefers the
/// managed key with the local id as fallback.
pub fn reverse_action_envelope(
    client_id: &str,
    event: &ReverseEvent,
    now: DateTime<Utc>,
) -> Envelope {
    let mut meta = EnvelopeMeta::fresh(client_id, now);
    meta.event_id = event.event_id.clone();
    meta.idempotency_key = Some(event.batch_id.clone());
    let target = if event.managed_key.is_empty() {
        event.bookmark_id.clone()
    } else {
        event.managed_key.clone()
    };
    let mut payload = serde_json::Map::new();
    payload.insert("bookmarkId".into(), json!(event.bookmark_id));
    payload.insert("managedKey".into(), json!(event.managed_key));
    if let Some(parent_id) = &event.parent_id {
        payload.insert("parentId".into(), json!(parent_id));
    }
    if let Some(index) = event.move_index {
        payload.insert("moveIndex".into(), json!(index));
    }
    if let Some(title) = &event.title {
        payload.insert("title".into(), json!(title));
    }
    if let Some(url) = &event.url {
        payload.insert("url".into(), json!(url));
    }
    Envelope {
        meta,
        body: EnvelopeBody::Action {
            op: event.kind.as_str().to_string(),
            target,
            payload,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmarks::MemoryBookmarkStore;
    use crate::storage::MemoryKv;
    use crate::sync::state::{ReverseEventKind, REVERSE_SCHEMA_VERSION};
    use futures_lite::future::block_on;

    fn engine() -> Arc<SyncEngine> {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(MemoryBookmarkStore::new());
        block_on(SyncEngine::load(kv, store)).unwrap()
    }

    fn sample_event(event_id: &str, bookmark_id: &str) -> ReverseEvent {
        ReverseEvent {
            schema_version: REVERSE_SCHEMA_VERSION.to_string(),
            batch_id: format!("batch-{}", event_id),
            event_id: event_id.to_string(),
            kind: ReverseEventKind::BookmarkUpdated,
            bookmark_id: bookmark_id.to_string(),
            managed_key: "Projects/A.md|0".to_string(),
            title: Some("t".to_string()),
            url: Some("https://x".to_string()),
            parent_id: Some("201".to_string()),
            move_index: Some(1),
            occurred_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_reverse_action_envelope_shape() {
        let env = reverse_action_envelope("c1", &sample_event("e1", "301"), Utc::now());
        let value = env.to_value();
        assert_eq!(value["type"], "action");
        assert_eq!(value["eventId"], "e1");
        assert_eq!(value["idempotencyKey"], "batch-e1");
        assert_eq!(value["op"], "bookmark_updated");
        assert_eq!(value["target"], "Projects/A.md|0");
        assert_eq!(value["payload"]["bookmarkId"], "301");
        assert_eq!(value["payload"]["moveIndex"], 1);
    }

    #[test]
    fn test_reverse_action_envelope_target_falls_back_to_id() {
        let mut event = sample_event("e1", "301");
        event.managed_key = String::new();
        let env = reverse_action_envelope("c1", &event, Utc::now());
        assert_eq!(env.to_value()["target"], "301");
    }

    #[test]
    fn test_session_reconnect_attempt_monotonic_until_connected() {
        let engine = engine();
        let a1 = block_on(engine.update_session(SessionStatusUpdate::Disconnected {
            reason: "close_1006",
            detail: "gone",
        }))
        .unwrap();
        let a2 = block_on(engine.update_session(SessionStatusUpdate::Disconnected {
            reason: "constructor_error",
            detail: "refused",
        }))
        .unwrap();
        assert!(a2 > a1);
        block_on(engine.update_session(SessionStatusUpdate::Connected)).unwrap();
        let summary = block_on(engine.session_summary());
        assert_eq!(summary.reconnect_attempt, 0);
        assert_eq!(summary.status, SessionStatus::Connected);
        assert!(summary.last_connected_at.is_some());
    }

    #[test]
    fn test_connecting_status_reflects_prior_failures() {
        let engine = engine();
        block_on(engine.update_session(SessionStatusUpdate::Connecting {
            client_id: "c1",
            ws_url: "ws://127.0.0.1:27123/ws?token=nope",
        }))
        .unwrap();
        let summary = block_on(engine.session_summary());
        assert_eq!(summary.status, SessionStatus::Connecting);
        assert_eq!(summary.ws_url, "ws://127.0.0.1:27123");

        block_on(engine.update_session(SessionStatusUpdate::Disconnected {
            reason: "close_4000",
            detail: "heartbeat_timeout",
        }))
        .unwrap();
        block_on(engine.update_session(SessionStatusUpdate::Connecting {
            client_id: "c1",
            ws_url: "ws://127.0.0.1:27123/ws",
        }))
        .unwrap();
        assert_eq!(
            block_on(engine.session_summary()).status,
            SessionStatus::Reconnecting
        );
    }

    #[test]
    fn test_profile_disabled_marks_last_error() {
        let engine = engine();
        block_on(engine.update_session(SessionStatusUpdate::ProfileDisabled)).unwrap();
        let summary = block_on(engine.session_summary());
        assert_eq!(
            summary.last_error.as_deref(),
            Some("active_profile_disabled")
        );
    }
}

//! End-to-end reverse-sync scenarios over in-memory capabilities and a
//! scripted transport.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use markbridge_core::bookmarks::{BookmarkEvent, BookmarkNode, BookmarkStore, MemoryBookmarkStore};
use markbridge_core::storage::MemoryKv;
use markbridge_core::sync::{
    migrate, parse_envelope, BatchAckResponse, BatchAckResult, CaptureOutcome, FlushOutcome,
    SyncEngine, Transport, TransportError, WsMessage,
};

/// Transport that records sent frames and can be told to fail.
#[derive(Clone, Default)]
struct ScriptedTransport {
    sent: Arc<Mutex<Vec<String>>>,
    fail_sends: bool,
}

impl ScriptedTransport {
    fn failing() -> Self {
        Self {
            fail_sends: true,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.fail_sends {
            return Err(TransportError::SendFailed("status 503".to_string()));
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
        None
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn seeded_store() -> MemoryBookmarkStore {
    let store = MemoryBookmarkStore::new();
    store.seed_node("100", "0", "Bridge", None);
    store.seed_node("201", "100", "Projects", None);
    store
}

fn seeded_state_record() -> serde_json::Value {
    json!({
        "folders": {"__root__": "100", "note:Projects/Alpha.md": "201"},
        "bookmarks": {},
        "idToKey": {},
    })
}

async fn engine_with(kv: MemoryKv, store: MemoryBookmarkStore) -> Arc<SyncEngine> {
    SyncEngine::load(Arc::new(kv), Arc::new(store)).await.unwrap()
}

fn created_event(id: &str, parent: &str, index: u32, title: &str, url: &str) -> BookmarkEvent {
    BookmarkEvent::Created {
        node: BookmarkNode {
            id: id.to_string(),
            parent_id: Some(parent.to_string()),
            index: Some(index),
            title: title.to_string(),
            url: Some(url.to_string()),
        },
    }
}

fn persisted_state(kv: &MemoryKv) -> markbridge_core::sync::BridgeState {
    migrate(kv.peek("markbridge.state").as_ref())
}

// S1: managed create derives its key from the note-folder slot.
#[tokio::test]
async fn managed_create_derives_note_slot_key() {
    let kv = MemoryKv::new().with_record("markbridge.state", seeded_state_record());
    let engine = engine_with(kv.clone(), seeded_store()).await;

    let outcome = engine
        .on_bookmark_event(&created_event("301", "201", 0, "New", "https://ex/new"))
        .await
        .unwrap();
    assert_eq!(outcome, CaptureOutcome::Enqueued);

    let state = persisted_state(&kv);
    assert_eq!(state.reverse_queue.len(), 1);
    let item = &state.reverse_queue[0];
    assert_eq!(item.event.kind.as_str(), "bookmark_created");
    assert_eq!(item.event.managed_key, "Projects/Alpha.md|0");
    assert_eq!(item.event.bookmark_id, "301");
    assert_eq!(item.retry_count, 0);
    assert_eq!(
        state.id_to_key.get("301").map(String::as_str),
        Some("Projects/Alpha.md|0")
    );
}

// S2: an open apply epoch suppresses capture entirely.
#[tokio::test]
async fn apply_epoch_suppresses_capture() {
    let mut record = seeded_state_record();
    record.as_object_mut().unwrap().insert(
        "suppression".to_string(),
        json!({"applyEpoch": true, "epochStartedAt": "2024-01-01T00:00:00Z"}),
    );
    let kv = MemoryKv::new().with_record("markbridge.state", record);
    let engine = engine_with(kv.clone(), seeded_store()).await;

    let outcome = engine
        .on_bookmark_event(&created_event("301", "201", 0, "New", "https://ex/new"))
        .await
        .unwrap();
    assert_eq!(outcome, CaptureOutcome::Skipped("suppressed"));
    assert_eq!(persisted_state(&kv).reverse_queue.len(), 0);
}

// S3: flush transmits only the coalesced tail per bookmark.
#[tokio::test]
async fn flush_transmits_coalesced_view() {
    let kv = MemoryKv::new().with_record("markbridge.state", seeded_state_record());
    let engine = engine_with(kv.clone(), seeded_store()).await;

    engine
        .on_bookmark_event(&created_event("301", "201", 0, "v1", "https://ex/1"))
        .await
        .unwrap();
    engine
        .on_bookmark_event(&BookmarkEvent::Changed {
            id: "301".to_string(),
            title: "v2".to_string(),
            url: Some("https://ex/2".to_string()),
        })
        .await
        .unwrap();
    engine
        .on_bookmark_event(&BookmarkEvent::Changed {
            id: "301".to_string(),
            title: "v3".to_string(),
            url: Some("https://ex/3".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(engine.reverse_queue_len().await, 3);

    let mut transport = ScriptedTransport::default();
    let outcome = engine.flush_reverse(&mut transport, "c1").await.unwrap();
    assert_eq!(outcome, FlushOutcome::Sent(1));

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    let env = parse_envelope(&value).expect("outbound frame validates");
    assert_eq!(value["op"], "bookmark_updated");
    assert_eq!(value["payload"]["title"], "v3");
    assert_eq!(env.meta.idempotency_key.as_deref(), value["idempotencyKey"].as_str());

    // The sweep leaves only the transmitted event awaiting its ack.
    assert_eq!(engine.reverse_queue_len().await, 1);
}

// S4: a third transport failure quarantines the item.
#[tokio::test]
async fn transport_failure_quarantines_at_threshold() {
    let mut record = seeded_state_record();
    record.as_object_mut().unwrap().insert(
        "reverseQueue".to_string(),
        json!([{
            "event": {
                "schemaVersion": "1",
                "batchId": "batch-e1",
                "eventId": "e1",
                "type": "bookmark_updated",
                "bookmarkId": "b1",
                "managedKey": "bookmark:b1",
                "occurredAt": "2024-01-01T00:00:00Z",
            },
            "retryCount": 2,
            "enqueuedAt": "2024-01-01T00:00:00Z",
        }]),
    );
    let kv = MemoryKv::new().with_record("markbridge.state", record);
    let engine = engine_with(kv.clone(), seeded_store()).await;

    let mut transport = ScriptedTransport::failing();
    let outcome = engine.flush_reverse(&mut transport, "c1").await.unwrap();
    assert!(matches!(outcome, FlushOutcome::Failed(_)));

    assert_eq!(engine.reverse_queue_len().await, 0);
    let quarantine = engine
        .timeline_entries()
        .await
        .into_iter()
        .find(|e| e.event == "quarantine")
        .expect("quarantine recorded");
    assert!(quarantine.summary.contains("eventId=e1"));
    assert!(quarantine.summary.contains("retryCount=3"));
}

// S5: an applied ack with a resolvedKey drains the queue and records
// the mapping.
#[tokio::test]
async fn applied_ack_records_resolved_key() {
    let kv = MemoryKv::new().with_record("markbridge.state", seeded_state_record());
    let engine = engine_with(kv.clone(), seeded_store()).await;

    engine
        .on_bookmark_event(&created_event("b1", "201", 0, "New", "https://ex/new"))
        .await
        .unwrap();
    let event_id = persisted_state(&kv).reverse_queue[0].event.event_id.clone();

    engine
        .reconcile_acks(&BatchAckResponse {
            batch_id: "x".to_string(),
            results: vec![BatchAckResult {
                event_id,
                status: "applied".to_string(),
                reason: None,
                resolved_key: Some("note:Projects/Foo".to_string()),
                resolved_path: None,
            }],
        })
        .await
        .unwrap();

    let state = persisted_state(&kv);
    assert!(state.reverse_queue.is_empty());
    assert_eq!(
        state.id_to_key.get("b1").map(String::as_str),
        Some("note:Projects/Foo")
    );
}

// S6: a repeated inbound idempotency key applies once and then skips.
#[tokio::test]
async fn inbound_duplicate_applies_once() {
    let kv = MemoryKv::new().with_record("markbridge.state", seeded_state_record());
    let store = seeded_store();
    let engine = engine_with(kv.clone(), store.clone()).await;

    let frame = json!({
        "type": "action",
        "eventId": "remote-e1",
        "clientId": "c1",
        "occurredAt": "2024-01-01T00:00:00Z",
        "schemaVersion": "1.0",
        "idempotencyKey": "k1",
        "op": "bookmark_created",
        "target": "Projects/Alpha.md|0",
        "payload": {
            "parentId": "note:Projects/Alpha.md",
            "title": "FromBridge",
            "url": "https://ex/from-bridge",
            "managedKey": "Projects/Alpha.md|0",
        },
    });
    let env = parse_envelope(&frame).unwrap();

    let first = engine.handle_inbound_action(&env).await.unwrap();
    let outcome = first.expect("first application runs");
    assert_eq!(outcome.status.as_str(), "applied");
    assert_eq!(outcome.resolved_key.as_deref(), Some("Projects/Alpha.md|0"));

    let second = engine.handle_inbound_action(&env).await.unwrap();
    assert!(second.is_none());
    assert!(engine
        .timeline_entries()
        .await
        .iter()
        .any(|e| e.event == "ws_action_skip"));

    // Applied exactly once.
    let children = store.get_children("201").await.unwrap();
    assert_eq!(
        children
            .iter()
            .filter(|n| n.title == "FromBridge")
            .count(),
        1
    );

    // The apply's own observer echoes are gated by the cooldown tail.
    let state = persisted_state(&kv);
    assert!(state.suppression.cooldown_until.is_some());
    assert!(!state.suppression.apply_epoch);
}

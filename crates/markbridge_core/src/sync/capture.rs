//! Capture handlers: local bookmark events -> reverse queue.
//!
//! Every observed mutation passes the same gates: bulk-import pause
//! first, then the echo-suppression window. What survives is keyed
//! (deterministically, before enqueue, so later events coalesce) and
//! appended to the reverse queue.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::bookmarks::{BookmarkEvent, BookmarkNode, BookmarkStore};

use super::node_index;
use super::reverse_queue;
use super::state::{BridgeState, ReverseEvent, ReverseEventKind, REVERSE_SCHEMA_VERSION};
use super::timeline::DebugTimeline;

/// What a capture handler did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// A reverse event was appended to the queue.
    Enqueued,
    /// The event was gated off.
    Skipped(&'static str),
    /// The event kind is not captured (folders, import markers, ...).
    Ignored,
}

fn fresh_event(
    kind: ReverseEventKind,
    bookmark_id: &str,
    managed_key: &str,
    now: DateTime<Utc>,
) -> ReverseEvent {
    ReverseEvent {
        schema_version: REVERSE_SCHEMA_VERSION.to_string(),
        batch_id: Uuid::new_v4().to_string(),
        event_id: Uuid::new_v4().to_string(),
        kind,
        bookmark_id: bookmark_id.to_string(),
        managed_key: managed_key.to_string(),
        title: None,
        url: None,
        parent_id: None,
        move_index: None,
        occurred_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// Key for a bookmark already known or derivable, with the id fallback.
async fn key_for_bookmark(
    state: &BridgeState,
    store: &dyn BookmarkStore,
    id: &str,
) -> String {
    if let Some(key) = node_index::key_for_id(state, id) {
        return key;
    }
    match store.get(id).await {
        Ok(node) => node_index::derive_bookmark_key(state, store, &node).await,
        Err(_) => format!("bookmark:{}", id),
    }
}

/// Position of `id` among its parent's link children (folders don't
/// count).
async fn link_only_index(store: &dyn BookmarkStore, parent_id: &str, id: &str) -> Option<u32> {
    let children = store.get_children(parent_id).await.ok()?;
    children
        .iter()
        .filter(|n| !n.is_folder())
        .position(|n| n.id == id)
        .map(|i| i as u32)
}

/// Route one observed bookmark event through the capture gates.
pub async fn handle_event(
    state: &mut BridgeState,
    timeline: &mut DebugTimeline,
    store: &dyn BookmarkStore,
    event: &BookmarkEvent,
    now: DateTime<Utc>,
) -> CaptureOutcome {
    match event {
        BookmarkEvent::ImportBegan => {
            state.import_in_progress = true;
            return CaptureOutcome::Ignored;
        }
        BookmarkEvent::ImportEnded => {
            state.import_in_progress = false;
            return CaptureOutcome::Ignored;
        }
        _ => {}
    }

    if state.import_in_progress {
        timeline.record("debug", "capture_skip", "reason=import_in_progress", now);
        return CaptureOutcome::Skipped("import_in_progress");
    }
    if state.suppression.is_suppressed(now.timestamp_millis()) {
        timeline.record("debug", "capture_skip", "reason=suppressed", now);
        return CaptureOutcome::Skipped("suppressed");
    }

    let reverse = match event {
        BookmarkEvent::Created { node } => capture_created(state, store, node, now).await,
        BookmarkEvent::Changed { id, title, url } => {
            capture_changed(state, store, id, title, url.as_deref(), now).await
        }
        BookmarkEvent::Removed { id, node } => capture_removed(state, id, node, now),
        BookmarkEvent::Moved {
            id,
            parent_id,
            old_parent_id,
            ..
        } => capture_moved(state, store, id, parent_id, old_parent_id, now).await,
        BookmarkEvent::ImportBegan | BookmarkEvent::ImportEnded => unreachable!(),
    };

    match reverse {
        Some(reverse) => {
            let kind = reverse.kind;
            if reverse_queue::enqueue(state, timeline, reverse, now) {
                log::debug!("captured {}", kind.as_str());
                CaptureOutcome::Enqueued
            } else {
                CaptureOutcome::Skipped("duplicate")
            }
        }
        None => CaptureOutcome::Ignored,
    }
}

async fn capture_created(
    state: &mut BridgeState,
    store: &dyn BookmarkStore,
    node: &BookmarkNode,
    now: DateTime<Utc>,
) -> Option<ReverseEvent> {
    if node.is_folder() {
        // Folders become managed only when the bridge creates or names
        // them; local folder creation is not reported.
        return None;
    }
    let key = node_index::derive_bookmark_key(state, store, node).await;
    state.id_to_key.insert(node.id.clone(), key.clone());
    let mut event = fresh_event(ReverseEventKind::BookmarkCreated, &node.id, &key, now);
    event.title = Some(node.title.clone());
    event.url = node.url.clone();
    event.parent_id = node.parent_id.clone();
    Some(event)
}

async fn capture_changed(
    state: &mut BridgeState,
    store: &dyn BookmarkStore,
    id: &str,
    title: &str,
    url: Option<&str>,
    now: DateTime<Utc>,
) -> Option<ReverseEvent> {
    if node_index::is_managed_folder(state, id) {
        let key = node_index::key_for_id(state, id).unwrap_or_default();
        let mut event = fresh_event(ReverseEventKind::FolderRenamed, id, &key, now);
        event.title = Some(title.to_string());
        return Some(event);
    }
    // A change on an unmanaged folder carries no url and is not ours.
    url?;
    let key = key_for_bookmark(state, store, id).await;
    state.id_to_key.insert(id.to_string(), key.clone());
    let mut event = fresh_event(ReverseEventKind::BookmarkUpdated, id, &key, now);
    event.title = Some(title.to_string());
    event.url = url.map(str::to_string);
    Some(event)
}

fn capture_removed(
    state: &mut BridgeState,
    id: &str,
    node: &BookmarkNode,
    now: DateTime<Utc>,
) -> Option<ReverseEvent> {
    if node.is_folder() {
        // Managed-folder removal is not reported in v1.
        return None;
    }
    let key = node_index::key_for_id(state, id).unwrap_or_else(|| format!("bookmark:{}", id));
    Some(fresh_event(ReverseEventKind::BookmarkDeleted, id, &key, now))
}

async fn capture_moved(
    state: &mut BridgeState,
    store: &dyn BookmarkStore,
    id: &str,
    parent_id: &str,
    old_parent_id: &str,
    now: DateTime<Utc>,
) -> Option<ReverseEvent> {
    let node = store.get(id).await.ok()?;
    if node.is_folder() && !node_index::is_managed_folder(state, id) {
        return None;
    }
    let key = if node.is_folder() {
        node_index::key_for_id(state, id).unwrap_or_default()
    } else {
        let key = key_for_bookmark(state, store, id).await;
        state.id_to_key.insert(id.to_string(), key.clone());
        key
    };
    let mut event = fresh_event(ReverseEventKind::BookmarkUpdated, id, &key, now);
    event.parent_id = Some(parent_id.to_string());
    event.title = Some(node.title.clone());
    event.url = node.url.clone();
    if parent_id == old_parent_id && !node.is_folder() {
        event.move_index = link_only_index(store, parent_id, id).await;
    }
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmarks::MemoryBookmarkStore;
    use crate::sync::state::ROOT_FOLDER_KEY;
    use futures_lite::future::block_on;

    fn seeded() -> (BridgeState, MemoryBookmarkStore) {
        let store = MemoryBookmarkStore::new();
        store.seed_node("100", "0", "Bridge", None);
        store.seed_node("201", "100", "Projects", None);
        let mut state = BridgeState::default();
        state
            .folders
            .insert(ROOT_FOLDER_KEY.to_string(), "100".to_string());
        state
            .folders
            .insert("note:Projects/Alpha.md".to_string(), "201".to_string());
        (state, store)
    }

    fn created(node: BookmarkNode) -> BookmarkEvent {
        BookmarkEvent::Created { node }
    }

    fn link(id: &str, parent: &str, index: u32) -> BookmarkNode {
        BookmarkNode {
            id: id.to_string(),
            parent_id: Some(parent.to_string()),
            index: Some(index),
            title: "New".to_string(),
            url: Some("https://ex/new".to_string()),
        }
    }

    #[test]
    fn test_create_enqueues_with_derived_key() {
        let (mut state, store) = seeded();
        let mut timeline = DebugTimeline::new();
        let outcome = block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &created(link("301", "201", 0)),
            Utc::now(),
        ));
        assert_eq!(outcome, CaptureOutcome::Enqueued);
        assert_eq!(state.reverse_queue.len(), 1);
        let item = &state.reverse_queue[0];
        assert_eq!(item.event.kind, ReverseEventKind::BookmarkCreated);
        assert_eq!(item.event.managed_key, "Projects/Alpha.md|0");
        assert_eq!(item.event.bookmark_id, "301");
        assert_eq!(item.retry_count, 0);
        assert_eq!(
            state.id_to_key.get("301").map(String::as_str),
            Some("Projects/Alpha.md|0")
        );
    }

    #[test]
    fn test_apply_epoch_gates_capture() {
        let (mut state, store) = seeded();
        let mut timeline = DebugTimeline::new();
        state.suppression.set_apply_epoch(true, Utc::now());
        let outcome = block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &created(link("301", "201", 0)),
            Utc::now(),
        ));
        assert_eq!(outcome, CaptureOutcome::Skipped("suppressed"));
        assert!(state.reverse_queue.is_empty());
        assert!(timeline.has_event("capture_skip"));
    }

    #[test]
    fn test_import_window_gates_capture() {
        let (mut state, store) = seeded();
        let mut timeline = DebugTimeline::new();
        block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &BookmarkEvent::ImportBegan,
            Utc::now(),
        ));
        assert!(state.import_in_progress);
        let outcome = block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &created(link("301", "201", 0)),
            Utc::now(),
        ));
        assert_eq!(outcome, CaptureOutcome::Skipped("import_in_progress"));
        block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &BookmarkEvent::ImportEnded,
            Utc::now(),
        ));
        assert!(!state.import_in_progress);
    }

    #[test]
    fn test_folder_creation_ignored() {
        let (mut state, store) = seeded();
        let mut timeline = DebugTimeline::new();
        let folder = BookmarkNode {
            id: "500".to_string(),
            parent_id: Some("100".to_string()),
            index: Some(0),
            title: "Local stuff".to_string(),
            url: None,
        };
        let outcome = block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &created(folder),
            Utc::now(),
        ));
        assert_eq!(outcome, CaptureOutcome::Ignored);
    }

    #[test]
    fn test_change_on_managed_folder_is_rename() {
        let (mut state, store) = seeded();
        let mut timeline = DebugTimeline::new();
        let outcome = block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &BookmarkEvent::Changed {
                id: "201".to_string(),
                title: "Projects v2".to_string(),
                url: None,
            },
            Utc::now(),
        ));
        assert_eq!(outcome, CaptureOutcome::Enqueued);
        let item = &state.reverse_queue[0];
        assert_eq!(item.event.kind, ReverseEventKind::FolderRenamed);
        assert_eq!(item.event.managed_key, "note:Projects/Alpha.md");
        assert!(item.event.url.is_none());
    }

    #[test]
    fn test_managed_folder_removal_ignored() {
        let (mut state, store) = seeded();
        let mut timeline = DebugTimeline::new();
        let folder = BookmarkNode {
            id: "201".to_string(),
            parent_id: Some("100".to_string()),
            index: Some(0),
            title: "Projects".to_string(),
            url: None,
        };
        let outcome = block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &BookmarkEvent::Removed {
                id: "201".to_string(),
                node: folder,
            },
            Utc::now(),
        ));
        assert_eq!(outcome, CaptureOutcome::Ignored);
    }

    #[test]
    fn test_removed_bookmark_uses_last_known_key() {
        let (mut state, store) = seeded();
        let mut timeline = DebugTimeline::new();
        state
            .bookmarks
            .insert("Projects/Alpha.md|0".to_string(), "301".to_string());
        state
            .id_to_key
            .insert("301".to_string(), "Projects/Alpha.md|0".to_string());
        let outcome = block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &BookmarkEvent::Removed {
                id: "301".to_string(),
                node: link("301", "201", 0),
            },
            Utc::now(),
        ));
        assert_eq!(outcome, CaptureOutcome::Enqueued);
        let item = &state.reverse_queue[0];
        assert_eq!(item.event.kind, ReverseEventKind::BookmarkDeleted);
        assert_eq!(item.event.managed_key, "Projects/Alpha.md|0");
    }

    #[test]
    fn test_removed_unmanaged_bookmark_falls_back_to_id_key() {
        let (mut state, store) = seeded();
        let mut timeline = DebugTimeline::new();
        block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &BookmarkEvent::Removed {
                id: "999".to_string(),
                node: link("999", "201", 0),
            },
            Utc::now(),
        ));
        assert_eq!(state.reverse_queue[0].event.managed_key, "bookmark:999");
    }

    #[test]
    fn test_same_parent_move_carries_link_only_index() {
        let (mut state, store) = seeded();
        let mut timeline = DebugTimeline::new();
        // A folder sits first, so raw index 2 is link index 1.
        store.seed_node("210", "201", "sub", None);
        store.seed_node("301", "201", "first", Some("https://1"));
        store.seed_node("302", "201", "second", Some("https://2"));
        let outcome = block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &BookmarkEvent::Moved {
                id: "302".to_string(),
                parent_id: "201".to_string(),
                old_parent_id: "201".to_string(),
                index: 2,
            },
            Utc::now(),
        ));
        assert_eq!(outcome, CaptureOutcome::Enqueued);
        let item = &state.reverse_queue[0];
        assert_eq!(item.event.kind, ReverseEventKind::BookmarkUpdated);
        assert_eq!(item.event.move_index, Some(1));
    }

    #[test]
    fn test_cross_parent_move_has_no_move_index() {
        let (mut state, store) = seeded();
        let mut timeline = DebugTimeline::new();
        store.seed_node("202", "100", "Inbox", None);
        store.seed_node("301", "202", "moved", Some("https://1"));
        block_on(handle_event(
            &mut state,
            &mut timeline,
            &store,
            &BookmarkEvent::Moved {
                id: "301".to_string(),
                parent_id: "202".to_string(),
                old_parent_id: "201".to_string(),
                index: 0,
            },
            Utc::now(),
        ));
        let item = &state.reverse_queue[0];
        assert_eq!(item.event.move_index, None);
        assert_eq!(item.event.parent_id.as_deref(), Some("202"));
    }
}

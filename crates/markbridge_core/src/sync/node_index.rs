//! Managed-node index: managed keys <-> local bookmark ids.
//!
//! Key namespaces: `folder:<path>` and `note:<path>` for folders, the
//! reserved root entry, and bookmark keys derived on capture (a
//! `note:` slot key like `Projects/A.md|0`, a parent's `folder:` key, a
//! `folder:<title>` guess, or the `bookmark:<id>` fallback). Lookups go
//! through the inverse map first and fall back to a scan.

use crate::bookmarks::{BookmarkNode, BookmarkStore};

use super::state::BridgeState;

/// Whether `id` is a managed folder.
pub fn is_managed_folder(state: &BridgeState, id: &str) -> bool {
    state.folders.values().any(|v| v == id)
}

/// Whether `id` is a managed bookmark.
pub fn is_managed_bookmark(state: &BridgeState, id: &str) -> bool {
    state.bookmarks.values().any(|v| v == id)
}

/// Managed key for a local id, bookmark or folder.
pub fn key_for_id(state: &BridgeState, id: &str) -> Option<String> {
    if let Some(key) = state.id_to_key.get(id) {
        return Some(key.clone());
    }
    state
        .bookmarks
        .iter()
        .chain(state.folders.iter())
        .find(|(_, v)| v.as_str() == id)
        .map(|(k, _)| k.clone())
}

/// Managed folder key for a local folder id.
pub fn folder_key_for_id(state: &BridgeState, id: &str) -> Option<String> {
    if let Some(key) = state.id_to_key.get(id) {
        if state.folders.contains_key(key) {
            return Some(key.clone());
        }
    }
    state
        .folders
        .iter()
        .find(|(_, v)| v.as_str() == id)
        .map(|(k, _)| k.clone())
}

/// Record a bookmark key <-> id mapping in both directions.
///
/// Drops any stale key previously recorded for the same id so the
/// mapping stays one-to-one.
pub fn record_mapping(state: &mut BridgeState, id: &str, key: &str) {
    if let Some(old_key) = state.id_to_key.get(id) {
        if old_key != key {
            let old_key = old_key.clone();
            state.bookmarks.remove(&old_key);
        }
    }
    state.bookmarks.insert(key.to_string(), id.to_string());
    state.id_to_key.insert(id.to_string(), key.to_string());
}

/// Derive the managed key for a locally-created (or touched) bookmark.
///
/// Deterministic: a `note:`-keyed parent yields the note path plus the
/// link slot (`<path>|<index>`), a `folder:`-keyed parent yields the
/// parent key itself, an unmanaged parent with a title yields
/// `folder:<title>`, and anything else falls back to `bookmark:<id>`.
pub async fn derive_bookmark_key(
    state: &BridgeState,
    store: &dyn BookmarkStore,
    node: &BookmarkNode,
) -> String {
    if let Some(key) = state.id_to_key.get(&node.id) {
        return key.clone();
    }

    if let Some(parent_id) = &node.parent_id {
        if let Some(parent_key) = folder_key_for_id(state, parent_id) {
            if let Some(path) = parent_key.strip_prefix("note:") {
                let index = node.index.unwrap_or(0);
                return format!("{}|{}", path, index);
            }
            if parent_key.starts_with("folder:") {
                return parent_key;
            }
        }
        if let Ok(parent) = store.get(parent_id).await {
            if !parent.title.is_empty() {
                return format!("folder:{}", parent.title);
            }
        }
    }

    format!("bookmark:{}", node.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmarks::MemoryBookmarkStore;
    use futures_lite::future::block_on;

    fn node(id: &str, parent: &str, index: u32) -> BookmarkNode {
        BookmarkNode {
            id: id.to_string(),
            parent_id: Some(parent.to_string()),
            index: Some(index),
            title: "New".to_string(),
            url: Some("https://ex/new".to_string()),
        }
    }

    fn state_with_note_folder() -> BridgeState {
        let mut state = BridgeState::default();
        state
            .folders
            .insert(super::super::state::ROOT_FOLDER_KEY.to_string(), "100".to_string());
        state
            .folders
            .insert("note:Projects/Alpha.md".to_string(), "201".to_string());
        state
    }

    #[test]
    fn test_note_parent_yields_slot_key() {
        let state = state_with_note_folder();
        let store = MemoryBookmarkStore::new();
        let key = block_on(derive_bookmark_key(&state, &store, &node("301", "201", 0)));
        assert_eq!(key, "Projects/Alpha.md|0");
    }

    #[test]
    fn test_note_parent_missing_index_defaults_to_zero() {
        let state = state_with_note_folder();
        let store = MemoryBookmarkStore::new();
        let mut n = node("301", "201", 0);
        n.index = None;
        let key = block_on(derive_bookmark_key(&state, &store, &n));
        assert_eq!(key, "Projects/Alpha.md|0");
    }

    #[test]
    fn test_folder_parent_yields_parent_key() {
        let mut state = BridgeState::default();
        state
            .folders
            .insert("folder:Reading".to_string(), "210".to_string());
        let store = MemoryBookmarkStore::new();
        let key = block_on(derive_bookmark_key(&state, &store, &node("301", "210", 3)));
        assert_eq!(key, "folder:Reading");
    }

    #[test]
    fn test_unmanaged_titled_parent_yields_title_key() {
        let state = BridgeState::default();
        let store = MemoryBookmarkStore::new();
        store.seed_node("400", "0", "Misc Links", None);
        let key = block_on(derive_bookmark_key(&state, &store, &node("301", "400", 0)));
        assert_eq!(key, "folder:Misc Links");
    }

    #[test]
    fn test_fallback_is_bookmark_id() {
        let state = BridgeState::default();
        let store = MemoryBookmarkStore::new();
        let key = block_on(derive_bookmark_key(&state, &store, &node("301", "999", 0)));
        assert_eq!(key, "bookmark:301");
    }

    #[test]
    fn test_existing_mapping_wins() {
        let mut state = state_with_note_folder();
        state
            .id_to_key
            .insert("301".to_string(), "note:Projects/Pinned".to_string());
        let store = MemoryBookmarkStore::new();
        let key = block_on(derive_bookmark_key(&state, &store, &node("301", "201", 5)));
        assert_eq!(key, "note:Projects/Pinned");
    }

    #[test]
    fn test_record_mapping_stays_one_to_one() {
        let mut state = BridgeState::default();
        record_mapping(&mut state, "301", "Projects/A.md|0");
        record_mapping(&mut state, "301", "note:Projects/A");
        assert_eq!(state.bookmarks.len(), 1);
        assert_eq!(
            state.bookmarks.get("note:Projects/A").map(String::as_str),
            Some("301")
        );
        assert_eq!(
            state.id_to_key.get("301").map(String::as_str),
            Some("note:Projects/A")
        );
    }

    #[test]
    fn test_lookups_cover_both_maps() {
        let mut state = state_with_note_folder();
        state
            .bookmarks
            .insert("Projects/Alpha.md|0".to_string(), "301".to_string());
        assert!(is_managed_folder(&state, "201"));
        assert!(!is_managed_folder(&state, "301"));
        assert!(is_managed_bookmark(&state, "301"));
        assert_eq!(
            key_for_id(&state, "301").as_deref(),
            Some("Projects/Alpha.md|0")
        );
        assert_eq!(
            folder_key_for_id(&state, "201").as_deref(),
            Some("note:Projects/Alpha.md")
        );
    }
}

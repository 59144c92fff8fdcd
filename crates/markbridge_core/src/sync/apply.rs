//! Inbound action applier.
//!
//! Applies validated `action` envelopes from the bridge to the local
//! bookmark tree and produces the ack disposition. Store failures are
//! not errors here: they fold into a `skipped_ambiguous` outcome with
//! the failure message as the reason, exactly what the ack carries.

use serde_json::{Map, Value};

use crate::bookmarks::{BookmarkError, BookmarkStore, CreateDetails, MoveDetails, UpdateDetails};

use super::envelope::LegacyAckStatus;
use super::state::{BridgeState, ROOT_FOLDER_KEY};

/// Title of the gateway root folder, created on first apply.
pub const GATEWAY_ROOT_TITLE: &str = "Bridge";

/// Disposition of one applied action, ready for ack construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Result in the legacy vocabulary.
    pub status: LegacyAckStatus,
    /// Failure or skip reason.
    pub reason: Option<String>,
    /// Key reported back to the bridge for created/updated nodes.
    pub resolved_key: Option<String>,
}

impl ApplyOutcome {
    fn applied(resolved_key: Option<String>) -> Self {
        Self {
            status: LegacyAckStatus::Applied,
            reason: None,
            resolved_key,
        }
    }

    fn rejected(reason: &str) -> Self {
        Self {
            status: LegacyAckStatus::RejectedInvalid,
            reason: Some(reason.to_string()),
            resolved_key: None,
        }
    }

    fn store_failure(err: BookmarkError) -> Self {
        Self {
            status: LegacyAckStatus::SkippedAmbiguous,
            reason: Some(err.to_string()),
            resolved_key: None,
        }
    }
}

fn payload_str(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Resolve the local node id an inbound action refers to.
///
/// Order: an explicit `payload.bookmarkId`, then the managed maps keyed
/// by `payload.managedKey`, then by `target`.
fn resolve_node_id(state: &BridgeState, payload: &Map<String, Value>, target: &str) -> Option<String> {
    if let Some(id) = payload_str(payload, "bookmarkId") {
        return Some(id);
    }
    for key in [payload_str(payload, "managedKey"), Some(target.to_string())]
        .into_iter()
        .flatten()
    {
        if let Some(id) = state.bookmarks.get(&key).or_else(|| state.folders.get(&key)) {
            return Some(id.clone());
        }
    }
    None
}

/// Resolve a parent reference: a managed folder key, else a local id.
fn resolve_parent_id(state: &BridgeState, parent: &str) -> String {
    state
        .folders
        .get(parent)
        .cloned()
        .unwrap_or_else(|| parent.to_string())
}

fn created_resolved_key(payload: &Map<String, Value>, target: &str, node_id: &str) -> String {
    payload_str(payload, "managedKey").unwrap_or_else(|| {
        if target.is_empty() {
            node_id.to_string()
        } else {
            target.to_string()
        }
    })
}

/// Apply one inbound action and report its disposition.
///
/// The caller holds the apply epoch open around this call and arms the
/// cooldown afterwards; nothing here touches suppression.
pub async fn apply_action(
    state: &mut BridgeState,
    store: &dyn BookmarkStore,
    op: &str,
    target: &str,
    payload: &Map<String, Value>,
) -> ApplyOutcome {
    match op {
        "bookmark_created" => {
            let parent = match payload_str(payload, "parentId") {
                Some(parent) => parent,
                None => return ApplyOutcome::rejected("missing_parent_id"),
            };
            let parent_id = resolve_parent_id(state, &parent);
            let details = CreateDetails {
                parent_id,
                title: payload_str(payload, "title").unwrap_or_default(),
                url: payload_str(payload, "url"),
            };
            match store.create(details).await {
                Ok(node) => {
                    let key = created_resolved_key(payload, target, &node.id);
                    super::node_index::record_mapping(state, &node.id, &key);
                    ApplyOutcome::applied(Some(key))
                }
                Err(e) => ApplyOutcome::store_failure(e),
            }
        }
        "bookmark_updated" => {
            let id = match resolve_node_id(state, payload, target) {
                Some(id) => id,
                None => return ApplyOutcome::rejected("missing_bookmark_id"),
            };
            let details = UpdateDetails {
                title: payload_str(payload, "title"),
                url: payload_str(payload, "url"),
            };
            match store.update(&id, details).await {
                Ok(node) => {
                    let key = created_resolved_key(payload, target, &node.id);
                    super::node_index::record_mapping(state, &node.id, &key);
                    ApplyOutcome::applied(Some(key))
                }
                Err(e) => ApplyOutcome::store_failure(e),
            }
        }
        "bookmark_deleted" => {
            let id = match resolve_node_id(state, payload, target) {
                Some(id) => id,
                None => return ApplyOutcome::rejected("missing_bookmark_id"),
            };
            match store.remove(&id).await {
                Ok(()) => {
                    if let Some(key) = state.id_to_key.remove(&id) {
                        state.bookmarks.remove(&key);
                    }
                    state.bookmarks.retain(|_, v| v != &id);
                    ApplyOutcome::applied(None)
                }
                Err(e) => ApplyOutcome::store_failure(e),
            }
        }
        "folder_renamed" => {
            let id = match resolve_node_id(state, payload, target) {
                Some(id) => id,
                None => return ApplyOutcome::rejected("missing_bookmark_id"),
            };
            let title = match payload_str(payload, "title") {
                Some(title) => title,
                None => return ApplyOutcome::rejected("missing_title"),
            };
            match store
                .update(
                    &id,
                    UpdateDetails {
                        title: Some(title),
                        url: None,
                    },
                )
                .await
            {
                Ok(_) => ApplyOutcome::applied(None),
                Err(e) => ApplyOutcome::store_failure(e),
            }
        }
        "bookmark_moved" => {
            let id = match resolve_node_id(state, payload, target) {
                Some(id) => id,
                None => return ApplyOutcome::rejected("missing_bookmark_id"),
            };
            let parent = match payload_str(payload, "parentId") {
                Some(parent) => parent,
                None => return ApplyOutcome::rejected("missing_parent_id"),
            };
            let details = MoveDetails {
                parent_id: resolve_parent_id(state, &parent),
                index: payload.get("index").and_then(Value::as_u64).map(|i| i as u32),
            };
            match store.move_node(&id, details).await {
                Ok(_) => ApplyOutcome::applied(None),
                Err(e) => ApplyOutcome::store_failure(e),
            }
        }
        "snapshot" => match apply_snapshot(state, store, payload).await {
            Ok(()) => ApplyOutcome::applied(None),
            Err(e) => ApplyOutcome::store_failure(e),
        },
        _ => ApplyOutcome::rejected("unsupported_action"),
    }
}

// ==================== Snapshot apply ====================

/// Ensure the gateway root folder exists and return its local id.
pub async fn ensure_gateway_root(
    state: &mut BridgeState,
    store: &dyn BookmarkStore,
) -> Result<String, BookmarkError> {
    if let Some(id) = state.folders.get(ROOT_FOLDER_KEY) {
        if store.get(id).await.is_ok() {
            return Ok(id.clone());
        }
    }
    let tree = store.get_tree().await?;
    let host_root = tree
        .first()
        .map(|n| n.id.clone())
        .ok_or_else(|| BookmarkError::Invalid("bookmark tree has no root".to_string()))?;
    let node = store
        .create(CreateDetails {
            parent_id: host_root,
            title: GATEWAY_ROOT_TITLE.to_string(),
            url: None,
        })
        .await?;
    state
        .folders
        .insert(ROOT_FOLDER_KEY.to_string(), node.id.clone());
    Ok(node.id)
}

/// Wholesale re-apply of the desired managed tree.
///
/// Payload shape: `folders[] = {key, title}` and
/// `bookmarks[] = {key, title, url, folderKey}`. Managed nodes absent
/// from the snapshot are removed; `idToKey` is rebuilt from scratch.
async fn apply_snapshot(
    state: &mut BridgeState,
    store: &dyn BookmarkStore,
    payload: &Map<String, Value>,
) -> Result<(), BookmarkError> {
    let root_id = ensure_gateway_root(state, store).await?;

    let folder_entries: Vec<(String, String)> = payload
        .get("folders")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let obj = item.as_object()?;
                    let key = payload_str(obj, "key")?;
                    Some((key, payload_str(obj, "title").unwrap_or_default()))
                })
                .collect()
        })
        .unwrap_or_default();

    for (key, title) in &folder_entries {
        let live = match state.folders.get(key) {
            Some(id) => store.get(id).await.ok().map(|_| id.clone()),
            None => None,
        };
        match live {
            Some(id) => {
                store
                    .update(
                        &id,
                        UpdateDetails {
                            title: Some(title.clone()),
                            url: None,
                        },
                    )
                    .await?;
            }
            None => {
                let node = store
                    .create(CreateDetails {
                        parent_id: root_id.clone(),
                        title: title.clone(),
                        url: None,
                    })
                    .await?;
                state.folders.insert(key.clone(), node.id);
            }
        }
    }

    let bookmark_entries: Vec<(String, String, Option<String>, Option<String>)> = payload
        .get("bookmarks")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let obj = item.as_object()?;
                    let key = payload_str(obj, "key")?;
                    Some((
                        key,
                        payload_str(obj, "title").unwrap_or_default(),
                        payload_str(obj, "url"),
                        payload_str(obj, "folderKey"),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    let mut desired_bookmark_keys = std::collections::HashSet::new();
    for (key, title, url, folder_key) in &bookmark_entries {
        desired_bookmark_keys.insert(key.clone());
        let parent_id = folder_key
            .as_ref()
            .and_then(|fk| state.folders.get(fk).cloned())
            .unwrap_or_else(|| root_id.clone());
        let live = match state.bookmarks.get(key) {
            Some(id) => store.get(id).await.ok(),
            None => None,
        };
        match live {
            Some(node) => {
                store
                    .update(
                        &node.id,
                        UpdateDetails {
                            title: Some(title.clone()),
                            url: url.clone(),
                        },
                    )
                    .await?;
                if node.parent_id.as_deref() != Some(parent_id.as_str()) {
                    store
                        .move_node(
                            &node.id,
                            MoveDetails {
                                parent_id,
                                index: None,
                            },
                        )
                        .await?;
                }
            }
            None => {
                let node = store
                    .create(CreateDetails {
                        parent_id,
                        title: title.clone(),
                        url: url.clone(),
                    })
                    .await?;
                state.bookmarks.insert(key.clone(), node.id);
            }
        }
    }

    // Drop managed bookmarks the snapshot no longer carries.
    let stale: Vec<(String, String)> = state
        .bookmarks
        .iter()
        .filter(|(key, _)| !desired_bookmark_keys.contains(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, id) in stale {
        match store.remove(&id).await {
            Ok(()) | Err(BookmarkError::NotFound { .. }) => {
                state.bookmarks.remove(&key);
            }
            Err(e) => return Err(e),
        }
    }

    // Drop managed folders the snapshot no longer names (root excluded).
    let desired_folder_keys: std::collections::HashSet<&String> =
        folder_entries.iter().map(|(k, _)| k).collect();
    let stale: Vec<(String, String)> = state
        .folders
        .iter()
        .filter(|(key, _)| key.as_str() != ROOT_FOLDER_KEY && !desired_folder_keys.contains(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, id) in stale {
        match store.remove_tree(&id).await {
            Ok(()) | Err(BookmarkError::NotFound { .. }) => {
                state.folders.remove(&key);
            }
            Err(e) => return Err(e),
        }
    }

    // idToKey is rebuilt wholesale on every full apply.
    state.id_to_key.clear();
    let entries: Vec<(String, String)> = state
        .folders
        .iter()
        .chain(state.bookmarks.iter())
        .map(|(k, v)| (v.clone(), k.clone()))
        .collect();
    state.id_to_key.extend(entries);

    Ok(())
}

//! In-memory bookmark store.
//!
//! Serves as the test fixture and as the CLI's working tree (seeded from
//! and exported to a JSON file). Mirrors the observer behavior of a real
//! browser store: every mutation fires the registered observer, whoever
//! caused it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    BookmarkError, BookmarkEvent, BookmarkNode, BookmarkObserver, BookmarkResult, BookmarkStore,
    CreateDetails, MoveDetails, UpdateDetails,
};

/// The fixed id of the tree root.
pub const ROOT_ID: &str = "0";

#[derive(Debug, Clone)]
struct StoredNode {
    parent_id: Option<String>,
    title: String,
    url: Option<String>,
}

#[derive(Default)]
struct TreeInner {
    nodes: HashMap<String, StoredNode>,
    children: HashMap<String, Vec<String>>,
    next_id: u64,
}

/// A `BookmarkStore` backed by in-process maps.
///
/// Clones share the same tree and observer registration.
#[derive(Clone)]
pub struct MemoryBookmarkStore {
    inner: Arc<Mutex<TreeInner>>,
    observer: Arc<Mutex<Option<BookmarkObserver>>>,
}

impl Default for MemoryBookmarkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBookmarkStore {
    /// Create a store containing only the root folder (id `"0"`).
    pub fn new() -> Self {
        let mut inner = TreeInner {
            next_id: 1000,
            ..TreeInner::default()
        };
        inner.nodes.insert(
            ROOT_ID.to_string(),
            StoredNode {
                parent_id: None,
                title: String::new(),
                url: None,
            },
        );
        inner.children.insert(ROOT_ID.to_string(), Vec::new());
        Self {
            inner: Arc::new(Mutex::new(inner)),
            observer: Arc::new(Mutex::new(None)),
        }
    }

    /// Insert a node with a caller-chosen id (seeding; fires no event).
    pub fn seed_node(&self, id: &str, parent_id: &str, title: &str, url: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.insert(
            id.to_string(),
            StoredNode {
                parent_id: Some(parent_id.to_string()),
                title: title.to_string(),
                url: url.map(str::to_string),
            },
        );
        inner.children.entry(id.to_string()).or_default();
        inner
            .children
            .entry(parent_id.to_string())
            .or_default()
            .push(id.to_string());
    }

    /// Fire the bulk-import begin event.
    pub fn begin_import(&self) {
        self.emit(BookmarkEvent::ImportBegan);
    }

    /// Fire the bulk-import end event.
    pub fn end_import(&self) {
        self.emit(BookmarkEvent::ImportEnded);
    }

    /// Export every node except the root (for the CLI's file seed).
    pub fn export_nodes(&self) -> Vec<BookmarkNode> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let mut stack = vec![ROOT_ID.to_string()];
        while let Some(id) = stack.pop() {
            if id != ROOT_ID {
                out.push(Self::view(&inner, &id).expect("listed node exists"));
            }
            if let Some(kids) = inner.children.get(&id) {
                for kid in kids.iter().rev() {
                    stack.push(kid.clone());
                }
            }
        }
        out
    }

    /// Seed the tree from exported nodes (fires no events).
    ///
    /// Nodes referencing an unknown parent land under the root.
    pub fn load_nodes(&self, nodes: &[BookmarkNode]) {
        for node in nodes {
            let parent = node.parent_id.as_deref().unwrap_or(ROOT_ID);
            let parent = {
                let inner = self.inner.lock().unwrap();
                if inner.nodes.contains_key(parent) {
                    parent.to_string()
                } else {
                    ROOT_ID.to_string()
                }
            };
            self.seed_node(&node.id, &parent, &node.title, node.url.as_deref());
        }
    }

    fn emit(&self, event: BookmarkEvent) {
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer(event);
        }
    }

    fn view(inner: &TreeInner, id: &str) -> Option<BookmarkNode> {
        let stored = inner.nodes.get(id)?;
        let index = stored.parent_id.as_ref().and_then(|p| {
            inner
                .children
                .get(p)
                .and_then(|kids| kids.iter().position(|k| k == id))
                .map(|i| i as u32)
        });
        Some(BookmarkNode {
            id: id.to_string(),
            parent_id: stored.parent_id.clone(),
            index,
            title: stored.title.clone(),
            url: stored.url.clone(),
        })
    }

    fn mint_id(inner: &mut TreeInner) -> String {
        inner.next_id += 1;
        inner.next_id.to_string()
    }
}

#[async_trait]
impl BookmarkStore for MemoryBookmarkStore {
    fn set_observer(&self, observer: BookmarkObserver) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    fn clear_observer(&self) {
        *self.observer.lock().unwrap() = None;
    }

    async fn get(&self, id: &str) -> BookmarkResult<BookmarkNode> {
        let inner = self.inner.lock().unwrap();
        Self::view(&inner, id).ok_or_else(|| BookmarkError::NotFound { id: id.to_string() })
    }

    async fn get_children(&self, parent_id: &str) -> BookmarkResult<Vec<BookmarkNode>> {
        let inner = self.inner.lock().unwrap();
        if !inner.nodes.contains_key(parent_id) {
            return Err(BookmarkError::NotFound {
                id: parent_id.to_string(),
            });
        }
        let ids = inner.children.get(parent_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| Self::view(&inner, id))
            .collect())
    }

    async fn get_tree(&self) -> BookmarkResult<Vec<BookmarkNode>> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let mut stack = vec![ROOT_ID.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(node) = Self::view(&inner, &id) {
                out.push(node);
            }
            if let Some(kids) = inner.children.get(&id) {
                for kid in kids.iter().rev() {
                    stack.push(kid.clone());
                }
            }
        }
        Ok(out)
    }

    async fn create(&self, details: CreateDetails) -> BookmarkResult<BookmarkNode> {
        let node = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.nodes.contains_key(&details.parent_id) {
                return Err(BookmarkError::NotFound {
                    id: details.parent_id.clone(),
                });
            }
            let id = Self::mint_id(&mut inner);
            inner.nodes.insert(
                id.clone(),
                StoredNode {
                    parent_id: Some(details.parent_id.clone()),
                    title: details.title.clone(),
                    url: details.url.clone(),
                },
            );
            inner.children.entry(id.clone()).or_default();
            inner
                .children
                .entry(details.parent_id.clone())
                .or_default()
                .push(id.clone());
            Self::view(&inner, &id).expect("just inserted")
        };
        self.emit(BookmarkEvent::Created { node: node.clone() });
        Ok(node)
    }

    async fn update(&self, id: &str, details: UpdateDetails) -> BookmarkResult<BookmarkNode> {
        let node = {
            let mut inner = self.inner.lock().unwrap();
            let stored = inner
                .nodes
                .get_mut(id)
                .ok_or_else(|| BookmarkError::NotFound { id: id.to_string() })?;
            if let Some(title) = details.title {
                stored.title = title;
            }
            if let Some(url) = details.url {
                if stored.url.is_none() {
                    return Err(BookmarkError::Invalid(
                        "cannot set a url on a folder".to_string(),
                    ));
                }
                stored.url = Some(url);
            }
            Self::view(&inner, id).expect("just updated")
        };
        self.emit(BookmarkEvent::Changed {
            id: id.to_string(),
            title: node.title.clone(),
            url: node.url.clone(),
        });
        Ok(node)
    }

    async fn move_node(&self, id: &str, details: MoveDetails) -> BookmarkResult<BookmarkNode> {
        let (node, old_parent, new_index) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.nodes.contains_key(&details.parent_id) {
                return Err(BookmarkError::NotFound {
                    id: details.parent_id.clone(),
                });
            }
            let old_parent = inner
                .nodes
                .get(id)
                .and_then(|n| n.parent_id.clone())
                .ok_or_else(|| BookmarkError::NotFound { id: id.to_string() })?;
            if let Some(kids) = inner.children.get_mut(&old_parent) {
                kids.retain(|k| k != id);
            }
            let kids = inner
                .children
                .entry(details.parent_id.clone())
                .or_default();
            let index = details
                .index
                .map(|i| (i as usize).min(kids.len()))
                .unwrap_or(kids.len());
            kids.insert(index, id.to_string());
            if let Some(stored) = inner.nodes.get_mut(id) {
                stored.parent_id = Some(details.parent_id.clone());
            }
            let node = Self::view(&inner, id).expect("just moved");
            (node, old_parent, index as u32)
        };
        self.emit(BookmarkEvent::Moved {
            id: id.to_string(),
            parent_id: details.parent_id,
            old_parent_id: old_parent,
            index: new_index,
        });
        Ok(node)
    }

    async fn remove(&self, id: &str) -> BookmarkResult<()> {
        let node = {
            let mut inner = self.inner.lock().unwrap();
            let node = Self::view(&inner, id)
                .ok_or_else(|| BookmarkError::NotFound { id: id.to_string() })?;
            if inner.children.get(id).map(|k| !k.is_empty()).unwrap_or(false) {
                return Err(BookmarkError::Invalid(format!(
                    "folder {} is not empty",
                    id
                )));
            }
            if let Some(parent) = &node.parent_id {
                if let Some(kids) = inner.children.get_mut(parent) {
                    kids.retain(|k| k != id);
                }
            }
            inner.nodes.remove(id);
            inner.children.remove(id);
            node
        };
        self.emit(BookmarkEvent::Removed {
            id: id.to_string(),
            node,
        });
        Ok(())
    }

    async fn remove_tree(&self, id: &str) -> BookmarkResult<()> {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let root = Self::view(&inner, id)
                .ok_or_else(|| BookmarkError::NotFound { id: id.to_string() })?;
            let mut doomed = vec![id.to_string()];
            let mut i = 0;
            while i < doomed.len() {
                if let Some(kids) = inner.children.get(&doomed[i]) {
                    doomed.extend(kids.iter().cloned());
                }
                i += 1;
            }
            if let Some(parent) = &root.parent_id {
                if let Some(kids) = inner.children.get_mut(parent) {
                    kids.retain(|k| k != id);
                }
            }
            let mut removed = Vec::new();
            // Children first so observers never see an orphan under a live id.
            for victim in doomed.iter().rev() {
                if let Some(node) = Self::view(&inner, victim) {
                    removed.push(node);
                }
                inner.nodes.remove(victim);
                inner.children.remove(victim);
            }
            removed
        };
        for node in removed {
            self.emit(BookmarkEvent::Removed {
                id: node.id.clone(),
                node,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_create_assigns_ids_and_order() {
        let store = MemoryBookmarkStore::new();
        let a = block_on(store.create(CreateDetails {
            parent_id: ROOT_ID.to_string(),
            title: "A".to_string(),
            url: Some("https://a".to_string()),
        }))
        .unwrap();
        let b = block_on(store.create(CreateDetails {
            parent_id: ROOT_ID.to_string(),
            title: "B".to_string(),
            url: None,
        }))
        .unwrap();
        assert_ne!(a.id, b.id);
        assert!(b.is_folder());
        let kids = block_on(store.get_children(ROOT_ID)).unwrap();
        assert_eq!(kids[0].id, a.id);
        assert_eq!(kids[1].id, b.id);
        assert_eq!(kids[1].index, Some(1));
    }

    #[test]
    fn test_observer_sees_applied_mutations() {
        let store = MemoryBookmarkStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        store.set_observer(Arc::new(move |event| {
            if matches!(event, BookmarkEvent::Created { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));
        block_on(store.create(CreateDetails {
            parent_id: ROOT_ID.to_string(),
            title: "A".to_string(),
            url: Some("https://a".to_string()),
        }))
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_move_within_parent_reindexes() {
        let store = MemoryBookmarkStore::new();
        store.seed_node("1", ROOT_ID, "one", Some("https://1"));
        store.seed_node("2", ROOT_ID, "two", Some("https://2"));
        block_on(store.move_node(
            "2",
            MoveDetails {
                parent_id: ROOT_ID.to_string(),
                index: Some(0),
            },
        ))
        .unwrap();
        let kids = block_on(store.get_children(ROOT_ID)).unwrap();
        assert_eq!(kids[0].id, "2");
        assert_eq!(kids[1].id, "1");
    }

    #[test]
    fn test_remove_tree_removes_descendants() {
        let store = MemoryBookmarkStore::new();
        store.seed_node("10", ROOT_ID, "folder", None);
        store.seed_node("11", "10", "leaf", Some("https://x"));
        block_on(store.remove_tree("10")).unwrap();
        assert!(block_on(store.get("10")).is_err());
        assert!(block_on(store.get("11")).is_err());
    }

    #[test]
    fn test_export_then_load_roundtrips() {
        let store = MemoryBookmarkStore::new();
        store.seed_node("10", ROOT_ID, "folder", None);
        store.seed_node("11", "10", "leaf", Some("https://x"));
        let nodes = store.export_nodes();

        let restored = MemoryBookmarkStore::new();
        restored.load_nodes(&nodes);
        let leaf = block_on(restored.get("11")).unwrap();
        assert_eq!(leaf.parent_id.as_deref(), Some("10"));
        assert_eq!(leaf.url.as_deref(), Some("https://x"));
    }
}

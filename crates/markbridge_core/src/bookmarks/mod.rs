//! Bookmark store capability.
//!
//! The bookmark tree is owned by the host (a browser profile, an
//! exported file, a test fixture); the core observes it through this
//! trait. Mutations performed here fire the same observer events as
//! mutations performed by the user, which is exactly why the suppression
//! engine exists: the inbound applier's own writes come back through the
//! observer and must be recognized as echoes.

mod memory;

pub use memory::MemoryBookmarkStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised by a bookmark store backend.
#[derive(Debug, Error)]
pub enum BookmarkError {
    /// No node with the given id exists.
    #[error("no such bookmark node: {id}")]
    NotFound {
        /// The missing node id.
        id: String,
    },
    /// The operation was structurally invalid (bad parent, cycle, ...).
    #[error("invalid bookmark operation: {0}")]
    Invalid(String),
}

/// Result alias for bookmark store operations.
pub type BookmarkResult<T> = Result<T, BookmarkError>;

/// One node in the bookmark tree. A node without a `url` is a folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkNode {
    /// Store-assigned node id.
    pub id: String,
    /// Parent folder id; `None` only for the tree root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Position among the parent's children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Display title.
    pub title: String,
    /// Link target; absent for folders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl BookmarkNode {
    /// Whether this node is a folder.
    pub fn is_folder(&self) -> bool {
        self.url.is_none()
    }
}

/// Fields for creating a node.
#[derive(Debug, Clone)]
pub struct CreateDetails {
    /// Folder to create under.
    pub parent_id: String,
    /// Display title.
    pub title: String,
    /// Link target; `None` creates a folder.
    pub url: Option<String>,
}

/// Fields for updating a node in place.
#[derive(Debug, Clone, Default)]
pub struct UpdateDetails {
    /// New title, if changing.
    pub title: Option<String>,
    /// New url, if changing.
    pub url: Option<String>,
}

/// Fields for moving a node.
#[derive(Debug, Clone)]
pub struct MoveDetails {
    /// Destination folder id.
    pub parent_id: String,
    /// Destination position; append when absent.
    pub index: Option<u32>,
}

/// Observer events emitted by a bookmark store.
#[derive(Debug, Clone)]
pub enum BookmarkEvent {
    /// A node was created.
    Created {
        /// The node as created.
        node: BookmarkNode,
    },
    /// A node's title or url changed.
    Changed {
        /// The changed node id.
        id: String,
        /// Title after the change.
        title: String,
        /// Url after the change (links only).
        url: Option<String>,
    },
    /// A node was removed.
    Removed {
        /// The removed node id.
        id: String,
        /// The node as it was before removal.
        node: BookmarkNode,
    },
    /// A node moved to a (possibly identical) parent.
    Moved {
        /// The moved node id.
        id: String,
        /// Parent after the move.
        parent_id: String,
        /// Parent before the move.
        old_parent_id: String,
        /// Position after the move.
        index: u32,
    },
    /// A bulk import started; capture pauses until it ends.
    ImportBegan,
    /// The bulk import finished.
    ImportEnded,
}

/// Callback type for bookmark observer registration.
pub type BookmarkObserver = std::sync::Arc<dyn Fn(BookmarkEvent) + Send + Sync>;

/// Async capability over a bookmark tree.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    /// Register the observer callback. Replaces any previous one.
    fn set_observer(&self, observer: BookmarkObserver);

    /// Remove the observer callback.
    fn clear_observer(&self);

    /// Fetch a single node.
    async fn get(&self, id: &str) -> BookmarkResult<BookmarkNode>;

    /// Fetch a folder's children in order.
    async fn get_children(&self, parent_id: &str) -> BookmarkResult<Vec<BookmarkNode>>;

    /// Fetch every node in the tree (preorder).
    async fn get_tree(&self) -> BookmarkResult<Vec<BookmarkNode>>;

    /// Create a node and return it.
    async fn create(&self, details: CreateDetails) -> BookmarkResult<BookmarkNode>;

    /// Update a node's title/url and return the result.
    async fn update(&self, id: &str, details: UpdateDetails) -> BookmarkResult<BookmarkNode>;

    /// Move a node and return it.
    async fn move_node(&self, id: &str, details: MoveDetails) -> BookmarkResult<BookmarkNode>;

    /// Remove a leaf node (or an empty folder).
    async fn remove(&self, id: &str) -> BookmarkResult<()>;

    /// Remove a folder and everything below it.
    async fn remove_tree(&self, id: &str) -> BookmarkResult<()>;
}

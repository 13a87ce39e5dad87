//! The store adapter: a typed facade over a hierarchical, watch-capable
//! metadata store.
//!
//! The [`Store`] trait is the seam to the backing service. Watches are
//! one-shot: at most one is outstanding per `(session, path, class)`, where
//! the class is *node* (armed by [`Store::exists`] / [`Store::get_data`]) or
//! *child* (armed by [`Store::get_children`]). When a watched mutation
//! happens the store delivers one [`StoreEvent`] on the session's channel
//! and forgets the watch; re-arming is the reader's job.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and by
//! embedders that do not need cross-process coordination.

mod memory;
pub use memory::MemoryStore;

use std::sync::mpsc;

pub type SessionId = u64;

/// Version argument accepted by any expected version.
pub const ANY_VERSION: i32 = -1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// A typed store event, delivered on the channel a session attached with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created { path: String },
    Deleted { path: String },
    DataChanged { path: String },
    ChildrenChanged { path: String },
    /// Barrier marker: everything the session observed before `sync` was
    /// called has already been delivered ahead of this event.
    SyncMarker { id: u64, path: String },
    /// The session is gone; every ephemeral it owned has been deleted and
    /// no further call on it will succeed.
    SessionExpired,
}

impl StoreEvent {
    pub fn path(&self) -> Option<&str> {
        match self {
            StoreEvent::Created { path }
            | StoreEvent::Deleted { path }
            | StoreEvent::DataChanged { path }
            | StoreEvent::ChildrenChanged { path }
            | StoreEvent::SyncMarker { path, .. } => Some(path),
            StoreEvent::SessionExpired => None,
        }
    }
}

pub trait Store: Send + Sync {
    /// Open a session; events for its watches arrive on `events`.
    fn attach(&self, events: mpsc::Sender<StoreEvent>) -> SessionId;

    /// Close a session, deleting its ephemerals without delivering
    /// `SessionExpired` to it.
    fn close(&self, session: SessionId);

    /// Create a node. For sequential modes the final path carries a
    /// store-assigned 10-digit suffix; the created path is returned.
    fn create(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> crate::Result<String>;

    /// Delete a node. Fails `NotEmpty` when children exist and
    /// `PublishVersion` when `expected_version` (if not [`ANY_VERSION`])
    /// does not match.
    fn delete(&self, session: SessionId, path: &str, expected_version: i32) -> crate::Result<()>;

    fn exists(&self, session: SessionId, path: &str, watch: bool) -> crate::Result<bool>;

    fn get_data(
        &self,
        session: SessionId,
        path: &str,
        watch: bool,
    ) -> crate::Result<(Vec<u8>, i32)>;

    /// Versioned write; returns the new version.
    fn set_data(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        expected_version: i32,
    ) -> crate::Result<i32>;

    /// Child names (not paths), in ascending order.
    fn get_children(
        &self,
        session: SessionId,
        path: &str,
        watch: bool,
    ) -> crate::Result<Vec<String>>;

    /// Enqueue a [`StoreEvent::SyncMarker`] carrying the caller-chosen
    /// `marker` behind every event already owed to this session.
    fn sync(&self, session: SessionId, path: &str, marker: u64) -> crate::Result<()>;
}

/// Parent path of `path`, or `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        if path.len() > 1 {
            Some("/")
        } else {
            None
        }
    } else {
        Some(&path[..idx])
    }
}

/// Final component of `path`.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

//! In-process implementation of the store contract.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::mpsc;
use std::sync::Mutex;

use super::{base_name, parent_path, CreateMode, SessionId, Store, StoreEvent, ANY_VERSION};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct ZNode {
    data: Vec<u8>,
    version: i32,
    children: BTreeSet<String>,
    ephemeral_owner: Option<SessionId>,
    /// Counter stamped onto sequential children of this node.
    next_sequence: u64,
}

struct Session {
    tx: mpsc::Sender<StoreEvent>,
    node_watches: HashSet<String>,
    child_watches: HashSet<String>,
    expired: bool,
}

/// A complete in-memory store: hierarchy, versions, ephemerals, sequential
/// names, one-shot watches and session expiry. Multiple factories attach to
/// one `MemoryStore` to coordinate as if across processes.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

struct Inner {
    nodes: HashMap<String, ZNode>,
    sessions: HashMap<SessionId, Session>,
    next_session: SessionId,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), ZNode::default());
        Self {
            inner: Mutex::new(Inner {
                nodes,
                sessions: HashMap::new(),
                next_session: 1,
            }),
        }
    }

    /// Expire a session as the backing service would on connection loss:
    /// its ephemerals are deleted (waking other sessions' watches) and the
    /// session receives [`StoreEvent::SessionExpired`].
    pub fn expire(&self, session: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        inner.expire_session(session, true);
    }
}

impl Inner {
    fn session(&mut self, id: SessionId) -> Result<&mut Session> {
        match self.sessions.get_mut(&id) {
            Some(s) if !s.expired => Ok(s),
            _ => Err(Error::SessionExpired),
        }
    }

    fn expire_session(&mut self, id: SessionId, notify: bool) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.expired = true;
        let tx = session.tx.clone();

        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(id))
            .map(|(p, _)| p.clone())
            .collect();
        for path in ephemerals {
            // Ephemerals have no children; unconditional removal is safe.
            self.remove_node(&path);
        }

        if notify {
            let _ = tx.send(StoreEvent::SessionExpired);
        }
        self.sessions.remove(&id);
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        if let Some(parent) = parent_path(path) {
            let name = base_name(path).to_string();
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.remove(&name);
            }
            self.fire_child(parent);
        }
        self.fire_node(path, StoreEvent::Deleted { path: path.to_string() });
        // Child watchers of the node itself learn of its deletion too.
        let watchers = self.take_child_watchers(path);
        for tx in watchers {
            let _ = tx.send(StoreEvent::Deleted { path: path.to_string() });
        }
    }

    fn take_node_watchers(&mut self, path: &str) -> Vec<mpsc::Sender<StoreEvent>> {
        self.sessions
            .values_mut()
            .filter_map(|s| (!s.expired && s.node_watches.remove(path)).then(|| s.tx.clone()))
            .collect()
    }

    fn take_child_watchers(&mut self, path: &str) -> Vec<mpsc::Sender<StoreEvent>> {
        self.sessions
            .values_mut()
            .filter_map(|s| (!s.expired && s.child_watches.remove(path)).then(|| s.tx.clone()))
            .collect()
    }

    fn fire_node(&mut self, path: &str, event: StoreEvent) {
        for tx in self.take_node_watchers(path) {
            let _ = tx.send(event.clone());
        }
    }

    fn fire_child(&mut self, path: &str) {
        let event = StoreEvent::ChildrenChanged { path: path.to_string() };
        for tx in self.take_child_watchers(path) {
            let _ = tx.send(event.clone());
        }
    }
}

impl Store for MemoryStore {
    fn attach(&self, events: mpsc::Sender<StoreEvent>) -> SessionId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_session;
        inner.next_session += 1;
        inner.sessions.insert(
            id,
            Session {
                tx: events,
                node_watches: HashSet::new(),
                child_watches: HashSet::new(),
                expired: false,
            },
        );
        tracing::debug!(session = id, "store session attached");
        id
    }

    fn close(&self, session: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        inner.expire_session(session, false);
        tracing::debug!(session, "store session closed");
    }

    fn create(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        if !path.starts_with('/') || path.ends_with('/') {
            return Err(Error::InvalidArguments(format!("bad store path '{path}'")));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.session(session)?;

        let parent = parent_path(path)
            .ok_or_else(|| Error::InvalidArguments("cannot create the root".into()))?
            .to_string();

        let final_path = {
            let parent_node = inner
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| Error::NoParent(path.to_string()))?;
            if parent_node.ephemeral_owner.is_some() {
                return Err(Error::InvalidArguments(format!(
                    "ephemeral node '{parent}' cannot have children"
                )));
            }
            if mode.is_sequential() {
                let seq = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                format!("{path}{seq:010}")
            } else {
                path.to_string()
            }
        };

        if inner.nodes.contains_key(&final_path) {
            return Err(Error::NodeExists(final_path));
        }

        let name = base_name(&final_path).to_string();
        inner
            .nodes
            .get_mut(&parent)
            .expect("parent checked above")
            .children
            .insert(name);
        inner.nodes.insert(
            final_path.clone(),
            ZNode {
                data: data.to_vec(),
                version: 0,
                children: BTreeSet::new(),
                ephemeral_owner: mode.is_ephemeral().then_some(session),
                next_sequence: 0,
            },
        );

        inner.fire_node(&final_path, StoreEvent::Created { path: final_path.clone() });
        inner.fire_child(&parent);
        tracing::trace!(path = %final_path, ?mode, "store node created");
        Ok(final_path)
    }

    fn delete(&self, session: SessionId, path: &str, expected_version: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.session(session)?;

        let node = inner
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if !node.children.is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }
        if expected_version != ANY_VERSION && node.version != expected_version {
            return Err(Error::PublishVersion {
                path: path.to_string(),
                expected: expected_version,
                actual: node.version,
            });
        }
        inner.remove_node(path);
        tracing::trace!(%path, "store node deleted");
        Ok(())
    }

    fn exists(&self, session: SessionId, path: &str, watch: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let found = inner.nodes.contains_key(path);
        let s = inner.session(session)?;
        if watch {
            s.node_watches.insert(path.to_string());
        }
        Ok(found)
    }

    fn get_data(&self, session: SessionId, path: &str, watch: bool) -> Result<(Vec<u8>, i32)> {
        let mut inner = self.inner.lock().unwrap();
        let (data, version) = match inner.nodes.get(path) {
            Some(n) => (n.data.clone(), n.version),
            None => return Err(Error::NoNode(path.to_string())),
        };
        let s = inner.session(session)?;
        if watch {
            s.node_watches.insert(path.to_string());
        }
        Ok((data, version))
    }

    fn set_data(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        expected_version: i32,
    ) -> Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        inner.session(session)?;

        let node = inner
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if expected_version != ANY_VERSION && node.version != expected_version {
            return Err(Error::PublishVersion {
                path: path.to_string(),
                expected: expected_version,
                actual: node.version,
            });
        }
        node.data = data.to_vec();
        node.version += 1;
        let version = node.version;

        inner.fire_node(path, StoreEvent::DataChanged { path: path.to_string() });
        tracing::trace!(%path, version, "store node written");
        Ok(version)
    }

    fn get_children(&self, session: SessionId, path: &str, watch: bool) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let children: Vec<String> = match inner.nodes.get(path) {
            Some(n) => n.children.iter().cloned().collect(),
            None => return Err(Error::NoNode(path.to_string())),
        };
        let s = inner.session(session)?;
        if watch {
            s.child_watches.insert(path.to_string());
        }
        Ok(children)
    }

    fn sync(&self, session: SessionId, path: &str, marker: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let s = inner.session(session)?;
        // The session channel is FIFO: this marker lands after every event
        // already delivered, which is exactly the barrier contract.
        let _ = s.tx.send(StoreEvent::SyncMarker { id: marker, path: path.to_string() });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn attach(store: &MemoryStore) -> (SessionId, mpsc::Receiver<StoreEvent>) {
        let (tx, rx) = mpsc::channel();
        (store.attach(tx), rx)
    }

    #[test]
    fn create_read_write_delete() {
        let store = MemoryStore::new();
        let (s, _rx) = attach(&store);

        store.create(s, "/a", b"one", CreateMode::Persistent).unwrap();
        assert_eq!(store.get_data(s, "/a", false).unwrap(), (b"one".to_vec(), 0));

        let v = store.set_data(s, "/a", b"two", 0).unwrap();
        assert_eq!(v, 1);
        assert!(matches!(
            store.set_data(s, "/a", b"three", 0),
            Err(Error::PublishVersion { expected: 0, actual: 1, .. })
        ));

        store.delete(s, "/a", 1).unwrap();
        assert!(!store.exists(s, "/a", false).unwrap());
        assert!(matches!(store.get_data(s, "/a", false), Err(Error::NoNode(_))));
    }

    #[test]
    fn create_requires_parent() {
        let store = MemoryStore::new();
        let (s, _rx) = attach(&store);
        assert!(matches!(
            store.create(s, "/missing/child", b"", CreateMode::Persistent),
            Err(Error::NoParent(_))
        ));
    }

    #[test]
    fn delete_requires_empty() {
        let store = MemoryStore::new();
        let (s, _rx) = attach(&store);
        store.create(s, "/a", b"", CreateMode::Persistent).unwrap();
        store.create(s, "/a/b", b"", CreateMode::Persistent).unwrap();
        assert!(matches!(store.delete(s, "/a", ANY_VERSION), Err(Error::NotEmpty(_))));
        store.delete(s, "/a/b", ANY_VERSION).unwrap();
        store.delete(s, "/a", ANY_VERSION).unwrap();
    }

    #[test]
    fn sequential_names_are_ordered_per_parent() {
        let store = MemoryStore::new();
        let (s, _rx) = attach(&store);
        store.create(s, "/q", b"", CreateMode::Persistent).unwrap();

        let p0 = store.create(s, "/q/el", b"0", CreateMode::EphemeralSequential).unwrap();
        let p1 = store.create(s, "/q/el", b"1", CreateMode::EphemeralSequential).unwrap();
        assert_eq!(p0, "/q/el0000000000");
        assert_eq!(p1, "/q/el0000000001");

        let children = store.get_children(s, "/q", false).unwrap();
        assert_eq!(children, vec!["el0000000000", "el0000000001"]);
    }

    #[test]
    fn watches_are_one_shot_and_typed() {
        let store = MemoryStore::new();
        let (s0, _rx0) = attach(&store);
        let (s1, rx1) = attach(&store);

        store.create(s0, "/a", b"", CreateMode::Persistent).unwrap();

        // Node watch observes a data change, once.
        store.get_data(s1, "/a", true).unwrap();
        store.set_data(s0, "/a", b"x", 0).unwrap();
        store.set_data(s0, "/a", b"y", 1).unwrap();
        assert_eq!(
            rx1.try_recv().unwrap(),
            StoreEvent::DataChanged { path: "/a".into() }
        );
        assert!(rx1.try_recv().is_err());

        // Child watch observes a create.
        store.get_children(s1, "/a", true).unwrap();
        store.create(s0, "/a/b", b"", CreateMode::Persistent).unwrap();
        assert_eq!(
            rx1.try_recv().unwrap(),
            StoreEvent::ChildrenChanged { path: "/a".into() }
        );

        // Exists watch observes deletion.
        store.exists(s1, "/a/b", true).unwrap();
        store.delete(s0, "/a/b", ANY_VERSION).unwrap();
        assert_eq!(
            rx1.try_recv().unwrap(),
            StoreEvent::Deleted { path: "/a/b".into() }
        );
    }

    #[test]
    fn expiry_drops_ephemerals_and_notifies() {
        let store = MemoryStore::new();
        let (s0, rx0) = attach(&store);
        let (s1, rx1) = attach(&store);

        store.create(s0, "/locks", b"", CreateMode::Persistent).unwrap();
        let bid = store
            .create(s0, "/locks/me=X", b"", CreateMode::EphemeralSequential)
            .unwrap();
        store.exists(s1, &bid, true).unwrap();

        store.expire(s0);

        assert_eq!(rx0.try_recv().unwrap(), StoreEvent::SessionExpired);
        assert_eq!(rx1.try_recv().unwrap(), StoreEvent::Deleted { path: bid.clone() });
        assert!(matches!(store.get_data(s1, &bid, false), Err(Error::NoNode(_))));
        assert!(matches!(store.sync(s0, "/", 1), Err(Error::SessionExpired)));
    }

    #[test]
    fn sync_marker_arrives_after_prior_events() {
        let store = MemoryStore::new();
        let (s0, _rx0) = attach(&store);
        let (s1, rx1) = attach(&store);

        store.create(s0, "/a", b"", CreateMode::Persistent).unwrap();
        store.get_data(s1, "/a", true).unwrap();
        store.set_data(s0, "/a", b"x", 0).unwrap();
        store.sync(s1, "/a", 42).unwrap();

        assert_eq!(
            rx1.try_recv().unwrap(),
            StoreEvent::DataChanged { path: "/a".into() }
        );
        assert_eq!(
            rx1.try_recv().unwrap(),
            StoreEvent::SyncMarker { id: 42, path: "/a".into() }
        );
    }

    #[test]
    fn ephemerals_cannot_parent() {
        let store = MemoryStore::new();
        let (s, _rx) = attach(&store);
        store.create(s, "/e", b"", CreateMode::Ephemeral).unwrap();
        assert!(matches!(
            store.create(s, "/e/child", b"", CreateMode::Persistent),
            Err(Error::InvalidArguments(_))
        ));
    }
}

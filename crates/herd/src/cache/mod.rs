//! The notifyable cache: a process-local, hierarchical object graph kept
//! coherent with the store by the event pipeline.
//!
//! Each object is a [`Cell`] registered under its canonical key. User code
//! holds [`NotifyableRef`] handles; every handle accounts one reference,
//! and the final release of a removed object reclaims its cache entry. An
//! object transitions `Ready -> Removed` exactly once and is never
//! resurrected: a later re-creation under the same key is a fresh cell.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cached::{
    CachedKeyValues, CachedProcessInfo, CachedSlotUsage, CachedState, JsonRecord, KvData,
};
use crate::events::ChangeKind;
use crate::factory::Ops;
use crate::shards::{CachedShards, ShardsData};
use crate::store::CreateMode;
use crate::{cached, keys, locks, pipeline, AccessMode, Error, LockBid, LockMode, Result};

pub use crate::keys::Kind;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum LifeState {
    Ready,
    Removed,
}

pub(crate) struct CellState {
    pub life: LifeState,
    /// lock name -> owner id -> reentry record.
    pub lock_owners: HashMap<String, HashMap<String, locks::LockOwner>>,
    pub kv: Option<KvData>,
    pub shards: Option<ShardsData>,
    pub records: HashMap<String, JsonRecord>,
    pub connected: bool,
}

impl CellState {
    fn new(kind: Kind) -> Self {
        Self {
            life: LifeState::Ready,
            lock_owners: HashMap::new(),
            kv: (kind == Kind::PropertyList).then(KvData::new),
            shards: (kind == Kind::DataDistribution).then(ShardsData::new),
            records: HashMap::new(),
            connected: false,
        }
    }

    pub fn record_mut(&mut self, token: &str) -> &mut JsonRecord {
        self.records.entry(token.to_string()).or_insert_with(JsonRecord::new)
    }
}

/// One cached object. The `state` mutex is the object's sync lock: short
/// critical sections over cached data, reentry maps and versions.
pub(crate) struct Cell {
    pub key: String,
    pub name: String,
    pub kind: Kind,
    pub parent: Option<Arc<Cell>>,
    pub state: Mutex<CellState>,
    refs: Mutex<i32>,
}

impl Cell {
    fn is_removed(&self) -> bool {
        self.state.lock().unwrap().life == LifeState::Removed
    }
}

/// Shared-ownership registry of cells, keyed by canonical path.
#[derive(Default)]
pub(crate) struct Registry {
    live: Mutex<HashMap<String, Arc<Cell>>>,
    /// Removed cells still referenced by user handles; reclaimed when the
    /// last reference drops.
    removed: Mutex<Vec<Arc<Cell>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<Cell>> {
        self.live.lock().unwrap().get(key).cloned()
    }

    /// Publish a freshly loaded cell; a concurrent load of the same key
    /// wins and the loser is discarded.
    fn publish(&self, cell: Arc<Cell>) -> Arc<Cell> {
        let mut live = self.live.lock().unwrap();
        match live.get(&cell.key) {
            Some(existing) => existing.clone(),
            None => {
                live.insert(cell.key.clone(), cell.clone());
                cell
            }
        }
    }

    fn incr(&self, cell: &Arc<Cell>) {
        let mut refs = cell.refs.lock().unwrap();
        if *refs < 0 || *refs == i32::MAX {
            tracing::error!(key = %cell.key, refs = *refs, "impossible notifyable reference count");
            return;
        }
        *refs += 1;
    }

    fn release(&self, cell: &Arc<Cell>) {
        let reclaim = {
            let mut refs = cell.refs.lock().unwrap();
            if *refs <= 0 {
                tracing::error!(key = %cell.key, "notifyable released more times than acquired");
                false
            } else {
                *refs -= 1;
                *refs == 0 && cell.is_removed()
            }
        };
        if reclaim {
            let mut removed = self.removed.lock().unwrap();
            removed.retain(|c| !Arc::ptr_eq(c, cell));
            tracing::debug!(key = %cell.key, "reclaimed removed notifyable");
        }
    }

    /// Mark `key` and every cached descendant as removed. Returns whether
    /// `key` itself was cached.
    pub fn mark_removed_prefix(&self, key: &str) -> bool {
        let prefix = format!("{key}{}", keys::SEPARATOR);
        let victims: Vec<Arc<Cell>> = {
            let mut live = self.live.lock().unwrap();
            let keys: Vec<String> = live
                .keys()
                .filter(|k| *k == key || k.starts_with(&prefix))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| live.remove(k)).collect()
        };

        let mut found = false;
        for cell in victims {
            found |= cell.key == key;
            let still_referenced = {
                let mut state = cell.state.lock().unwrap();
                state.life = LifeState::Removed;
                drop(state);
                *cell.refs.lock().unwrap() > 0
            };
            if still_referenced {
                self.removed.lock().unwrap().push(cell);
            }
        }
        found
    }
}

/// A counted handle to a cached object. Cloning takes another reference;
/// dropping releases it. Accessors for the typed kinds live here, gated by
/// the object's kind.
pub struct NotifyableRef {
    cell: Arc<Cell>,
    ops: Arc<Ops>,
}

impl NotifyableRef {
    pub(crate) fn new(ops: Arc<Ops>, cell: Arc<Cell>) -> Self {
        ops.registry.incr(&cell);
        Self { cell, ops }
    }

    pub(crate) fn cell(&self) -> &Arc<Cell> {
        &self.cell
    }

    pub(crate) fn ops(&self) -> &Arc<Ops> {
        &self.ops
    }

    pub fn key(&self) -> &str {
        &self.cell.key
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn kind(&self) -> Kind {
        self.cell.kind
    }

    pub fn is_removed(&self) -> bool {
        self.cell.is_removed()
    }

    pub(crate) fn require_ready(&self) -> Result<()> {
        if self.cell.is_removed() {
            Err(Error::ObjectRemoved(self.cell.key.clone()))
        } else {
            Ok(())
        }
    }

    pub fn parent(&self) -> Option<NotifyableRef> {
        self.cell
            .parent
            .clone()
            .map(|cell| NotifyableRef::new(self.ops.clone(), cell))
    }

    /// The nearest enclosing application, if any.
    pub fn my_application(&self) -> Result<Option<Application>> {
        self.require_ready()?;
        let mut key = Some(self.cell.key.clone());
        while let Some(k) = key {
            if keys::is_application_key(&keys::split(&k)) {
                return Ok(Some(Application(notifyable_from_key(&self.ops, &k)?)));
            }
            key = keys::enclosing_object_key(&k);
        }
        Ok(None)
    }

    /// The nearest enclosing group (an application counts), if any.
    pub fn my_group(&self) -> Result<Option<Group>> {
        self.require_ready()?;
        let mut key = keys::enclosing_object_key(&self.cell.key);
        while let Some(k) = key {
            if keys::is_group_key(&keys::split(&k)) {
                return Ok(Some(Group(notifyable_from_key(&self.ops, &k)?)));
            }
            key = keys::enclosing_object_key(&k);
        }
        Ok(None)
    }

    // -- children -----------------------------------------------------------

    /// Every child object discoverable in the cache or the store, arming
    /// the children watches along the way.
    pub fn children(&self) -> Result<Vec<NotifyableRef>> {
        self.require_ready()?;
        let mut out = Vec::new();
        for (child_kind, token, change) in child_containers(self.cell.kind) {
            let container = keys::meta_key(&self.cell.key, token);
            let names = match change {
                Some(change) => match pipeline::arm_and_list(&self.ops, *change, &container)? {
                    Some(names) => names,
                    None => continue,
                },
                None => match self.ops.store.get_children(self.ops.session, &container, false) {
                    Ok(names) => names,
                    Err(Error::NoNode(_)) => continue,
                    Err(e) => return Err(e),
                },
            };
            for name in names {
                match get_child_cell(&self.ops, &self.cell, *child_kind, &name, AccessMode::LoadIfPresent)
                {
                    Ok(nt) => out.push(nt),
                    // Lost a race with a concurrent removal.
                    Err(Error::NoNode(_)) | Err(Error::ObjectRemoved(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(out)
    }

    fn names_of(&self, kind: Kind) -> Result<Vec<String>> {
        self.require_ready()?;
        let (_, token, change) = child_containers(self.cell.kind)
            .iter()
            .find(|(k, _, _)| *k == kind)
            .ok_or_else(|| {
                Error::InvalidMethod(format!("a {} holds no {kind} children", self.cell.kind))
            })?;
        let container = keys::meta_key(&self.cell.key, token);
        let names = match change {
            Some(change) => pipeline::arm_and_list(&self.ops, *change, &container)?,
            None => match self.ops.store.get_children(self.ops.session, &container, false) {
                Ok(names) => Some(names),
                Err(Error::NoNode(_)) => None,
                Err(e) => return Err(e),
            },
        };
        Ok(names.unwrap_or_default())
    }

    pub fn application_names(&self) -> Result<Vec<String>> {
        self.names_of(Kind::Application)
    }

    pub fn group_names(&self) -> Result<Vec<String>> {
        self.names_of(Kind::Group)
    }

    pub fn node_names(&self) -> Result<Vec<String>> {
        self.names_of(Kind::Node)
    }

    pub fn process_slot_names(&self) -> Result<Vec<String>> {
        self.names_of(Kind::ProcessSlot)
    }

    pub fn data_distribution_names(&self) -> Result<Vec<String>> {
        self.names_of(Kind::DataDistribution)
    }

    pub fn property_list_names(&self) -> Result<Vec<String>> {
        self.names_of(Kind::PropertyList)
    }

    pub fn queue_names(&self) -> Result<Vec<String>> {
        self.names_of(Kind::Queue)
    }

    pub fn application(&self, name: &str, mode: AccessMode) -> Result<Application> {
        get_child_cell(&self.ops, &self.cell, Kind::Application, name, mode).map(Application)
    }

    pub fn group(&self, name: &str, mode: AccessMode) -> Result<Group> {
        get_child_cell(&self.ops, &self.cell, Kind::Group, name, mode).map(Group)
    }

    pub fn node(&self, name: &str, mode: AccessMode) -> Result<Node> {
        get_child_cell(&self.ops, &self.cell, Kind::Node, name, mode).map(Node)
    }

    pub fn process_slot(&self, name: &str, mode: AccessMode) -> Result<ProcessSlot> {
        get_child_cell(&self.ops, &self.cell, Kind::ProcessSlot, name, mode).map(ProcessSlot)
    }

    pub fn data_distribution(&self, name: &str, mode: AccessMode) -> Result<DataDistribution> {
        get_child_cell(&self.ops, &self.cell, Kind::DataDistribution, name, mode)
            .map(DataDistribution)
    }

    pub fn property_list(&self, name: &str, mode: AccessMode) -> Result<PropertyList> {
        get_child_cell(&self.ops, &self.cell, Kind::PropertyList, name, mode).map(PropertyList)
    }

    /// The conventionally named default property list.
    pub fn default_property_list(&self, mode: AccessMode) -> Result<PropertyList> {
        self.property_list(keys::DEFAULT_PROPERTY_LIST, mode)
    }

    pub fn queue(&self, name: &str, mode: AccessMode) -> Result<Queue> {
        get_child_cell(&self.ops, &self.cell, Kind::Queue, name, mode).map(Queue)
    }

    // -- distributed locking ------------------------------------------------

    /// Acquire the named distributed lock, waiting as long as it takes.
    pub fn acquire_lock(&self, lock_name: &str, mode: LockMode) -> Result<()> {
        self.require_ready()?;
        locks::acquire(&self.ops, &self.cell, lock_name, mode, None).map(|_| ())
    }

    /// Acquire with a deadline; false when it passed. A partially created
    /// bid is cleaned up.
    pub fn acquire_lock_timeout(
        &self,
        lock_name: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<bool> {
        self.require_ready()?;
        locks::acquire(&self.ops, &self.cell, lock_name, mode, Some(timeout))
    }

    pub fn release_lock(&self, lock_name: &str) -> Result<()> {
        locks::release(&self.ops, &self.cell, lock_name)
    }

    pub fn has_lock(&self, lock_name: &str) -> bool {
        locks::has_lock(&self.ops, &self.cell, lock_name)
    }

    /// Outstanding bids for `lock_name` (all lock names when `None`),
    /// including descendants' bids when `recursive`.
    pub fn lock_bids(&self, lock_name: Option<&str>, recursive: bool) -> Result<Vec<LockBid>> {
        self.require_ready()?;
        let mut out = locks::bids(&self.ops, &self.cell.key, lock_name)?;
        if recursive {
            for child in self.children()? {
                out.extend(child.lock_bids(lock_name, true)?);
            }
        }
        Ok(out)
    }

    // -- leader election ----------------------------------------------------

    /// Block until this thread is the group's leader.
    pub fn become_leader(&self) -> Result<()> {
        self.require_leader_capable()?;
        locks::acquire(&self.ops, &self.cell, keys::LEADER_LOCK, LockMode::Exclusive, None)
            .map(|_| ())
    }

    /// Try to become leader within `timeout`; false when it passed.
    pub fn become_leader_timeout(&self, timeout: Duration) -> Result<bool> {
        self.require_leader_capable()?;
        locks::acquire(
            &self.ops,
            &self.cell,
            keys::LEADER_LOCK,
            LockMode::Exclusive,
            Some(timeout),
        )
    }

    pub fn abdicate_leader(&self) -> Result<()> {
        self.require_leader_capable()?;
        locks::release(&self.ops, &self.cell, keys::LEADER_LOCK)
    }

    pub fn is_leader(&self) -> bool {
        locks::has_lock(&self.ops, &self.cell, keys::LEADER_LOCK)
    }

    fn require_leader_capable(&self) -> Result<()> {
        self.require_ready()?;
        match self.cell.kind {
            Kind::Application | Kind::Group => Ok(()),
            kind => Err(Error::InvalidMethod(format!(
                "leader election runs on groups, not on a {kind}"
            ))),
        }
    }

    // -- removal ------------------------------------------------------------

    /// Remove this object (and, when `recursive`, its whole subtree) from
    /// the repository, under exclusive locks. After the store deletion a
    /// sync barrier guarantees every local observer has seen it.
    pub fn remove(&self, recursive: bool) -> Result<()> {
        self.require_ready()?;
        if self.cell.kind == Kind::Root {
            return Err(Error::InvalidMethod("the root cannot be removed".into()));
        }
        let parent = self
            .cell
            .parent
            .clone()
            .ok_or_else(|| Error::InvalidMethod(format!("'{}' has no parent", self.cell.key)))?;

        locks::acquire(&self.ops, &parent, keys::NOTIFYABLE_LOCK, LockMode::Exclusive, None)?;
        locks::acquire(&self.ops, &self.cell, keys::NOTIFYABLE_LOCK, LockMode::Exclusive, None)
            .map_err(|e| {
                let _ = locks::release(&self.ops, &parent, keys::NOTIFYABLE_LOCK);
                e
            })?;

        let mut locked: Vec<NotifyableRef> = Vec::new();
        let result = self.remove_locked(recursive, &mut locked);

        // Our own bids vanished with the subtree; release tolerates that.
        for nt in locked.iter().rev() {
            if let Err(e) = locks::release(&self.ops, nt.cell(), keys::NOTIFYABLE_LOCK) {
                tracing::debug!(key = %nt.key(), error = %e, "releasing lock on removed child");
            }
        }
        if let Err(e) = locks::release(&self.ops, &self.cell, keys::NOTIFYABLE_LOCK) {
            tracing::debug!(key = %self.cell.key, error = %e, "releasing lock on removed object");
        }
        locks::release(&self.ops, &parent, keys::NOTIFYABLE_LOCK)?;

        result?;
        self.ops.synchronize()
    }

    fn remove_locked(&self, recursive: bool, locked: &mut Vec<NotifyableRef>) -> Result<()> {
        // Walk breadth-first, locking each child strictly after its parent.
        let mut frontier: Vec<NotifyableRef> =
            vec![NotifyableRef::new(self.ops.clone(), self.cell.clone())];
        let mut index = 0;
        while index < frontier.len() {
            let children = frontier[index].children()?;
            if !recursive && index == 0 && !children.is_empty() {
                return Err(Error::InvalidMethod(format!(
                    "'{}' has children; remove(recursive) is required",
                    self.cell.key
                )));
            }
            for child in children {
                locks::acquire(
                    &self.ops,
                    child.cell(),
                    keys::NOTIFYABLE_LOCK,
                    LockMode::Exclusive,
                    None,
                )?;
                locked.push(child.clone());
                frontier.push(child);
            }
            index += 1;
        }

        // Deepest first, so a child's removal precedes its parent's.
        for nt in frontier.iter().rev() {
            self.ops.registry.mark_removed_prefix(nt.key());
            tracing::debug!(key = %nt.key(), "removed from cache");
        }
        delete_subtree(&self.ops, &self.cell.key)
    }

    // -- typed accessors ----------------------------------------------------

    fn cast<T>(&self, kind: Kind, wrap: impl FnOnce(NotifyableRef) -> T) -> Result<T> {
        if self.cell.kind == kind {
            Ok(wrap(self.clone()))
        } else {
            Err(Error::InvalidMethod(format!(
                "'{}' is a {}, not a {kind}",
                self.cell.key, self.cell.kind
            )))
        }
    }

    pub fn as_root(&self) -> Result<Root> {
        self.cast(Kind::Root, Root)
    }

    pub fn as_application(&self) -> Result<Application> {
        self.cast(Kind::Application, Application)
    }

    pub fn as_group(&self) -> Result<Group> {
        self.cast(Kind::Group, Group)
    }

    pub fn as_node(&self) -> Result<Node> {
        self.cast(Kind::Node, Node)
    }

    pub fn as_process_slot(&self) -> Result<ProcessSlot> {
        self.cast(Kind::ProcessSlot, ProcessSlot)
    }

    pub fn as_data_distribution(&self) -> Result<DataDistribution> {
        self.cast(Kind::DataDistribution, DataDistribution)
    }

    pub fn as_property_list(&self) -> Result<PropertyList> {
        self.cast(Kind::PropertyList, PropertyList)
    }

    pub fn as_queue(&self) -> Result<Queue> {
        self.cast(Kind::Queue, Queue)
    }
}

impl Clone for NotifyableRef {
    fn clone(&self) -> Self {
        NotifyableRef::new(self.ops.clone(), self.cell.clone())
    }
}

impl Drop for NotifyableRef {
    fn drop(&mut self) {
        self.ops.registry.release(&self.cell);
    }
}

impl PartialEq for NotifyableRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl std::fmt::Debug for NotifyableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifyable")
            .field("key", &self.cell.key)
            .field("kind", &self.cell.kind)
            .finish()
    }
}

macro_rules! typed_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name(pub(crate) NotifyableRef);

        impl std::ops::Deref for $name {
            type Target = NotifyableRef;
            fn deref(&self) -> &NotifyableRef {
                &self.0
            }
        }

        impl From<$name> for NotifyableRef {
            fn from(value: $name) -> NotifyableRef {
                value.0
            }
        }

        impl AsRef<NotifyableRef> for $name {
            fn as_ref(&self) -> &NotifyableRef {
                &self.0
            }
        }
    };
}

typed_handle!(
    /// The namespace root; parent of applications.
    Root
);
typed_handle!(
    /// A deployed application; behaves as a group for containment.
    Application
);
typed_handle!(
    /// A group of nodes and nested groups.
    Group
);
typed_handle!(
    /// A machine-level member of a group.
    Node
);
typed_handle!(
    /// One managed process slot of a node.
    ProcessSlot
);
typed_handle!(
    /// A shard set routing hash ranges to nodes or process slots.
    DataDistribution
);
typed_handle!(
    /// A versioned key/value map.
    PropertyList
);
typed_handle!(
    /// A FIFO queue of byte payloads.
    Queue
);

impl Node {
    /// The node's reported (current) state record.
    pub fn cached_current_state(&self) -> CachedState<'_> {
        CachedState {
            nt: &self.0,
            token: keys::CLIENT_STATE,
        }
    }

    /// The state some master set for this node (its desired state).
    pub fn cached_desired_state(&self) -> CachedState<'_> {
        CachedState {
            nt: &self.0,
            token: keys::MASTER_SET_STATE,
        }
    }

    pub fn cached_slot_usage(&self) -> CachedSlotUsage<'_> {
        CachedSlotUsage { nt: &self.0 }
    }

    /// Whether some client currently announces a connection for this node.
    pub fn is_connected(&self) -> Result<bool> {
        self.require_ready()?;
        Ok(self.cell().state.lock().unwrap().connected)
    }

    /// Announce this client as the node's connected owner by creating the
    /// connection ephemeral.
    pub fn announce_connected(&self) -> Result<()> {
        self.require_ready()?;
        let ops = self.ops();
        let path = keys::meta_key(self.key(), keys::CONNECTED);
        match ops.store.create(ops.session, &path, b"", CreateMode::Ephemeral) {
            Ok(_) => {
                self.cell().state.lock().unwrap().connected = true;
                Ok(())
            }
            Err(Error::NodeExists(_)) => Err(Error::InvalidMethod(format!(
                "node '{}' already has a connected owner",
                self.key()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Withdraw this client's connection announcement.
    pub fn retire_connected(&self) -> Result<()> {
        self.require_ready()?;
        let ops = self.ops();
        let path = keys::meta_key(self.key(), keys::CONNECTED);
        match ops.store.delete(ops.session, &path, crate::store::ANY_VERSION) {
            Ok(()) | Err(Error::NoNode(_)) => {
                self.cell().state.lock().unwrap().connected = false;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl ProcessSlot {
    pub fn cached_process_info(&self) -> CachedProcessInfo<'_> {
        CachedProcessInfo { nt: &self.0 }
    }

    pub fn cached_current_state(&self) -> CachedState<'_> {
        CachedState {
            nt: &self.0,
            token: keys::PROCESS_SLOT_CURRENT_STATE,
        }
    }

    pub fn cached_desired_state(&self) -> CachedState<'_> {
        CachedState {
            nt: &self.0,
            token: keys::PROCESS_SLOT_DESIRED_STATE,
        }
    }
}

impl DataDistribution {
    pub fn cached_shards(&self) -> CachedShards<'_> {
        CachedShards { nt: &self.0 }
    }
}

impl PropertyList {
    pub fn cached_key_values(&self) -> CachedKeyValues<'_> {
        CachedKeyValues { nt: &self.0 }
    }
}

impl Queue {
    fn elements_key(&self) -> String {
        keys::meta_key(self.key(), keys::ELEMENTS)
    }

    /// Append a payload to the queue.
    pub fn put(&self, data: &[u8]) -> Result<()> {
        self.require_ready()?;
        let ops = self.ops();
        let prefix = format!("{}{}el", self.elements_key(), keys::SEPARATOR);
        match ops
            .store
            .create(ops.session, &prefix, data, CreateMode::EphemeralSequential)
        {
            Ok(_) => Ok(()),
            Err(Error::NoParent(_)) => Err(Error::ObjectRemoved(self.key().to_string())),
            Err(e) => Err(e),
        }
    }

    /// Pop the head element, blocking until one is available.
    pub fn take(&self) -> Result<Vec<u8>> {
        match self.take_inner(None)? {
            Some(data) => Ok(data),
            None => Err(Error::InconsistentInternalState(
                "unbounded queue take returned empty".into(),
            )),
        }
    }

    /// Pop the head element, waiting at most `timeout`; `None` on expiry.
    pub fn take_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.take_inner(Some(timeout))
    }

    fn take_inner(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        let ops = self.ops();
        let dir = self.elements_key();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);

        loop {
            self.require_ready()?;
            if ops.is_shutdown() {
                return Err(Error::OperationCancelled);
            }

            let signal = ops.signals.add_ref(&dir);
            let seen = signal.epoch();
            let children = match pipeline::arm_and_list(ops, ChangeKind::QueueChildren, &dir)? {
                Some(children) => children,
                None => {
                    ops.signals.remove_ref(&dir);
                    return Err(Error::ObjectRemoved(self.key().to_string()));
                }
            };

            if let Some(head) = children.first() {
                ops.signals.remove_ref(&dir);
                let path = format!("{dir}{}{head}", keys::SEPARATOR);
                let data = match ops.store.get_data(ops.session, &path, false) {
                    Ok((data, _)) => data,
                    // Another taker beat us to it.
                    Err(Error::NoNode(_)) => continue,
                    Err(e) => return Err(e),
                };
                match ops.store.delete(ops.session, &path, crate::store::ANY_VERSION) {
                    Ok(()) => return Ok(Some(data)),
                    Err(Error::NoNode(_)) => continue,
                    Err(e) => return Err(e),
                }
            }

            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        ops.signals.remove_ref(&dir);
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
            };
            let outcome = signal.wait_change(seen, remaining);
            ops.signals.remove_ref(&dir);
            match outcome {
                crate::signal::Wait::Signalled => continue,
                crate::signal::Wait::TimedOut => return Ok(None),
                crate::signal::Wait::Cancelled => return Err(Error::OperationCancelled),
            }
        }
    }

    pub fn size(&self) -> Result<usize> {
        self.require_ready()?;
        let ops = self.ops();
        match ops.store.get_children(ops.session, &self.elements_key(), false) {
            Ok(children) => Ok(children.len()),
            Err(Error::NoNode(_)) => Err(Error::ObjectRemoved(self.key().to_string())),
            Err(e) => Err(e),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Drop every queued element.
    pub fn clear(&self) -> Result<()> {
        self.require_ready()?;
        let ops = self.ops();
        let dir = self.elements_key();
        let children = match ops.store.get_children(ops.session, &dir, false) {
            Ok(children) => children,
            Err(Error::NoNode(_)) => return Err(Error::ObjectRemoved(self.key().to_string())),
            Err(e) => return Err(e),
        };
        for child in children {
            let path = format!("{dir}{}{child}", keys::SEPARATOR);
            match ops.store.delete(ops.session, &path, crate::store::ANY_VERSION) {
                Ok(()) | Err(Error::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// -- loading and creation ---------------------------------------------------

/// Containers legal under each kind: `(child kind, container token,
/// change kind arming its children watch)`.
fn child_containers(kind: Kind) -> &'static [(Kind, &'static str, Option<ChangeKind>)] {
    use Kind::*;
    match kind {
        Root => &[
            (Application, keys::APPLICATIONS, Some(ChangeKind::Applications)),
            (DataDistribution, keys::DISTRIBUTIONS, Some(ChangeKind::DataDistributions)),
            (PropertyList, keys::PROPERTY_LIST, Some(ChangeKind::PropertyLists)),
            (Queue, keys::QUEUES, None),
        ],
        Application | Group => &[
            (Group, keys::GROUPS, Some(ChangeKind::Groups)),
            (Node, keys::NODES, Some(ChangeKind::Nodes)),
            (DataDistribution, keys::DISTRIBUTIONS, Some(ChangeKind::DataDistributions)),
            (PropertyList, keys::PROPERTY_LIST, Some(ChangeKind::PropertyLists)),
            (Queue, keys::QUEUES, None),
        ],
        Node => &[
            (ProcessSlot, keys::PROCESS_SLOTS, Some(ChangeKind::ProcessSlots)),
            (DataDistribution, keys::DISTRIBUTIONS, Some(ChangeKind::DataDistributions)),
            (PropertyList, keys::PROPERTY_LIST, Some(ChangeKind::PropertyLists)),
            (Queue, keys::QUEUES, None),
        ],
        ProcessSlot => &[
            (DataDistribution, keys::DISTRIBUTIONS, Some(ChangeKind::DataDistributions)),
            (PropertyList, keys::PROPERTY_LIST, Some(ChangeKind::PropertyLists)),
            (Queue, keys::QUEUES, None),
        ],
        DataDistribution | PropertyList | Queue => &[],
    }
}

/// Data children written into a fresh object's store skeleton.
fn meta_children(kind: Kind) -> Vec<&'static str> {
    use Kind::*;
    let mut tokens: Vec<&'static str> = child_containers(kind)
        .iter()
        .map(|(_, token, _)| *token)
        .collect();
    tokens.push(keys::LOCKS);
    match kind {
        Node => tokens.extend([
            keys::CLIENT_STATE,
            keys::MASTER_SET_STATE,
            keys::PROCESS_SLOTS_USAGE,
            keys::PROCESS_SLOTS_MAX,
        ]),
        ProcessSlot => tokens.extend([
            keys::PROCESS_SLOT_PORT_VEC,
            keys::PROCESS_SLOT_EXEC_ARGS,
            keys::PROCESS_SLOT_RUNNING_EXEC_ARGS,
            keys::PROCESS_SLOT_PID,
            keys::PROCESS_SLOT_DESIRED_STATE,
            keys::PROCESS_SLOT_CURRENT_STATE,
            keys::PROCESS_SLOT_RESERVATION,
        ]),
        DataDistribution => tokens.push(keys::SHARDS),
        Queue => tokens.push(keys::ELEMENTS),
        _ => {}
    }
    tokens
}

fn assert_can_parent(parent: Kind, child: Kind) -> Result<()> {
    use Kind::*;
    let legal = match child {
        Root => false,
        Application => parent == Root,
        Group => matches!(parent, Application | Group),
        Node => matches!(parent, Application | Group),
        ProcessSlot => parent == Node,
        DataDistribution | PropertyList | Queue => {
            matches!(parent, Root | Application | Group | Node | ProcessSlot)
        }
    };
    if legal {
        Ok(())
    } else {
        Err(Error::InvalidMethod(format!("a {parent} cannot hold a {child}")))
    }
}

fn create_tolerating_exists(ops: &Ops, path: &str) -> Result<()> {
    match ops.store.create(ops.session, path, b"", CreateMode::Persistent) {
        Ok(_) | Err(Error::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Fetch or create the child `name` of `parent`.
pub(crate) fn get_child_cell(
    ops: &Arc<Ops>,
    parent: &Arc<Cell>,
    kind: Kind,
    name: &str,
    mode: AccessMode,
) -> Result<NotifyableRef> {
    if parent.is_removed() {
        return Err(Error::ObjectRemoved(parent.key.clone()));
    }
    assert_can_parent(parent.kind, kind)?;
    let default_plist = kind == Kind::PropertyList && name == keys::DEFAULT_PROPERTY_LIST;
    if !keys::is_valid_name(name) && !default_plist {
        return Err(Error::InvalidArguments(format!("illegal object name '{name}'")));
    }

    let key = keys::child_key(&parent.key, kind, name);
    if let Some(cell) = ops.registry.lookup(&key) {
        return Ok(NotifyableRef::new(ops.clone(), cell));
    }

    let exists = pipeline::arm_exists(ops, ChangeKind::NotifyableState, &key)?;
    if !exists {
        match mode {
            AccessMode::LoadIfPresent => return Err(Error::NoNode(key)),
            AccessMode::CreateIfMissing => {
                // Structural creation is serialised by the parent's lock and
                // idempotent under retry.
                locks::acquire(ops, parent, keys::NOTIFYABLE_LOCK, LockMode::Exclusive, None)?;
                let created = (|| {
                    create_tolerating_exists(ops, &key)?;
                    for token in meta_children(kind) {
                        create_tolerating_exists(ops, &keys::meta_key(&key, token))?;
                    }
                    Ok(())
                })();
                locks::release(ops, parent, keys::NOTIFYABLE_LOCK)?;
                created?;
                tracing::debug!(%key, %kind, "created repository entries");
            }
        }
    }

    load_cell(ops, Some(parent.clone()), kind, name, &key)
}

fn load_cell(
    ops: &Arc<Ops>,
    parent: Option<Arc<Cell>>,
    kind: Kind,
    name: &str,
    key: &str,
) -> Result<NotifyableRef> {
    let cell = Arc::new(Cell {
        key: key.to_string(),
        name: name.to_string(),
        kind,
        parent,
        state: Mutex::new(CellState::new(kind)),
        refs: Mutex::new(0),
    });
    initialize(ops, &cell)?;
    let cell = ops.registry.publish(cell);
    Ok(NotifyableRef::new(ops.clone(), cell))
}

/// Eagerly load an object's cached data, arming its watches.
fn initialize(ops: &Arc<Ops>, cell: &Arc<Cell>) -> Result<()> {
    match cell.kind {
        Kind::PropertyList => {
            if let Some((data, version)) =
                pipeline::arm_and_read(ops, ChangeKind::PropertyListValues, &cell.key)?
            {
                let map = cached::parse_key_values(&data)?;
                let mut state = cell.state.lock().unwrap();
                if let Some(kv) = state.kv.as_mut() {
                    kv.map = map;
                    kv.version = version;
                }
            }
        }
        Kind::DataDistribution => {
            let path = keys::meta_key(&cell.key, keys::SHARDS);
            if let Some((data, version)) = pipeline::arm_and_read(ops, ChangeKind::Shards, &path)? {
                let text = String::from_utf8_lossy(&data).to_string();
                let mut state = cell.state.lock().unwrap();
                if let Some(shards) = state.shards.as_mut() {
                    shards.unmarshal(&text)?;
                    shards.version = version;
                }
            }
        }
        Kind::Node => {
            for (token, change) in [
                (keys::CLIENT_STATE, ChangeKind::NodeClientState),
                (keys::MASTER_SET_STATE, ChangeKind::NodeMasterSetState),
                (keys::PROCESS_SLOTS_USAGE, ChangeKind::ProcessSlotsUsage),
                (keys::PROCESS_SLOTS_MAX, ChangeKind::ProcessSlotsUsage),
            ] {
                load_record(ops, cell, token, change)?;
            }
            let connected_path = keys::meta_key(&cell.key, keys::CONNECTED);
            let connected =
                pipeline::arm_exists(ops, ChangeKind::NodeConnection, &connected_path)?;
            cell.state.lock().unwrap().connected = connected;
        }
        Kind::ProcessSlot => {
            for (token, change) in [
                (keys::PROCESS_SLOT_PORT_VEC, ChangeKind::ProcessSlotPortVec),
                (keys::PROCESS_SLOT_EXEC_ARGS, ChangeKind::ProcessSlotExecArgs),
                (
                    keys::PROCESS_SLOT_RUNNING_EXEC_ARGS,
                    ChangeKind::ProcessSlotRunningExecArgs,
                ),
                (keys::PROCESS_SLOT_PID, ChangeKind::ProcessSlotPid),
                (
                    keys::PROCESS_SLOT_DESIRED_STATE,
                    ChangeKind::ProcessSlotDesiredState,
                ),
                (
                    keys::PROCESS_SLOT_CURRENT_STATE,
                    ChangeKind::ProcessSlotCurrentState,
                ),
                (
                    keys::PROCESS_SLOT_RESERVATION,
                    ChangeKind::ProcessSlotReservation,
                ),
            ] {
                load_record(ops, cell, token, change)?;
            }
        }
        Kind::Queue => {
            // Keep the element watch armed so takers and handlers wake.
            let path = keys::meta_key(&cell.key, keys::ELEMENTS);
            pipeline::arm_and_list(ops, ChangeKind::QueueChildren, &path)?;
        }
        Kind::Root | Kind::Application | Kind::Group => {}
    }
    Ok(())
}

fn load_record(
    ops: &Arc<Ops>,
    cell: &Arc<Cell>,
    token: &'static str,
    change: ChangeKind,
) -> Result<()> {
    let path = keys::meta_key(&cell.key, token);
    if let Some((data, version)) = pipeline::arm_and_read(ops, change, &path)? {
        let value = cached::parse_json(&data)?;
        let mut state = cell.state.lock().unwrap();
        let record = state.record_mut(token);
        record.value = value;
        record.version = version;
    }
    Ok(())
}

/// The root handle, creating its repository entries on first use.
pub(crate) fn root(ops: &Arc<Ops>) -> Result<Root> {
    let key = keys::root_key();
    if let Some(cell) = ops.registry.lookup(&key) {
        return Ok(Root(NotifyableRef::new(ops.clone(), cell)));
    }

    let exists = pipeline::arm_exists(ops, ChangeKind::NotifyableState, &key)?;
    if !exists {
        create_tolerating_exists(ops, &format!("{}{}", keys::SEPARATOR, keys::NAMESPACE))?;
        create_tolerating_exists(
            ops,
            &format!(
                "{}{}{}{}",
                keys::SEPARATOR,
                keys::NAMESPACE,
                keys::SEPARATOR,
                keys::NAMESPACE_VERSION
            ),
        )?;
        create_tolerating_exists(ops, &key)?;
        for token in meta_children(Kind::Root) {
            create_tolerating_exists(ops, &keys::meta_key(&key, token))?;
        }
    }
    load_cell(ops, None, Kind::Root, keys::ROOT, &key).map(Root)
}

/// Resolve an object key to a live handle, loading its ancestry chain.
pub(crate) fn notifyable_from_key(ops: &Arc<Ops>, key: &str) -> Result<NotifyableRef> {
    if let Some(cell) = ops.registry.lookup(key) {
        if cell.is_removed() {
            return Err(Error::ObjectRemoved(key.to_string()));
        }
        return Ok(NotifyableRef::new(ops.clone(), cell));
    }
    let steps = keys::parse_path(key)
        .ok_or_else(|| Error::InvalidArguments(format!("'{key}' is not an object key")))?;

    let mut current: NotifyableRef = root(ops)?.into();
    for step in &steps[1..] {
        current = get_child_cell(ops, current.cell(), step.kind, &step.name, AccessMode::LoadIfPresent)?;
    }
    Ok(current)
}

/// Depth-first deletion of a store subtree.
pub(crate) fn delete_subtree(ops: &Ops, key: &str) -> Result<()> {
    let children = match ops.store.get_children(ops.session, key, false) {
        Ok(children) => children,
        Err(Error::NoNode(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    for child in children {
        delete_subtree(ops, &format!("{key}{}{child}", keys::SEPARATOR))?;
    }
    match ops.store.delete(ops.session, key, crate::store::ANY_VERSION) {
        Ok(()) | Err(Error::NoNode(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

// -- pipeline mutator entry points ------------------------------------------

/// A store-side deletion was observed: drop the subtree from the cache.
pub(crate) fn remove_by_key_cascade(ops: &Arc<Ops>, key: &str) -> bool {
    ops.registry.mark_removed_prefix(key)
}

/// Apply a re-read property blob; true when the cache advanced.
pub(crate) fn refresh_key_values(
    ops: &Arc<Ops>,
    key: &str,
    data: &[u8],
    version: i32,
) -> Result<bool> {
    let Some(cell) = ops.registry.lookup(key) else {
        return Ok(false);
    };
    let map = cached::parse_key_values(data)?;
    let mut state = cell.state.lock().unwrap();
    match state.kv.as_mut() {
        Some(kv) if version > kv.version => {
            kv.map = map;
            kv.version = version;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Apply a re-read shard blob; true when the cache advanced.
pub(crate) fn refresh_shards(
    ops: &Arc<Ops>,
    owner_key: &str,
    data: &[u8],
    version: i32,
) -> Result<bool> {
    let Some(cell) = ops.registry.lookup(owner_key) else {
        return Ok(false);
    };
    let text = String::from_utf8_lossy(data).to_string();
    let mut state = cell.state.lock().unwrap();
    match state.shards.as_mut() {
        Some(shards) if version > shards.version => {
            shards.unmarshal(&text)?;
            shards.version = version;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Apply a re-read record blob; true when the cache advanced.
pub(crate) fn refresh_record(
    ops: &Arc<Ops>,
    owner_key: &str,
    token: &str,
    data: &[u8],
    version: i32,
) -> bool {
    let Some(cell) = ops.registry.lookup(owner_key) else {
        return false;
    };
    let value = match cached::parse_json(data) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(key = owner_key, token, error = %e, "discarding malformed record");
            return false;
        }
    };
    let mut state = cell.state.lock().unwrap();
    let record = state.record_mut(token);
    if version > record.version {
        record.value = value;
        record.version = version;
        true
    } else {
        false
    }
}

/// Apply an observed connection flip; true when the flag changed.
pub(crate) fn set_connected(ops: &Arc<Ops>, node_key: &str, connected: bool) -> bool {
    let Some(cell) = ops.registry.lookup(node_key) else {
        return false;
    };
    let mut state = cell.state.lock().unwrap();
    let changed = state.connected != connected;
    state.connected = connected;
    changed
}

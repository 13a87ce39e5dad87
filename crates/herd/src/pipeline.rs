//! The two-stage event pipeline.
//!
//! Stage one is the ingress thread: it drains typed store events, consults
//! the callback-ready table for each candidate change kind, and runs the
//! armed cache mutators. Mutators re-arm their watch (set ready, then
//! re-issue the read with a watch) before returning, refresh the cache, and
//! name the user-event mask to fan out. Stage two is per-client: each
//! client's dispatch thread pops `(key, mask)` tuples and invokes matching
//! registered handlers.
//!
//! Mutators run only on the ingress thread and never take a distributed
//! lock.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use crate::events::{classify, ChangeKind, EventMask};
use crate::factory::Ops;
use crate::store::StoreEvent;
use crate::{cache, keys, Error, Result};

/// Bookkeeping of armed callbacks: for every `(changeKind, path)` at most
/// one callback is expected to fire next. Arming and disarming strictly
/// alternate; violations are fatal invariant breaches.
#[derive(Default)]
pub(crate) struct ReadyTable {
    map: Mutex<HashMap<ChangeKind, HashMap<String, bool>>>,
}

impl ReadyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `(kind, path)`. Arming an already-armed entry is fatal.
    pub fn set_ready(&self, kind: ChangeKind, path: &str) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        let entry = map.entry(kind).or_default().entry(path.to_string()).or_insert(false);
        if *entry {
            return Err(Error::InconsistentInternalState(format!(
                "callback for {kind:?} on '{path}' armed twice"
            )));
        }
        *entry = true;
        Ok(())
    }

    /// Disarm `(kind, path)`. Disarming an absent or unarmed entry is fatal.
    pub fn unset_ready(&self, kind: ChangeKind, path: &str) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        match map.get_mut(&kind).and_then(|m| m.get_mut(path)) {
            Some(armed @ true) => {
                *armed = false;
                Ok(())
            }
            _ => Err(Error::InconsistentInternalState(format!(
                "spurious disarm of {kind:?} on '{path}'"
            ))),
        }
    }

    pub fn is_ready(&self, kind: ChangeKind, path: &str) -> bool {
        let map = self.map.lock().unwrap();
        map.get(&kind).and_then(|m| m.get(path)).copied().unwrap_or(false)
    }

    /// Disarm `(kind, path)` if armed; returns whether it was.
    pub fn consume(&self, kind: ChangeKind, path: &str) -> bool {
        let mut map = self.map.lock().unwrap();
        match map.get_mut(&kind).and_then(|m| m.get_mut(path)) {
            Some(armed @ true) => {
                *armed = false;
                true
            }
            _ => false,
        }
    }

    /// Arm `(kind, path)` unless already armed; returns true when this call
    /// newly armed it (and the caller must place the store watch).
    pub fn arm_if_needed(&self, kind: ChangeKind, path: &str) -> bool {
        let mut map = self.map.lock().unwrap();
        let entry = map.entry(kind).or_default().entry(path.to_string()).or_insert(false);
        if *entry {
            false
        } else {
            *entry = true;
            true
        }
    }
}

/// Re-arm and read: arm `(kind, path)` unless armed, reading node data with
/// a watch exactly when this call armed it. `Ok(None)` means the node is
/// gone (and the arm was rolled back).
pub(crate) fn arm_and_read(
    ops: &Ops,
    kind: ChangeKind,
    path: &str,
) -> Result<Option<(Vec<u8>, i32)>> {
    let armed = ops.ready.arm_if_needed(kind, path);
    match ops.store.get_data(ops.session, path, armed) {
        Ok(x) => Ok(Some(x)),
        Err(Error::NoNode(_)) => {
            if armed {
                ops.ready.unset_ready(kind, path)?;
            }
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Re-arm and list children, mirroring [`arm_and_read`].
pub(crate) fn arm_and_list(
    ops: &Ops,
    kind: ChangeKind,
    path: &str,
) -> Result<Option<Vec<String>>> {
    let armed = ops.ready.arm_if_needed(kind, path);
    match ops.store.get_children(ops.session, path, armed) {
        Ok(x) => Ok(Some(x)),
        Err(Error::NoNode(_)) => {
            if armed {
                ops.ready.unset_ready(kind, path)?;
            }
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Re-arm an existence watch (used for lifecycle, connection and lock
/// predecessor paths); returns whether the node currently exists.
pub(crate) fn arm_exists(ops: &Ops, kind: ChangeKind, path: &str) -> Result<bool> {
    let armed = ops.ready.arm_if_needed(kind, path);
    ops.store.exists(ops.session, path, armed)
}

/// The ingress loop. Exits when the event channel closes (factory shutdown
/// or store session teardown) or on session expiry.
pub(crate) fn run_ingress(ops: Arc<Ops>, rx: Receiver<StoreEvent>) {
    for event in rx {
        if ops.is_shutdown() {
            // After the end event no cache mutation or callback may run.
            continue;
        }
        match &event {
            StoreEvent::SessionExpired => {
                tracing::warn!("store session expired; shutting the factory down");
                ops.expire();
                break;
            }
            StoreEvent::SyncMarker { id, .. } => {
                let key = sync_signal_key(*id);
                if ops.ready.consume(ChangeKind::Synchronize, &key) {
                    ops.signals.signal(&key);
                } else {
                    tracing::warn!(marker = id, "sync marker without a waiter");
                }
            }
            _ => {
                let path = event.path().expect("non-session events carry a path").to_string();
                for kind in classify(&event) {
                    if !ops.ready.consume(kind, &path) {
                        continue;
                    }
                    match apply_change(&ops, kind, &event, &path) {
                        Ok(Some((key, mask))) if !mask.is_none() => ops.deliver(&key, mask),
                        Ok(_) => {}
                        Err(e) if matches!(e, Error::InconsistentInternalState(_)) => {
                            // Invariant breach: the cache can no longer be
                            // trusted. Tear the factory down.
                            tracing::error!(error = %e, "fatal pipeline invariant violation");
                            ops.expire();
                            return;
                        }
                        Err(e) => {
                            tracing::warn!(?kind, %path, error = %e, "cache mutator failed");
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("ingress thread exiting");
}

pub(crate) fn sync_signal_key(id: u64) -> String {
    format!("_sync/{id}")
}

// One armed change, already consumed from the ready table. Returns the
// notifyable key and mask to fan out to user handlers.
fn apply_change(
    ops: &Arc<Ops>,
    kind: ChangeKind,
    event: &StoreEvent,
    path: &str,
) -> Result<Option<(String, EventMask)>> {
    let deleted = matches!(event, StoreEvent::Deleted { .. });

    match kind {
        ChangeKind::Synchronize => Ok(None),

        ChangeKind::NotifyableState => {
            if deleted {
                let found = cache::remove_by_key_cascade(ops, path);
                return Ok(found.then(|| (path.to_string(), EventMask::DELETED)));
            }
            // Refresh and re-arm the lifecycle watch.
            if arm_and_read(ops, kind, path)?.is_none() {
                return Ok(None);
            }
            Ok(Some((path.to_string(), EventMask::STATE_CHANGE)))
        }

        ChangeKind::Applications
        | ChangeKind::Groups
        | ChangeKind::Nodes
        | ChangeKind::ProcessSlots
        | ChangeKind::DataDistributions
        | ChangeKind::PropertyLists => {
            if deleted {
                return Ok(None);
            }
            if arm_and_list(ops, kind, path)?.is_none() {
                return Ok(None);
            }
            let owner = keys::nearest_notifyable_key(path);
            Ok(owner.map(|key| (key, kind.user_mask())))
        }

        ChangeKind::PropertyListValues => {
            if deleted {
                return Ok(None);
            }
            match arm_and_read(ops, kind, path)? {
                Some((data, version)) => {
                    // A publish by this process already reflects locally;
                    // only a remote advance surfaces a user event.
                    let changed = cache::refresh_key_values(ops, path, &data, version)?;
                    Ok(changed.then(|| (path.to_string(), kind.user_mask())))
                }
                None => Ok(None),
            }
        }

        ChangeKind::Shards => {
            if deleted {
                return Ok(None);
            }
            match arm_and_read(ops, kind, path)? {
                Some((data, version)) => {
                    let owner = match keys::nearest_notifyable_key(path) {
                        Some(key) => key,
                        None => return Ok(None),
                    };
                    let changed = cache::refresh_shards(ops, &owner, &data, version)?;
                    Ok(changed.then_some((owner, kind.user_mask())))
                }
                None => Ok(None),
            }
        }

        ChangeKind::NodeClientState
        | ChangeKind::NodeMasterSetState
        | ChangeKind::ProcessSlotsUsage
        | ChangeKind::ProcessSlotPortVec
        | ChangeKind::ProcessSlotExecArgs
        | ChangeKind::ProcessSlotRunningExecArgs
        | ChangeKind::ProcessSlotPid
        | ChangeKind::ProcessSlotDesiredState
        | ChangeKind::ProcessSlotCurrentState
        | ChangeKind::ProcessSlotReservation => {
            if deleted {
                return Ok(None);
            }
            match arm_and_read(ops, kind, path)? {
                Some((data, version)) => {
                    let owner = match keys::nearest_notifyable_key(path) {
                        Some(key) => key,
                        None => return Ok(None),
                    };
                    let token = crate::store::base_name(path).to_string();
                    let changed = cache::refresh_record(ops, &owner, &token, &data, version);
                    Ok(changed.then_some((owner, kind.user_mask())))
                }
                None => Ok(None),
            }
        }

        ChangeKind::NodeConnection => {
            let connected = arm_exists(ops, kind, path)?;
            let owner = match keys::nearest_notifyable_key(path) {
                Some(key) => key,
                None => return Ok(None),
            };
            let changed = cache::set_connected(ops, &owner, connected);
            Ok(changed.then_some((owner, kind.user_mask())))
        }

        ChangeKind::QueueChildren => {
            // Wake blocked takers whether elements arrived or the queue is
            // being torn down.
            ops.signals.signal(path);
            if deleted {
                return Ok(None);
            }
            if arm_and_list(ops, kind, path)?.is_none() {
                return Ok(None);
            }
            let owner = keys::nearest_notifyable_key(path);
            Ok(owner.map(|key| (key, kind.user_mask())))
        }

        ChangeKind::PrecLockNodeExists => {
            if deleted {
                ops.signals.signal(path);
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ready_flag_strictly_alternates() {
        let table = ReadyTable::new();
        let kind = ChangeKind::Shards;

        table.set_ready(kind, "/d/_shards").unwrap();
        assert!(table.is_ready(kind, "/d/_shards"));
        table.unset_ready(kind, "/d/_shards").unwrap();
        assert!(!table.is_ready(kind, "/d/_shards"));
        table.set_ready(kind, "/d/_shards").unwrap();
        table.unset_ready(kind, "/d/_shards").unwrap();
    }

    #[test]
    fn double_arm_is_fatal() {
        let table = ReadyTable::new();
        table.set_ready(ChangeKind::Groups, "/g/_groups").unwrap();
        assert!(matches!(
            table.set_ready(ChangeKind::Groups, "/g/_groups"),
            Err(Error::InconsistentInternalState(_))
        ));
    }

    #[test]
    fn spurious_disarm_is_fatal() {
        let table = ReadyTable::new();
        assert!(matches!(
            table.unset_ready(ChangeKind::Groups, "/absent"),
            Err(Error::InconsistentInternalState(_))
        ));
        table.set_ready(ChangeKind::Groups, "/g").unwrap();
        table.unset_ready(ChangeKind::Groups, "/g").unwrap();
        assert!(matches!(
            table.unset_ready(ChangeKind::Groups, "/g"),
            Err(Error::InconsistentInternalState(_))
        ));
    }

    #[test]
    fn consume_only_takes_armed_entries() {
        let table = ReadyTable::new();
        assert!(!table.consume(ChangeKind::Nodes, "/n"));
        table.set_ready(ChangeKind::Nodes, "/n").unwrap();
        assert!(table.consume(ChangeKind::Nodes, "/n"));
        assert!(!table.consume(ChangeKind::Nodes, "/n"));
    }

    #[test]
    fn arm_if_needed_reports_transition() {
        let table = ReadyTable::new();
        assert!(table.arm_if_needed(ChangeKind::QueueChildren, "/q/_elements"));
        assert!(!table.arm_if_needed(ChangeKind::QueueChildren, "/q/_elements"));
        table.unset_ready(ChangeKind::QueueChildren, "/q/_elements").unwrap();
        assert!(table.arm_if_needed(ChangeKind::QueueChildren, "/q/_elements"));
    }

    // Kinds are independent dimensions of the table.
    #[test]
    fn kinds_do_not_alias() {
        let table = ReadyTable::new();
        table.set_ready(ChangeKind::PropertyListValues, "/p").unwrap();
        assert!(!table.is_ready(ChangeKind::NotifyableState, "/p"));
        table.set_ready(ChangeKind::NotifyableState, "/p").unwrap();
        table.unset_ready(ChangeKind::PropertyListValues, "/p").unwrap();
        assert!(table.is_ready(ChangeKind::NotifyableState, "/p"));
    }
}

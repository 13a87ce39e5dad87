//! The distributed lock manager.
//!
//! A lock on a notifyable is a directory of ephemeral-sequential bid nodes
//! under `<key>/_locks/<lockName>/`. A bid's name encodes its owner
//! (`host:pid-tid`) and mode (`X` or `S`); the store appends the sequence.
//! The holder set is decided purely by sequence order: an exclusive bid
//! waits behind every lower bid, a shared bid waits only behind lower
//! exclusive bids. Waiters watch their nearest blocking predecessor and
//! re-examine the directory when it disappears.
//!
//! Re-acquisition by the holding thread is reentrant and counted; the bid
//! node is deleted only by the final release. Session loss deletes every
//! bid the session owned, which wakes its successors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::Cell;
use crate::events::ChangeKind;
use crate::factory::Ops;
use crate::signal::Wait;
use crate::store::{base_name, CreateMode, ANY_VERSION};
use crate::{keys, pipeline, Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn letter(&self) -> char {
        match self {
            LockMode::Shared => 'S',
            LockMode::Exclusive => 'X',
        }
    }

    fn from_letter(c: char) -> Option<LockMode> {
        match c {
            'S' => Some(LockMode::Shared),
            'X' => Some(LockMode::Exclusive),
            _ => None,
        }
    }
}

/// An outstanding bid, as enumerated for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockBid {
    pub notifyable_key: String,
    pub lock_name: String,
    pub owner: String,
    pub mode: LockMode,
    pub sequence: u64,
}

/// Reentry record kept in the owning cell's state, keyed by lock name and
/// then by owner id (shared locks have several concurrent owners).
#[derive(Debug, Clone)]
pub(crate) struct LockOwner {
    pub mode: LockMode,
    pub count: i32,
    pub bid_path: String,
}

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

/// `host:pid-tid` identity of the calling thread, used in bid names and
/// reentry records.
pub(crate) fn owner_id(host: &str) -> String {
    let tid = THREAD_TAG.with(|t| *t);
    format!("{host}:{:#x}-{tid:#x}", std::process::id())
}

/// Resolve the local host name for lock node naming.
pub(crate) fn local_hostname() -> Result<String> {
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.is_empty() {
            return Ok(host);
        }
    }
    let output = std::process::Command::new("hostname")
        .output()
        .map_err(|e| Error::SystemFailure(format!("hostname lookup failed: {e}")))?;
    let host = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if host.is_empty() {
        return Err(Error::SystemFailure("hostname lookup returned nothing".into()));
    }
    Ok(host)
}

struct ParsedBid {
    name: String,
    owner: String,
    mode: LockMode,
    sequence: u64,
}

fn parse_bid(name: &str) -> Result<ParsedBid> {
    let err = || Error::InconsistentInternalState(format!("malformed lock bid '{name}'"));

    let split = name.rfind(keys::BID_SPLIT).ok_or_else(err)?;
    let owner = name[..split].to_string();
    let rest = &name[split + 1..];
    let mode = rest.chars().next().and_then(LockMode::from_letter).ok_or_else(err)?;
    let sequence: u64 = rest[1..].parse().map_err(|_| err())?;

    Ok(ParsedBid {
        name: name.to_string(),
        owner,
        mode,
        sequence,
    })
}

fn ensure_lock_dir(ops: &Ops, object_key: &str, lock_name: &str) -> Result<String> {
    let dir = keys::lock_key(object_key, lock_name);
    match ops.store.create(ops.session, &dir, b"", CreateMode::Persistent) {
        Ok(_) | Err(Error::NodeExists(_)) => Ok(dir),
        Err(Error::NoParent(_)) => {
            let locks = keys::locks_key(object_key);
            match ops.store.create(ops.session, &locks, b"", CreateMode::Persistent) {
                Ok(_) | Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
            match ops.store.create(ops.session, &dir, b"", CreateMode::Persistent) {
                Ok(_) | Err(Error::NodeExists(_)) => Ok(dir),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// Acquire `lock_name` on `cell` in `mode`, waiting at most `timeout`
/// (forever when `None`). Returns false exactly when the timeout expired.
pub(crate) fn acquire(
    ops: &Arc<Ops>,
    cell: &Arc<Cell>,
    lock_name: &str,
    mode: LockMode,
    timeout: Option<Duration>,
) -> Result<bool> {
    if ops.is_shutdown() {
        return Err(Error::OperationCancelled);
    }
    let owner = owner_id(&ops.host);

    // Reentrant re-acquisition by the holding thread.
    {
        let mut state = cell.state.lock().unwrap();
        if let Some(rec) = state.lock_owners.get_mut(lock_name).and_then(|m| m.get_mut(&owner)) {
            if rec.count > 0 {
                if rec.mode != mode {
                    return Err(Error::InvalidArguments(format!(
                        "lock '{lock_name}' already held in {:?} mode; mode changes are not allowed",
                        rec.mode
                    )));
                }
                rec.count += 1;
                return Ok(true);
            }
        }
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    // A vanished lock directory means the object went away underneath us.
    let removed = |_| Error::ObjectRemoved(cell.key.clone());
    let dir = ensure_lock_dir(ops, &cell.key, lock_name).map_err(|e| match e {
        Error::NoParent(p) => removed(p),
        other => other,
    })?;
    let prefix = keys::lock_bid_prefix(&cell.key, lock_name, &owner, mode.letter());
    let bid_path = ops
        .store
        .create(ops.session, &prefix, b"", CreateMode::EphemeralSequential)
        .map_err(|e| match e {
            Error::NoParent(p) => removed(p),
            other => other,
        })?;
    let my_bid = parse_bid(base_name(&bid_path))?;

    tracing::debug!(key = %cell.key, lock_name, ?mode, bid = %bid_path, "lock bid placed");

    loop {
        if ops.is_shutdown() {
            abandon_bid(ops, &bid_path);
            return Err(Error::OperationCancelled);
        }

        let children = match ops.store.get_children(ops.session, &dir, false) {
            Ok(children) => children,
            Err(Error::NoNode(_)) => {
                abandon_bid(ops, &bid_path);
                return Err(Error::ObjectRemoved(cell.key.clone()));
            }
            Err(e) => return Err(e),
        };
        let mut blocker: Option<ParsedBid> = None;
        for child in &children {
            let bid = parse_bid(child)?;
            if bid.sequence >= my_bid.sequence {
                continue;
            }
            // A shared bid is blocked only by exclusive predecessors.
            if mode == LockMode::Shared && bid.mode == LockMode::Shared {
                continue;
            }
            if blocker.as_ref().map_or(true, |b| bid.sequence > b.sequence) {
                blocker = Some(bid);
            }
        }

        let Some(pred) = blocker else {
            break;
        };
        let pred_path = format!("{dir}{}{}", keys::SEPARATOR, pred.name);

        // Capture the epoch before arming so a deletion racing ahead of
        // the wait still wakes us.
        let signal = ops.signals.add_ref(&pred_path);
        let seen = signal.epoch();
        let still_there = pipeline::arm_exists(ops, ChangeKind::PrecLockNodeExists, &pred_path)?;
        if !still_there {
            ops.signals.remove_ref(&pred_path);
            continue;
        }

        let remaining = match deadline {
            None => None,
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    ops.signals.remove_ref(&pred_path);
                    abandon_bid(ops, &bid_path);
                    return Ok(false);
                }
                Some(deadline - now)
            }
        };
        let outcome = signal.wait_change(seen, remaining);
        ops.signals.remove_ref(&pred_path);
        match outcome {
            Wait::Signalled => continue,
            Wait::TimedOut => {
                abandon_bid(ops, &bid_path);
                return Ok(false);
            }
            Wait::Cancelled => {
                abandon_bid(ops, &bid_path);
                return Err(Error::OperationCancelled);
            }
        }
    }

    let mut state = cell.state.lock().unwrap();
    state.lock_owners.entry(lock_name.to_string()).or_default().insert(
        owner,
        LockOwner {
            mode,
            count: 1,
            bid_path,
        },
    );
    tracing::debug!(key = %cell.key, lock_name, ?mode, "lock acquired");
    Ok(true)
}

fn abandon_bid(ops: &Ops, bid_path: &str) {
    match ops.store.delete(ops.session, bid_path, ANY_VERSION) {
        Ok(()) | Err(Error::NoNode(_)) => {}
        Err(e) => tracing::warn!(bid = %bid_path, error = %e, "failed to clean up lock bid"),
    }
}

/// Release one hold of `lock_name`; the final release deletes the bid,
/// waking the successor.
pub(crate) fn release(ops: &Ops, cell: &Arc<Cell>, lock_name: &str) -> Result<()> {
    let owner = owner_id(&ops.host);

    let bid_path = {
        let mut state = cell.state.lock().unwrap();
        let (remaining, path) = {
            let rec = state
                .lock_owners
                .get_mut(lock_name)
                .and_then(|m| m.get_mut(&owner))
                .filter(|rec| rec.count > 0);
            let Some(rec) = rec else {
                return Err(Error::InvalidArguments(format!(
                    "releasing lock '{lock_name}' on '{}' which this thread does not hold",
                    cell.key
                )));
            };
            rec.count -= 1;
            (rec.count, rec.bid_path.clone())
        };
        if remaining == 0 {
            let owners = state.lock_owners.get_mut(lock_name).expect("entry present");
            owners.remove(&owner);
            if owners.is_empty() {
                state.lock_owners.remove(lock_name);
            }
            Some(path)
        } else {
            None
        }
    };

    if let Some(path) = bid_path {
        // The bid may already be gone if the object was just removed.
        match ops.store.delete(ops.session, &path, ANY_VERSION) {
            Ok(()) | Err(Error::NoNode(_)) => {}
            Err(e) => return Err(e),
        }
        tracing::debug!(key = %cell.key, lock_name, "lock released");
    }
    Ok(())
}

/// Does the calling thread hold `lock_name` on `cell` (in any mode)?
pub(crate) fn has_lock(ops: &Ops, cell: &Cell, lock_name: &str) -> bool {
    let owner = owner_id(&ops.host);
    let state = cell.state.lock().unwrap();
    state
        .lock_owners
        .get(lock_name)
        .and_then(|m| m.get(&owner))
        .map_or(false, |rec| rec.count > 0)
}

/// Does the calling thread hold `lock_name` exclusively?
pub(crate) fn has_exclusive_lock(ops: &Ops, cell: &Cell, lock_name: &str) -> bool {
    let owner = owner_id(&ops.host);
    let state = cell.state.lock().unwrap();
    state
        .lock_owners
        .get(lock_name)
        .and_then(|m| m.get(&owner))
        .map_or(false, |rec| rec.count > 0 && rec.mode == LockMode::Exclusive)
}

/// Enumerate outstanding bids for `lock_name` on `object_key` (every lock
/// name when `None`), straight from the store.
pub(crate) fn bids(
    ops: &Ops,
    object_key: &str,
    lock_name: Option<&str>,
) -> Result<Vec<LockBid>> {
    let lock_names: Vec<String> = match lock_name {
        Some(name) => vec![name.to_string()],
        None => {
            let locks_dir = keys::locks_key(object_key);
            match ops.store.get_children(ops.session, &locks_dir, false) {
                Ok(names) => names,
                Err(Error::NoNode(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            }
        }
    };

    let mut out = Vec::new();
    for name in lock_names {
        let dir = keys::lock_key(object_key, &name);
        let children = match ops.store.get_children(ops.session, &dir, false) {
            Ok(c) => c,
            Err(Error::NoNode(_)) => continue,
            Err(e) => return Err(e),
        };
        for child in children {
            let bid = parse_bid(&child)?;
            out.push(LockBid {
                notifyable_key: object_key.to_string(),
                lock_name: name.clone(),
                owner: bid.owner,
                mode: bid.mode,
                sequence: bid.sequence,
            });
        }
    }
    out.sort_by_key(|b| b.sequence);
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_bid_names() {
        let bid = parse_bid("myhost:0x4d2-0x7=X0000000012").unwrap();
        assert_eq!(bid.owner, "myhost:0x4d2-0x7");
        assert_eq!(bid.mode, LockMode::Exclusive);
        assert_eq!(bid.sequence, 12);

        let bid = parse_bid("h:0x1-0x2=S0000000000").unwrap();
        assert_eq!(bid.mode, LockMode::Shared);
        assert_eq!(bid.sequence, 0);

        assert!(parse_bid("garbage").is_err());
        assert!(parse_bid("owner=Q0000000001").is_err());
        assert!(parse_bid("owner=X12ab").is_err());
    }

    #[test]
    fn owner_ids_differ_per_thread() {
        let a = owner_id("h");
        let b = std::thread::spawn(|| owner_id("h")).join().unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("h:"));
        // Stable within a thread.
        assert_eq!(a, owner_id("h"));
    }
}

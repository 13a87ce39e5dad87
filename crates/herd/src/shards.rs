//! Hash-range shards and the shard set of a data distribution.
//!
//! A shard maps the closed hash range `[start, end]` to a target object
//! (a node or process slot, referenced by key) with an integer priority.
//! The set is indexed by an interval tree; routing a hash key returns every
//! covering shard's target ordered by ascending priority, with ties broken
//! by ascending range start.

use std::sync::Arc;

use interval_tree::IntervalTree;

use crate::cache::{Cell, NotifyableRef};
use crate::events::ChangeKind;
use crate::factory::Ops;
use crate::{cache, keys, locks, Error, Result};

/// Upper bound of the hash space.
pub const HASH_RANGE_MAX: u64 = u64::MAX;

/// One shard of a data distribution. An empty target is legal and routes
/// nowhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub start: u64,
    pub end: u64,
    pub target_key: Option<String>,
    pub priority: i32,
}

/// Tree payload. `seq` stamps insertion order so equal-priority lookups
/// stay stable; it does not participate in equality.
#[derive(Debug, Clone)]
pub(crate) struct ShardPayload {
    priority: i32,
    target_key: Option<String>,
    seq: u64,
}

impl PartialEq for ShardPayload {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.target_key == other.target_key
    }
}

/// The cached shard tree of a data distribution, plus its store version.
pub(crate) struct ShardsData {
    tree: IntervalTree<u64, ShardPayload>,
    pub version: i32,
    next_seq: u64,
}

impl ShardsData {
    pub fn new() -> Self {
        Self {
            tree: IntervalTree::new(),
            version: -2,
            next_seq: 0,
        }
    }

    pub fn insert(
        &mut self,
        start: u64,
        end: u64,
        target_key: Option<String>,
        priority: i32,
    ) -> Result<()> {
        if end < start {
            return Err(Error::InvalidArguments(format!(
                "shard end {end} orders before start {start}"
            )));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tree.insert(
            start,
            end,
            ShardPayload {
                priority,
                target_key,
                seq,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, shard: &Shard) -> bool {
        let payload = ShardPayload {
            priority: shard.priority,
            target_key: shard.target_key.clone(),
            seq: 0,
        };
        self.tree.remove(shard.start, shard.end, &payload)
    }

    pub fn clear(&mut self) {
        self.tree.clear();
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// All shards in ascending range-start order.
    pub fn all(&self) -> Vec<Shard> {
        self.tree
            .iter()
            .map(|(start, end, p)| Shard {
                start,
                end,
                target_key: p.target_key.clone(),
                priority: p.priority,
            })
            .collect()
    }

    /// Shards covering `hash`, ordered by ascending priority; equal
    /// priorities keep ascending range-start order.
    pub fn lookup(&self, hash: u64) -> Vec<Shard> {
        let mut hits: Vec<Shard> = self
            .tree
            .overlapping(hash, hash)
            .into_iter()
            .map(|id| {
                let (start, end) = self.tree.interval(id);
                let p = self.tree.data(id);
                Shard {
                    start,
                    end,
                    target_key: p.target_key.clone(),
                    priority: p.priority,
                }
            })
            .collect();
        hits.sort_by_key(|s| s.priority);
        hits
    }

    /// Walk ascending ranges and check that `[0, HASH_RANGE_MAX]` is fully
    /// covered. Closed intervals: an end meeting the next start covers.
    pub fn is_covered(&self) -> bool {
        let mut next_uncovered: u64 = 0;
        for (start, end, _) in self.tree.iter() {
            if start > next_uncovered {
                return false;
            }
            if end >= next_uncovered {
                if end == HASH_RANGE_MAX {
                    return true;
                }
                next_uncovered = end + 1;
            }
        }
        false
    }

    /// Wire form `start,end,targetKey,priority;…` in tree order.
    pub fn marshal(&self) -> String {
        let mut out = String::new();
        for (start, end, p) in self.tree.iter() {
            let target = p.target_key.as_deref().unwrap_or("");
            out.push_str(&format!("{start},{end},{target},{};", p.priority));
        }
        out
    }

    /// Replace the tree from the wire form.
    pub fn unmarshal(&mut self, data: &str) -> Result<()> {
        let mut tree = IntervalTree::new();
        let mut next_seq = 0u64;
        for piece in data.split(';') {
            if piece.is_empty() {
                continue;
            }
            let fields: Vec<&str> = piece.split(',').collect();
            if fields.len() != 4 {
                return Err(Error::InconsistentInternalState(format!(
                    "malformed shard '{piece}': expected 4 fields, got {}",
                    fields.len()
                )));
            }
            let parse = |s: &str, what: &str| -> Result<u64> {
                s.parse().map_err(|_| {
                    Error::InconsistentInternalState(format!("malformed shard {what} '{s}'"))
                })
            };
            let start = parse(fields[0], "start")?;
            let end = parse(fields[1], "end")?;
            let priority: i32 = fields[3].parse().map_err(|_| {
                Error::InconsistentInternalState(format!("malformed shard priority '{}'", fields[3]))
            })?;
            let target_key = (!fields[2].is_empty()).then(|| fields[2].to_string());
            if end < start {
                return Err(Error::InconsistentInternalState(format!(
                    "shard '{piece}' end orders before start"
                )));
            }
            let seq = next_seq;
            next_seq += 1;
            tree.insert(
                start,
                end,
                ShardPayload {
                    priority,
                    target_key,
                    seq,
                },
            );
        }
        self.tree = tree;
        self.next_seq = next_seq;
        Ok(())
    }
}

/// Stable hash of a routing key string into the shard hash space.
pub fn hash_key(key: &str) -> u64 {
    fxhash::hash64(key)
}

/// Accessor over a data distribution's cached shard set.
pub struct CachedShards<'a> {
    pub(crate) nt: &'a NotifyableRef,
}

impl<'a> CachedShards<'a> {
    fn with_data<T>(&self, f: impl FnOnce(&mut ShardsData) -> T) -> Result<T> {
        self.nt.require_ready()?;
        let cell = self.nt.cell();
        let mut state = cell.state.lock().unwrap();
        let data = state.shards.as_mut().ok_or_else(|| {
            Error::InvalidMethod(format!("'{}' carries no shards", cell.key))
        })?;
        Ok(f(data))
    }

    /// Insert `[start, end] -> target` at `priority`. Local until
    /// [`CachedShards::publish`].
    pub fn insert(
        &self,
        start: u64,
        end: u64,
        target: Option<&NotifyableRef>,
        priority: i32,
    ) -> Result<()> {
        let target_key = target.map(|t| t.key().to_string());
        self.with_data(|d| d.insert(start, end, target_key, priority))?
    }

    /// Remove the first shard equal to `shard`; false when absent.
    pub fn remove(&self, shard: &Shard) -> Result<bool> {
        self.with_data(|d| Ok(d.remove(shard)))?
    }

    pub fn clear(&self) -> Result<()> {
        self.with_data(|d| d.clear())
    }

    pub fn count(&self) -> Result<usize> {
        self.with_data(|d| d.len())
    }

    /// Every shard, ascending by range start.
    pub fn get_all(&self) -> Result<Vec<Shard>> {
        self.with_data(|d| d.all())
    }

    /// Shards passing both filters: a target filter (when set, only shards
    /// routing to that object) and a priority filter (when set, only shards
    /// at exactly that priority).
    pub fn get_filtered(
        &self,
        target: Option<&NotifyableRef>,
        priority: Option<i32>,
    ) -> Result<Vec<Shard>> {
        let target_key = target.map(|t| t.key().to_string());
        let all = self.with_data(|d| d.all())?;
        Ok(all
            .into_iter()
            .filter(|s| {
                target_key.as_ref().map_or(true, |t| s.target_key.as_ref() == Some(t))
                    && priority.map_or(true, |p| s.priority == p)
            })
            .collect())
    }

    /// Shards covering `hash`, sorted by ascending priority.
    pub fn get_shards(&self, hash: u64) -> Result<Vec<Shard>> {
        self.with_data(|d| d.lookup(hash))
    }

    /// Targets covering `hash`, sorted by ascending priority, resolved
    /// through the cache. Targets of removed objects are skipped.
    pub fn get_notifyables(&self, hash: u64) -> Result<Vec<NotifyableRef>> {
        let shards = self.get_shards(hash)?;
        let mut out = Vec::new();
        for shard in shards {
            let Some(key) = shard.target_key else {
                continue;
            };
            match cache::notifyable_from_key(self.nt.ops(), &key) {
                Ok(nt) => out.push(nt),
                Err(Error::NoNode(_)) | Err(Error::ObjectRemoved(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Targets covering the hash of the routing key `key`.
    pub fn get_notifyables_by_key(&self, key: &str) -> Result<Vec<NotifyableRef>> {
        self.get_notifyables(hash_key(key))
    }

    /// Is `[0, HASH_RANGE_MAX]` fully covered?
    pub fn is_covered(&self) -> Result<bool> {
        self.with_data(|d| d.is_covered())
    }

    pub fn version(&self) -> Result<i32> {
        self.with_data(|d| d.version)
    }

    /// Versioned write of the shard set. Requires the exclusive notifyable
    /// lock on the owning distribution.
    pub fn publish(&self) -> Result<()> {
        publish_shards(self.nt.ops(), self.nt.cell())
    }
}

fn publish_shards(ops: &Arc<Ops>, cell: &Arc<Cell>) -> Result<()> {
    if !locks::has_exclusive_lock(ops, cell, keys::NOTIFYABLE_LOCK) {
        return Err(Error::InvalidMethod(format!(
            "publishing shards of '{}' requires the exclusive notifyable lock",
            cell.key
        )));
    }

    let path = keys::meta_key(&cell.key, keys::SHARDS);
    let (payload, expected) = {
        let mut state = cell.state.lock().unwrap();
        let data = state
            .shards
            .as_mut()
            .ok_or_else(|| Error::InvalidMethod(format!("'{}' carries no shards", cell.key)))?;
        (data.marshal(), data.version.max(0))
    };

    let new_version = ops
        .store
        .set_data(ops.session, &path, payload.as_bytes(), expected)?;

    let mut state = cell.state.lock().unwrap();
    if let Some(data) = state.shards.as_mut() {
        // A publish never lowers the locally observed version.
        if new_version > data.version {
            data.version = new_version;
        }
    }
    tracing::debug!(key = %cell.key, version = new_version, "shards published");
    Ok(())
}

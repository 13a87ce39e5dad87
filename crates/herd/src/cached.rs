//! Versioned cached data: key/value maps, state-record histories and
//! process info.
//!
//! Every type here follows the same discipline: reads are served from the
//! process-local cache, mutation is local until `publish()`, and `publish()`
//! performs a versioned store write under the owning object's exclusive
//! notifyable lock. A version conflict surfaces as
//! [`Error::PublishVersion`]; the armed watch refreshes the cache and the
//! caller retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::cache::{Cell, NotifyableRef};
use crate::factory::Ops;
use crate::{keys, locks, Error, Result};

/// History entries kept per state record; older entries are dropped.
const STATE_HISTORY_MAX: usize = 20;

/// Property-list style key/value map plus the locally observed version.
pub(crate) struct KvData {
    pub map: BTreeMap<String, Value>,
    pub version: i32,
}

impl KvData {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            version: -2,
        }
    }
}

/// One versioned JSON blob at a data child of an object. `pending` holds
/// local mutation not yet published.
pub(crate) struct JsonRecord {
    pub value: Value,
    pub version: i32,
    pub pending: Option<Value>,
}

impl JsonRecord {
    pub fn new() -> Self {
        Self {
            value: Value::Null,
            version: -2,
            pending: None,
        }
    }
}

/// Decode a record blob; empty bytes decode as JSON null.
pub(crate) fn parse_json(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(data)
        .map_err(|e| Error::InconsistentInternalState(format!("malformed record blob: {e}")))
}

/// Decode the property-list grammar `key=<json>;…`.
pub(crate) fn parse_key_values(data: &[u8]) -> Result<BTreeMap<String, Value>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::InconsistentInternalState("property blob is not UTF-8".into()))?;
    let mut map = BTreeMap::new();
    for piece in text.split(';') {
        if piece.is_empty() {
            continue;
        }
        let (key, encoded) = piece.split_once('=').ok_or_else(|| {
            Error::InconsistentInternalState(format!("malformed property '{piece}'"))
        })?;
        let value: Value = serde_json::from_str(encoded).map_err(|e| {
            Error::InconsistentInternalState(format!("malformed property value '{encoded}': {e}"))
        })?;
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

/// Encode the property-list grammar; BTreeMap order makes it canonical.
pub(crate) fn marshal_key_values(map: &BTreeMap<String, Value>) -> String {
    let mut out = String::new();
    for (key, value) in map {
        out.push_str(key);
        out.push('=');
        out.push_str(&value.to_string());
        out.push(';');
    }
    out
}

fn check_property_token(what: &str, token: &str) -> Result<()> {
    if token.is_empty() || token.contains('=') || token.contains(';') {
        return Err(Error::InvalidArguments(format!(
            "property {what} '{token}' must be non-empty and free of '=' and ';'"
        )));
    }
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn require_publish_lock(ops: &Ops, cell: &Arc<Cell>) -> Result<()> {
    if !locks::has_exclusive_lock(ops, cell, keys::NOTIFYABLE_LOCK) {
        return Err(Error::InvalidMethod(format!(
            "publishing on '{}' requires the exclusive notifyable lock",
            cell.key
        )));
    }
    Ok(())
}

/// Accessor over a property list's cached key/value map.
pub struct CachedKeyValues<'a> {
    pub(crate) nt: &'a NotifyableRef,
}

impl<'a> CachedKeyValues<'a> {
    fn with_kv<T>(&self, f: impl FnOnce(&mut KvData) -> T) -> Result<T> {
        self.nt.require_ready()?;
        let cell = self.nt.cell();
        let mut state = cell.state.lock().unwrap();
        let kv = state
            .kv
            .as_mut()
            .ok_or_else(|| Error::InvalidMethod(format!("'{}' holds no key/values", cell.key)))?;
        Ok(f(kv))
    }

    /// Non-blocking cached read.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.with_kv(|kv| kv.map.get(key).cloned())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.with_kv(|kv| kv.map.keys().cloned().collect())
    }

    /// Local write; visible to other processes only after `publish`.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        check_property_token("key", key)?;
        check_property_token("value", &value.to_string())?;
        self.with_kv(|kv| {
            kv.map.insert(key.to_string(), value);
        })
    }

    /// Local erase; false when the key was absent.
    pub fn erase(&self, key: &str) -> Result<bool> {
        self.with_kv(|kv| kv.map.remove(key).is_some())
    }

    pub fn version(&self) -> Result<i32> {
        self.with_kv(|kv| kv.version)
    }

    /// Versioned write of the whole map. Requires the exclusive notifyable
    /// lock on the owning property list.
    pub fn publish(&self) -> Result<()> {
        let ops = self.nt.ops();
        let cell = self.nt.cell();
        self.nt.require_ready()?;
        require_publish_lock(ops, cell)?;

        let (payload, expected) = {
            let state = cell.state.lock().unwrap();
            let kv = state
                .kv
                .as_ref()
                .ok_or_else(|| Error::InvalidMethod(format!("'{}' holds no key/values", cell.key)))?;
            (marshal_key_values(&kv.map), kv.version.max(0))
        };

        let new_version = ops
            .store
            .set_data(ops.session, &cell.key, payload.as_bytes(), expected)?;

        let mut state = cell.state.lock().unwrap();
        if let Some(kv) = state.kv.as_mut() {
            if new_version > kv.version {
                kv.version = new_version;
            }
        }
        tracing::debug!(key = %cell.key, version = new_version, "key/values published");
        Ok(())
    }
}

/// One entry of a state-record history.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StateRecord {
    pub timestamp: u64,
    #[serde(rename = "keyValues")]
    pub key_values: BTreeMap<String, Value>,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct StateHistory {
    history: Vec<StateRecord>,
}

/// Accessor over a current/desired state record (a bounded history of
/// key/value snapshots) of a node or process slot.
pub struct CachedState<'a> {
    pub(crate) nt: &'a NotifyableRef,
    pub(crate) token: &'static str,
}

impl<'a> CachedState<'a> {
    fn with_record<T>(&self, f: impl FnOnce(&mut JsonRecord) -> T) -> Result<T> {
        self.nt.require_ready()?;
        let cell = self.nt.cell();
        let mut state = cell.state.lock().unwrap();
        let record = state.record_mut(self.token);
        Ok(f(record))
    }

    fn decode(value: &Value) -> StateHistory {
        if value.is_null() {
            return StateHistory::default();
        }
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// The newest published value of `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.with_record(|r| {
            Self::decode(&r.value)
                .history
                .last()
                .and_then(|entry| entry.key_values.get(key).cloned())
        })
    }

    /// Published history, oldest first.
    pub fn history(&self) -> Result<Vec<StateRecord>> {
        self.with_record(|r| Self::decode(&r.value).history)
    }

    /// Stage `key = value` for the next published snapshot. Keys from the
    /// newest snapshot carry forward unless overwritten or erased.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.with_record(|r| {
            let mut pending = match r.pending.take() {
                Some(Value::Object(m)) => m,
                _ => {
                    let newest = Self::decode(&r.value)
                        .history
                        .pop()
                        .map(|e| e.key_values)
                        .unwrap_or_default();
                    newest.into_iter().collect()
                }
            };
            pending.insert(key.to_string(), value);
            r.pending = Some(Value::Object(pending));
        })
    }

    /// Drop `key` from the next published snapshot.
    pub fn erase(&self, key: &str) -> Result<()> {
        self.with_record(|r| {
            let mut pending = match r.pending.take() {
                Some(Value::Object(m)) => m,
                _ => {
                    let newest = Self::decode(&r.value)
                        .history
                        .pop()
                        .map(|e| e.key_values)
                        .unwrap_or_default();
                    newest.into_iter().collect()
                }
            };
            pending.remove(key);
            r.pending = Some(Value::Object(pending));
        })
    }

    pub fn version(&self) -> Result<i32> {
        self.with_record(|r| r.version)
    }

    /// Append the staged snapshot to the history and write it versioned.
    /// Requires the exclusive notifyable lock on the owning object.
    pub fn publish(&self) -> Result<()> {
        let ops = self.nt.ops();
        let cell = self.nt.cell();
        self.nt.require_ready()?;
        require_publish_lock(ops, cell)?;

        let path = keys::meta_key(&cell.key, self.token);
        let (payload, expected) = {
            let mut state = cell.state.lock().unwrap();
            let record = state.record_mut(self.token);

            let mut history = Self::decode(&record.value);
            let key_values: BTreeMap<String, Value> = match record.pending.clone() {
                Some(Value::Object(m)) => m.into_iter().collect(),
                _ => history.history.last().map(|e| e.key_values.clone()).unwrap_or_default(),
            };
            history.history.push(StateRecord {
                timestamp: now_millis(),
                key_values,
            });
            if history.history.len() > STATE_HISTORY_MAX {
                let drop = history.history.len() - STATE_HISTORY_MAX;
                history.history.drain(..drop);
            }
            let value = serde_json::to_value(&history).map_err(|e| {
                Error::InconsistentInternalState(format!("state record failed to encode: {e}"))
            })?;
            (value, record.version.max(0))
        };

        let bytes = payload.to_string().into_bytes();
        let new_version = ops.store.set_data(ops.session, &path, &bytes, expected)?;

        let mut state = cell.state.lock().unwrap();
        let record = state.record_mut(self.token);
        if new_version > record.version {
            record.value = payload;
            record.version = new_version;
        }
        record.pending = None;
        tracing::debug!(key = %cell.key, token = self.token, version = new_version, "state published");
        Ok(())
    }
}

/// Exec invocation description of a process slot.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExecArgs {
    /// Environment additions, `NAME=value` entries.
    pub env: Vec<String>,
    /// Working directory of the process.
    pub path: String,
    pub command: String,
}

/// Accessor over a process slot's port vector, exec args and PID records.
pub struct CachedProcessInfo<'a> {
    pub(crate) nt: &'a NotifyableRef,
}

impl<'a> CachedProcessInfo<'a> {
    fn get_record<T: serde::de::DeserializeOwned>(&self, token: &'static str) -> Result<Option<T>> {
        self.nt.require_ready()?;
        let cell = self.nt.cell();
        let mut state = cell.state.lock().unwrap();
        let record = state.record_mut(token);
        let value = record.pending.as_ref().unwrap_or(&record.value);
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value.clone()).map(Some).map_err(|e| {
            Error::InconsistentInternalState(format!("malformed {token} record: {e}"))
        })
    }

    fn set_record<T: serde::Serialize>(&self, token: &'static str, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value)
            .map_err(|e| Error::InvalidArguments(format!("unencodable {token} value: {e}")))?;
        self.nt.require_ready()?;
        let cell = self.nt.cell();
        let mut state = cell.state.lock().unwrap();
        state.record_mut(token).pending = Some(encoded);
        Ok(())
    }

    fn publish_record(&self, token: &'static str) -> Result<()> {
        let ops = self.nt.ops();
        let cell = self.nt.cell();
        self.nt.require_ready()?;
        require_publish_lock(ops, cell)?;

        let path = keys::meta_key(&cell.key, token);
        let (payload, expected) = {
            let mut state = cell.state.lock().unwrap();
            let record = state.record_mut(token);
            let value = record.pending.clone().unwrap_or_else(|| record.value.clone());
            (value, record.version.max(0))
        };

        let bytes = if payload.is_null() {
            Vec::new()
        } else {
            payload.to_string().into_bytes()
        };
        let new_version = ops.store.set_data(ops.session, &path, &bytes, expected)?;

        let mut state = cell.state.lock().unwrap();
        let record = state.record_mut(token);
        if new_version > record.version {
            record.value = payload;
            record.version = new_version;
        }
        record.pending = None;
        Ok(())
    }

    pub fn port_vec(&self) -> Result<Vec<u16>> {
        Ok(self.get_record(keys::PROCESS_SLOT_PORT_VEC)?.unwrap_or_default())
    }

    pub fn set_port_vec(&self, ports: Vec<u16>) -> Result<()> {
        self.set_record(keys::PROCESS_SLOT_PORT_VEC, &ports)
    }

    pub fn publish_port_vec(&self) -> Result<()> {
        self.publish_record(keys::PROCESS_SLOT_PORT_VEC)
    }

    pub fn exec_args(&self) -> Result<Option<ExecArgs>> {
        self.get_record(keys::PROCESS_SLOT_EXEC_ARGS)
    }

    pub fn set_exec_args(&self, args: &ExecArgs) -> Result<()> {
        self.set_record(keys::PROCESS_SLOT_EXEC_ARGS, args)
    }

    pub fn publish_exec_args(&self) -> Result<()> {
        self.publish_record(keys::PROCESS_SLOT_EXEC_ARGS)
    }

    /// The args the currently running process was started with; written by
    /// the external fork/exec collaborator.
    pub fn running_exec_args(&self) -> Result<Option<ExecArgs>> {
        self.get_record(keys::PROCESS_SLOT_RUNNING_EXEC_ARGS)
    }

    pub fn set_running_exec_args(&self, args: &ExecArgs) -> Result<()> {
        self.set_record(keys::PROCESS_SLOT_RUNNING_EXEC_ARGS, args)
    }

    pub fn publish_running_exec_args(&self) -> Result<()> {
        self.publish_record(keys::PROCESS_SLOT_RUNNING_EXEC_ARGS)
    }

    pub fn pid(&self) -> Result<Option<i64>> {
        self.get_record(keys::PROCESS_SLOT_PID)
    }

    pub fn set_pid(&self, pid: i64) -> Result<()> {
        self.set_record(keys::PROCESS_SLOT_PID, &pid)
    }

    pub fn publish_pid(&self) -> Result<()> {
        self.publish_record(keys::PROCESS_SLOT_PID)
    }

    pub fn reservation(&self) -> Result<Option<String>> {
        self.get_record(keys::PROCESS_SLOT_RESERVATION)
    }

    pub fn set_reservation(&self, owner: Option<String>) -> Result<()> {
        match owner {
            Some(owner) => self.set_record(keys::PROCESS_SLOT_RESERVATION, &owner),
            None => self.set_record(keys::PROCESS_SLOT_RESERVATION, &Value::Null),
        }
    }

    pub fn publish_reservation(&self) -> Result<()> {
        self.publish_record(keys::PROCESS_SLOT_RESERVATION)
    }
}

/// Accessor over a node's process-slot capacity records.
pub struct CachedSlotUsage<'a> {
    pub(crate) nt: &'a NotifyableRef,
}

impl<'a> CachedSlotUsage<'a> {
    fn info(&self) -> CachedProcessInfo<'a> {
        CachedProcessInfo { nt: self.nt }
    }

    pub fn max_slots(&self) -> Result<Option<i32>> {
        self.info().get_record(keys::PROCESS_SLOTS_MAX)
    }

    pub fn set_max_slots(&self, max: i32) -> Result<()> {
        self.info().set_record(keys::PROCESS_SLOTS_MAX, &max)
    }

    pub fn publish_max_slots(&self) -> Result<()> {
        self.info().publish_record(keys::PROCESS_SLOTS_MAX)
    }

    /// Slot usage vector, one entry per occupied slot.
    pub fn usage(&self) -> Result<Vec<String>> {
        Ok(self.info().get_record(keys::PROCESS_SLOTS_USAGE)?.unwrap_or_default())
    }

    pub fn set_usage(&self, usage: Vec<String>) -> Result<()> {
        self.info().set_record(keys::PROCESS_SLOTS_USAGE, &usage)
    }

    pub fn publish_usage(&self) -> Result<()> {
        self.info().publish_record(keys::PROCESS_SLOTS_USAGE)
    }
}

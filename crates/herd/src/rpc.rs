//! JSON-RPC over persistent queues.
//!
//! A request `{method, params, id}` (with an optional `destination` naming
//! the sender's response queue) is enqueued onto the receiver's queue. The
//! server side pops, dispatches through a name-keyed method registry, and
//! enqueues `{result|error, id}` onto the response queue. The caller
//! correlates responses by id in a pending table; unmatched responses are
//! retained up to a configurable cap and then discarded, oldest first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::cache::Queue;
use crate::client::Client;
use crate::{Error, Result};

/// How long a server/listener waits on its queue between shutdown checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const ERR_PARSE: i64 = -32700;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;

/// A request envelope.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<Value>,
    pub id: String,
    /// Key of the queue the response should be enqueued onto.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RpcError {
    pub message: String,
    pub code: i64,
}

/// A response envelope; exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<RpcError>,
    pub id: String,
}

impl RpcResponse {
    fn success(id: String, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    fn failure(id: String, message: impl Into<String>, code: i64) -> Self {
        Self {
            result: None,
            error: Some(RpcError {
                message: message.into(),
                code,
            }),
            id,
        }
    }
}

/// A callable method. Implementations declare their name, vet parameters,
/// and produce a result value.
pub trait RpcMethod: Send + Sync {
    fn name(&self) -> &str;

    /// Reject malformed parameter lists before invocation.
    fn check_params(&self, params: &[Value]) -> Result<()>;

    fn invoke(&self, params: &[Value]) -> std::result::Result<Value, RpcError>;
}

/// The method registry plus the serving loop.
pub struct RpcServer {
    client: Client,
    methods: Mutex<HashMap<String, Arc<dyn RpcMethod>>>,
    serving: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcServer {
    pub fn new(client: &Client) -> Arc<RpcServer> {
        Arc::new(RpcServer {
            client: client.clone(),
            methods: Mutex::new(HashMap::new()),
            serving: Mutex::new(Vec::new()),
        })
    }

    /// Register a method; false when the name is already taken.
    pub fn register(&self, method: Arc<dyn RpcMethod>) -> bool {
        let name = method.name().to_string();
        let mut methods = self.methods.lock().unwrap();
        if methods.contains_key(&name) {
            return false;
        }
        methods.insert(name, method);
        true
    }

    /// Unregister a method; false when the name is unknown.
    pub fn unregister(&self, name: &str) -> bool {
        self.methods.lock().unwrap().remove(name).is_some()
    }

    /// Serve requests arriving on `recv_queue` until factory shutdown or
    /// queue removal.
    pub fn start(self: &Arc<Self>, recv_queue: Queue) {
        let server = self.clone();
        let thread = std::thread::Builder::new()
            .name("rpc-server".into())
            .spawn(move || server.serve_loop(recv_queue))
            .expect("spawning the rpc server thread");
        self.serving.lock().unwrap().push(thread);
    }

    fn serve_loop(&self, recv_queue: Queue) {
        loop {
            let payload = match recv_queue.take_timeout(POLL_INTERVAL) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(Error::OperationCancelled) | Err(Error::ObjectRemoved(_)) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "rpc server failed to take a request");
                    break;
                }
            };
            self.handle_payload(&payload);
        }
        tracing::debug!(queue = recv_queue.key(), "rpc server loop exiting");
    }

    fn handle_payload(&self, payload: &[u8]) {
        let request: RpcRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                // Without an id there is nothing to correlate a response
                // to; the malformed request is dropped.
                tracing::warn!(error = %e, "dropping unparseable rpc request");
                return;
            }
        };
        let response = self.dispatch(&request);
        let Some(destination) = request.destination.as_deref() else {
            tracing::warn!(method = %request.method, id = %request.id, "rpc request without a destination; response dropped");
            return;
        };
        if let Err(e) = self.respond(destination, &response) {
            tracing::warn!(destination, error = %e, "failed to enqueue rpc response");
        }
    }

    fn dispatch(&self, request: &RpcRequest) -> RpcResponse {
        let method = {
            let methods = self.methods.lock().unwrap();
            methods.get(&request.method).cloned()
        };
        let Some(method) = method else {
            return RpcResponse::failure(
                request.id.clone(),
                format!("no method '{}' registered", request.method),
                ERR_METHOD_NOT_FOUND,
            );
        };
        if let Err(e) = method.check_params(&request.params) {
            return RpcResponse::failure(request.id.clone(), e.to_string(), ERR_INVALID_PARAMS);
        }
        match method.invoke(&request.params) {
            Ok(result) => RpcResponse::success(request.id.clone(), result),
            Err(error) => RpcResponse {
                result: None,
                error: Some(error),
                id: request.id.clone(),
            },
        }
    }

    fn respond(&self, destination: &str, response: &RpcResponse) -> Result<()> {
        let queue = self.client.notifyable_from_key(destination)?.as_queue()?;
        let bytes = serde_json::to_vec(response)
            .map_err(|e| Error::InconsistentInternalState(format!("unencodable response: {e}")))?;
        queue.put(&bytes)
    }

    /// Wait for the serving threads to wind down (they stop at factory
    /// shutdown).
    pub fn join(&self) {
        for thread in self.serving.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
    }
}

#[derive(Default)]
struct PendingState {
    /// Responses not yet claimed by a waiter, by request id.
    responses: HashMap<String, RpcResponse>,
    /// Ids this caller expects; anything else is subject to retention.
    expected: HashSet<String>,
    /// Arrival order of unexpected responses, for eviction.
    unexpected_order: VecDeque<String>,
}

struct Pending {
    state: Mutex<PendingState>,
    cond: Condvar,
}

/// The request side: sends to destination queues and correlates responses
/// arriving on this caller's response queue.
pub struct RpcCaller {
    response_queue_key: String,
    pending: Arc<Pending>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RpcCaller {
    /// Start a caller draining `response_queue`.
    pub fn new(client: &Client, response_queue: &Queue) -> RpcCaller {
        let pending = Arc::new(Pending {
            state: Mutex::new(PendingState::default()),
            cond: Condvar::new(),
        });
        let retention = client.ops.config.rpc_response_retention;

        let listener_pending = pending.clone();
        let listener_queue = response_queue.clone();
        let listener = std::thread::Builder::new()
            .name("rpc-response-listener".into())
            .spawn(move || listen_loop(listener_queue, listener_pending, retention))
            .expect("spawning the rpc listener thread");

        RpcCaller {
            response_queue_key: response_queue.key().to_string(),
            pending,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Send `method(params)` to `target`; returns the correlation id to
    /// pass to [`RpcCaller::wait_response`].
    pub fn call(&self, target: &Queue, method: &str, params: Vec<Value>) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let request = RpcRequest {
            method: method.to_string(),
            params,
            id: id.clone(),
            destination: Some(self.response_queue_key.clone()),
        };
        let bytes = serde_json::to_vec(&request)
            .map_err(|e| Error::InvalidArguments(format!("unencodable request: {e}")))?;

        {
            let mut state = self.pending.state.lock().unwrap();
            state.expected.insert(id.clone());
        }
        if let Err(e) = target.put(&bytes) {
            let mut state = self.pending.state.lock().unwrap();
            state.expected.remove(&id);
            return Err(e);
        }
        tracing::debug!(method, %id, target = target.key(), "rpc request sent");
        Ok(id)
    }

    /// Await the response for `id`; `None` when `timeout` passes first.
    pub fn wait_response(&self, id: &str, timeout: Duration) -> Result<Option<RpcResponse>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.pending.state.lock().unwrap();
        loop {
            if let Some(response) = state.responses.remove(id) {
                state.expected.remove(id);
                state.unexpected_order.retain(|other| other != id);
                return Ok(Some(response));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (next, _) = self.pending.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }

    /// Convenience: send and wait in one call.
    pub fn call_wait(
        &self,
        target: &Queue,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Option<RpcResponse>> {
        let id = self.call(target, method, params)?;
        self.wait_response(&id, timeout)
    }

    pub fn join(&self) {
        if let Some(thread) = self.listener.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn listen_loop(queue: Queue, pending: Arc<Pending>, retention: usize) {
    loop {
        let payload = match queue.take_timeout(POLL_INTERVAL) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(Error::OperationCancelled) | Err(Error::ObjectRemoved(_)) => break,
            Err(e) => {
                tracing::warn!(error = %e, "rpc listener failed to take a response");
                break;
            }
        };
        let response: RpcResponse = match serde_json::from_slice(&payload) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable rpc response");
                continue;
            }
        };

        let mut state = pending.state.lock().unwrap();
        let id = response.id.clone();
        if !state.expected.contains(&id) {
            state.unexpected_order.push_back(id.clone());
            while state.unexpected_order.len() > retention {
                if let Some(evicted) = state.unexpected_order.pop_front() {
                    state.responses.remove(&evicted);
                    tracing::debug!(id = %evicted, "discarding unmatched rpc response");
                }
            }
        }
        state.responses.insert(id, response);
        pending.cond.notify_all();
    }
    tracing::debug!(queue = queue.key(), "rpc listener loop exiting");
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_wire_shape() {
        let request = RpcRequest {
            method: "testMsg".into(),
            params: vec![json!({"k": "v"})],
            id: "abc-123".into(),
            destination: Some("/resp".into()),
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({
                "method": "testMsg",
                "params": [{"k": "v"}],
                "id": "abc-123",
                "destination": "/resp",
            })
        );

        // The destination hint is optional on the wire.
        let bare: RpcRequest =
            serde_json::from_value(json!({"method": "m", "params": [], "id": "1"})).unwrap();
        assert_eq!(bare.destination, None);
    }

    #[test]
    fn response_envelope_wire_shape() {
        let ok = RpcResponse::success("1".into(), json!("ok"));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"result": "ok", "id": "1"})
        );

        let err = RpcResponse::failure("2".into(), "boom", ERR_INTERNAL);
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"error": {"message": "boom", "code": -32603}, "id": "2"})
        );
    }

    #[test]
    fn json_round_trip_preserves_values() {
        let values = vec![
            json!(null),
            json!(true),
            json!(-17),
            json!(3.5),
            json!("text with \"quotes\" and \\ slashes"),
            json!([1, [2, [3]]]),
            json!({"nested": {"deep": {"leaf": [null, false]}}}),
        ];
        for value in values {
            let encoded = serde_json::to_vec(&value).unwrap();
            let decoded: Value = serde_json::from_slice(&encoded).unwrap();
            assert_eq!(decoded, value);
        }
    }
}

//! Clients: user-handler registries and the user-event dispatch thread.
//!
//! Each client owns a FIFO queue of `(notifyable key, event mask)` tuples
//! fed by the ingress thread, and one dispatch thread that invokes every
//! registered handler matching the tuple. Timer callbacks are delivered on
//! the same thread, so user code sees a single callback context per
//! client. Handlers must not block indefinitely and must not call back
//! into mutators for the path currently being dispatched.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::cache::{NotifyableRef, Root};
use crate::events::EventMask;
use crate::factory::Ops;
use crate::timers::TimerId;
use crate::{cache, Error, Result};

/// A delivered user event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEvent {
    /// Key of the notifyable the event concerns.
    pub key: String,
    pub mask: EventMask,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Callback = Arc<dyn Fn(&UserEvent) + Send + Sync>;

/// A handler registration: which object, which event categories, and the
/// callback to run on the dispatch thread.
pub struct UserEventHandler {
    key: String,
    mask: EventMask,
    callback: Callback,
}

impl UserEventHandler {
    pub fn new(
        nt: &NotifyableRef,
        mask: EventMask,
        callback: impl Fn(&UserEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: nt.key().to_string(),
            mask,
            callback: Arc::new(callback),
        }
    }

    /// A handler for events of an object identified only by key (useful
    /// for END_EVENT, which concerns no particular object).
    pub fn for_key(
        key: impl Into<String>,
        mask: EventMask,
        callback: impl Fn(&UserEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            mask,
            callback: Arc::new(callback),
        }
    }
}

pub(crate) enum QueueItem {
    Event(UserEvent),
    Timer { id: TimerId, payload: Value, handler: Arc<dyn Fn(TimerId, &Value) + Send + Sync> },
    End,
}

#[derive(Default)]
pub(crate) struct ClientCore {
    queue: Mutex<VecDeque<QueueItem>>,
    cond: Condvar,
    handlers: Mutex<Vec<(HandlerId, UserEventHandler)>>,
    next_handler: Mutex<u64>,
}

impl ClientCore {
    pub fn push(&self, item: QueueItem) {
        self.queue.lock().unwrap().push_back(item);
        self.cond.notify_all();
    }

    fn pop(&self) -> QueueItem {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(item) = queue.pop_front() {
                return item;
            }
            queue = self.cond.wait(queue).unwrap();
        }
    }
}

/// A handle to one client of a factory. Cheap to clone; all clones share
/// the handler registry and dispatch thread.
#[derive(Clone)]
pub struct Client {
    pub(crate) core: Arc<ClientCore>,
    pub(crate) ops: Arc<Ops>,
}

impl Client {
    /// The root of the object graph.
    pub fn root(&self) -> Result<Root> {
        cache::root(&self.ops)
    }

    /// Resolve an arbitrary object key to a handle.
    pub fn notifyable_from_key(&self, key: &str) -> Result<NotifyableRef> {
        cache::notifyable_from_key(&self.ops, key)
    }

    /// Register a handler; it runs on this client's dispatch thread for
    /// every event whose key and mask match.
    pub fn register_handler(&self, handler: UserEventHandler) -> HandlerId {
        let mut next = self.core.next_handler.lock().unwrap();
        *next += 1;
        let id = HandlerId(*next);
        drop(next);
        self.core.handlers.lock().unwrap().push((id, handler));
        id
    }

    /// Unregister; false when the id is unknown.
    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.core.handlers.lock().unwrap();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    /// Schedule `handler(id, &payload)` on this client's dispatch thread
    /// after `after`.
    pub fn register_timer(
        &self,
        after: Duration,
        payload: Value,
        handler: impl Fn(TimerId, &Value) + Send + Sync + 'static,
    ) -> Result<TimerId> {
        if self.ops.is_shutdown() {
            return Err(Error::OperationCancelled);
        }
        let core = Arc::downgrade(&self.core);
        let handler: Arc<dyn Fn(TimerId, &Value) + Send + Sync> = Arc::new(handler);
        // The id is assigned by the service; thread the fire closure
        // through a slot it can read its own id from.
        let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
        let fire_slot = slot.clone();
        // Holding the slot across schedule() keeps a nearly-due timer from
        // firing before it can read its own id.
        let mut guard = slot.lock().unwrap();
        let id = self.ops.timers.schedule(
            after,
            Box::new(move || {
                let Some(core) = core.upgrade() else { return };
                let id = fire_slot
                    .lock()
                    .unwrap()
                    .expect("timer id published before any fire");
                core.push(QueueItem::Timer {
                    id,
                    payload,
                    handler,
                });
            }),
        );
        *guard = Some(id);
        drop(guard);
        Ok(id)
    }

    /// Cancel a pending timer; false when it already fired or was already
    /// cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.ops.timers.cancel(id)
    }
}

/// The dispatch loop: runs until the end sentinel, which is delivered to
/// END_EVENT handlers exactly once.
pub(crate) fn run_dispatch(core: Arc<ClientCore>) {
    loop {
        match core.pop() {
            QueueItem::Event(event) => {
                let matching: Vec<Callback> = {
                    let handlers = core.handlers.lock().unwrap();
                    handlers
                        .iter()
                        .filter(|(_, h)| h.key == event.key && h.mask.intersects(event.mask))
                        .map(|(_, h)| h.callback.clone())
                        .collect()
                };
                for callback in matching {
                    callback(&event);
                }
            }
            QueueItem::Timer { id, payload, handler } => {
                handler(id, &payload);
            }
            QueueItem::End => {
                let event = UserEvent {
                    key: String::new(),
                    mask: EventMask::END_EVENT,
                };
                let matching: Vec<Callback> = {
                    let handlers = core.handlers.lock().unwrap();
                    handlers
                        .iter()
                        .filter(|(_, h)| h.mask.intersects(EventMask::END_EVENT))
                        .map(|(_, h)| h.callback.clone())
                        .collect()
                };
                for callback in matching {
                    callback(&event);
                }
                tracing::debug!("client dispatch thread exiting");
                return;
            }
        }
    }
}

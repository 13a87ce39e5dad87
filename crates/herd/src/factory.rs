//! The factory: one store session, the pipeline threads, and the services
//! shared by every client it creates.
//!
//! Factories are process-scoped but not global; several may coexist in one
//! process with separate sessions. All configuration flows through
//! [`Factory::open`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;

use crate::cache::{Node, Registry};
use crate::client::{Client, ClientCore, QueueItem, UserEvent};
use crate::events::{ChangeKind, EventMask};
use crate::periodic::{PeriodicId, PeriodicTask, Runner};
use crate::pipeline::{self, ReadyTable};
use crate::signal::{SignalMap, Wait};
use crate::store::{SessionId, Store, StoreEvent};
use crate::timers::TimerService;
use crate::{cache, keys, locks, Error, LockMode, Result};

/// Factory configuration. The connect string and session timeout are
/// handed to the store adapter; the in-process store ignores them.
#[derive(Debug, Clone)]
pub struct Config {
    pub connect: String,
    pub session_timeout: Duration,
    /// Unmatched RPC responses retained before the oldest is discarded.
    pub rpc_response_retention: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect: "localhost:2181".to_string(),
            session_timeout: Duration::from_secs(30),
            rpc_response_retention: 64,
        }
    }
}

/// Shared internals: everything a handle needs to talk to the store, the
/// cache and the pipeline.
pub(crate) struct Ops {
    pub store: Arc<dyn Store>,
    pub session: SessionId,
    pub config: Config,
    pub host: String,
    pub ready: ReadyTable,
    pub signals: SignalMap,
    pub registry: Registry,
    pub timers: TimerService,
    pub periodic: Runner,
    clients: Mutex<Vec<Arc<ClientCore>>>,
    shutdown: AtomicBool,
    next_sync: AtomicU64,
}

impl Ops {
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Fan a user event out to every client's dispatch queue.
    pub fn deliver(&self, key: &str, mask: EventMask) {
        let clients: Vec<Arc<ClientCore>> = self.clients.lock().unwrap().clone();
        tracing::trace!(%key, ?mask, clients = clients.len(), "delivering user event");
        for core in clients {
            core.push(QueueItem::Event(UserEvent {
                key: key.to_string(),
                mask,
            }));
        }
    }

    /// Flush barrier: returns once every event that preceded this call on
    /// this session has been applied to the cache.
    pub fn synchronize(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::OperationCancelled);
        }
        let id = self.next_sync.fetch_add(1, Ordering::SeqCst) + 1;
        let signal_key = pipeline::sync_signal_key(id);

        let cell = self.signals.add_ref(&signal_key);
        let seen = cell.epoch();
        self.ready.set_ready(ChangeKind::Synchronize, &signal_key)?;
        if let Err(e) = self.store.sync(self.session, &keys::root_key(), id) {
            self.signals.remove_ref(&signal_key);
            return Err(e);
        }
        let outcome = cell.wait_change(seen, None);
        self.signals.remove_ref(&signal_key);
        match outcome {
            Wait::Signalled => Ok(()),
            Wait::Cancelled => Err(Error::OperationCancelled),
            Wait::TimedOut => Err(Error::InconsistentInternalState(
                "unbounded sync wait timed out".into(),
            )),
        }
    }

    /// Session-expiry and fatal-invariant path: tear the pipeline down.
    pub fn expire(&self) {
        self.shutdown_fanout();
    }

    pub(crate) fn shutdown_fanout(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("factory shutting down");
        self.signals.cancel_all();
        self.periodic.shutdown();
        self.timers.shutdown();
        let clients: Vec<Arc<ClientCore>> = self.clients.lock().unwrap().clone();
        for core in clients {
            core.push(QueueItem::End);
        }
        self.store.close(self.session);
    }
}

/// Owner of one coordination session: store connection, ingress thread,
/// per-client dispatch threads, timers and periodic tasks.
pub struct Factory {
    ops: Arc<Ops>,
    ingress: Mutex<Option<JoinHandle<()>>>,
    ingress_tx: Mutex<Option<mpsc::Sender<StoreEvent>>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Factory {
    /// Open a session against `store` and bring up the pipeline. The
    /// namespace root is created if this is the first client ever.
    pub fn open(store: Arc<dyn Store>, config: Config) -> Result<Factory> {
        let host = locks::local_hostname()?;
        let (tx, rx) = mpsc::channel();
        let session = store.attach(tx.clone());

        let ops = Arc::new(Ops {
            store,
            session,
            config,
            host,
            ready: ReadyTable::new(),
            signals: SignalMap::new(),
            registry: Registry::new(),
            timers: TimerService::new(),
            periodic: Runner::new(),
            clients: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            next_sync: AtomicU64::new(0),
        });

        // Make sure the namespace exists and the root is cached before any
        // client asks for it.
        cache::root(&ops)?;

        let ingress_ops = ops.clone();
        let ingress = std::thread::Builder::new()
            .name("event-ingress".into())
            .spawn(move || pipeline::run_ingress(ingress_ops, rx))
            .expect("spawning the ingress thread");

        tracing::debug!(session, "factory opened");
        Ok(Factory {
            ops,
            ingress: Mutex::new(Some(ingress)),
            ingress_tx: Mutex::new(Some(tx)),
            dispatchers: Mutex::new(Vec::new()),
        })
    }

    /// Create a client with its own handler registry and dispatch thread.
    pub fn create_client(&self) -> Client {
        let core = Arc::new(ClientCore::default());
        self.ops.clients.lock().unwrap().push(core.clone());

        let dispatch_core = core.clone();
        let thread = std::thread::Builder::new()
            .name("user-event-dispatch".into())
            .spawn(move || crate::client::run_dispatch(dispatch_core))
            .expect("spawning a dispatch thread");
        self.dispatchers.lock().unwrap().push(thread);

        Client {
            core,
            ops: self.ops.clone(),
        }
    }

    /// Flush barrier over this session; see the sync contract.
    pub fn synchronize(&self) -> Result<()> {
        self.ops.synchronize()
    }

    pub fn register_periodic(&self, task: PeriodicTask) -> PeriodicId {
        self.ops.periodic.register(task)
    }

    /// Cancel a periodic task, waiting out an in-flight run.
    pub fn cancel_periodic(&self, id: PeriodicId) -> bool {
        self.ops.periodic.cancel(id)
    }

    /// Register the conventional liveness task: every `period`, probe and
    /// publish a `HEALTH` entry through the node's current state. The
    /// health value itself is opaque to the library.
    pub fn register_health_monitor(
        &self,
        node: &Node,
        period: Duration,
        probe: impl Fn() -> Value + Send + 'static,
    ) -> PeriodicId {
        let node = node.clone();
        let name = format!("health:{}", node.key());
        self.register_periodic(PeriodicTask::new(name, period, move || {
            if !node.acquire_lock_timeout(keys::NOTIFYABLE_LOCK, LockMode::Exclusive, period)? {
                anyhow::bail!("notifyable lock busy; skipping this probe");
            }
            let result = (|| {
                let state = node.cached_current_state();
                state.set(keys::HEALTH_KEY, probe())?;
                state.publish()
            })();
            node.release_lock(keys::NOTIFYABLE_LOCK)?;
            result.map_err(Into::into)
        }))
    }

    /// Deliver the end event and stop every thread. Idempotent; also runs
    /// on drop.
    pub fn shutdown(&self) {
        self.ops.shutdown_fanout();
        self.ingress_tx.lock().unwrap().take();
        if let Some(thread) = self.ingress.lock().unwrap().take() {
            let _ = thread.join();
        }
        for thread in self.dispatchers.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for Factory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

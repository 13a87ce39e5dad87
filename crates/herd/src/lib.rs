//! A cluster-coordination library over a hierarchical, watch-capable
//! metadata store.
//!
//! Applications see a typed object model — applications, groups, nodes,
//! process slots, data distributions, property lists, queues — kept coherent
//! across processes by a watch-driven event pipeline. On top of the object
//! model the library layers distributed locking (exclusive and shared),
//! leader election, hash-range shard routing, periodic task scheduling, and
//! a JSON-RPC request/response fabric over persistent queues.
//!
//! Entry point is [`Factory`], which owns a store session and the pipeline
//! threads. [`Factory::create_client`] hands out [`Client`]s, through which
//! the object graph is reached via [`Client::root`].

mod cache;
mod cached;
mod client;
mod events;
mod factory;
pub mod keys;
mod locks;
mod periodic;
mod pipeline;
pub mod rpc;
mod shards;
mod signal;
pub mod store;
mod timers;

pub use cache::{
    Application, DataDistribution, Group, Kind, Node, NotifyableRef, ProcessSlot, PropertyList,
    Queue, Root,
};
pub use cached::{
    CachedKeyValues, CachedProcessInfo, CachedSlotUsage, CachedState, ExecArgs, StateRecord,
};
pub use client::{Client, HandlerId, UserEvent, UserEventHandler};
pub use events::{ChangeKind, EventMask};
pub use factory::{Config, Factory};
pub use locks::{LockBid, LockMode};
pub use periodic::{PeriodicId, PeriodicTask};
pub use rpc::{RpcCaller, RpcError, RpcMethod, RpcRequest, RpcResponse, RpcServer};
pub use shards::{CachedShards, Shard, HASH_RANGE_MAX};
pub use timers::TimerId;

/// Get-vs-create behavior of the typed accessors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessMode {
    /// Load the object if it exists in the repository; fail with
    /// [`Error::NoNode`] otherwise.
    LoadIfPresent,
    /// Create the object's repository entries first if they are missing.
    CreateIfMissing,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("operation not legal for this object: {0}")]
    InvalidMethod(String),

    #[error("object '{0}' has been removed")]
    ObjectRemoved(String),

    /// An internal invariant does not hold. Callers cannot recover; the
    /// owning factory is unusable.
    #[error("inconsistent internal state: {0}")]
    InconsistentInternalState(String),

    /// Optimistic-concurrency conflict on a versioned publish. Recoverable:
    /// re-read (the armed watch refreshes the cache) and retry.
    #[error("version conflict publishing '{path}': expected {expected}, store has {actual}")]
    PublishVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("store session expired")]
    SessionExpired,

    #[error("operation cancelled by shutdown")]
    OperationCancelled,

    #[error("system call failed: {0}")]
    SystemFailure(String),

    #[error("no store node at '{0}'")]
    NoNode(String),

    #[error("store node already exists at '{0}'")]
    NodeExists(String),

    #[error("missing parent for store node '{0}'")]
    NoParent(String),

    #[error("store node '{0}' still has children")]
    NotEmpty(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for conflicts a caller is expected to retry after a re-read.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PublishVersion { .. })
    }
}

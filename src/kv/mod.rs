//! Gateway to the backing key-value store.
//!
//! The queue engine talks to a linearizable KV through the [`KvStore`]
//! trait, which hides whether the store is remote or embedded. Available
//! backends:
//!
//! - `etcd`: a remote etcd cluster
//! - `embedded`: an in-process single-node server, for standalone
//!   deployments with no external dependencies

pub mod embedded;
pub mod etcd;

pub use embedded::{EmbeddedKv, EmbeddedKvServer};
pub use etcd::EtcdKv;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for gateway operations.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server is stopping")]
    Stopping,
    #[error("startup canceled")]
    StartupCanceled,
}

impl From<etcd_client::Error> for KvError {
    fn from(err: etcd_client::Error) -> Self {
        KvError::Backend(err.to_string())
    }
}

/// Kind of an observed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

/// A single observed mutation.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    /// New value; empty for delete events.
    pub value: Bytes,
    /// Value before the mutation, present when the watch asked for
    /// previous-value retention.
    pub prev_value: Option<Bytes>,
}

/// One watch response. Single-key watches are expected to deliver exactly
/// one event per batch; the engine treats anything else as a protocol
/// violation.
#[derive(Debug, Clone)]
pub struct WatchBatch {
    pub events: Vec<KvEvent>,
}

/// Options for [`KvStore::watch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KvWatchOptions {
    pub(crate) prefix: bool,
    pub(crate) prev_value: bool,
}

impl KvWatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch every key under the given prefix instead of a single key.
    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    /// Retain the previous value of the key on each event.
    pub fn with_prev_value(mut self) -> Self {
        self.prev_value = true;
        self
    }
}

/// Stream of watch batches, uniform across backends.
pub struct KvWatchStream {
    rx: mpsc::UnboundedReceiver<WatchBatch>,
}

impl KvWatchStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<WatchBatch>) -> Self {
        Self { rx }
    }

    /// Next batch, or `None` once the watch is closed by the store.
    pub async fn message(&mut self) -> Option<WatchBatch> {
        self.rx.recv().await
    }
}

/// Operations the queue requires from the backing store.
///
/// Implementations must preserve total ordering between their own
/// mutations and subsequent watch events for the same key: a caller that
/// returns from [`put`](KvStore::put) is guaranteed that every watch of
/// that key opened before the call will observe the event, unless the
/// watcher is closed first.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Blind overwrite.
    async fn put(&self, key: &str, value: Bytes) -> Result<(), KvError>;

    /// Idempotent removal; returns the number of keys deleted.
    async fn delete(&self, key: &str) -> Result<i64, KvError>;

    /// The lexicographically smallest key under the prefix, with its
    /// value, if any.
    async fn first_with_prefix(&self, prefix: &str) -> Result<Option<(String, Bytes)>, KvError>;

    /// Open a watch on a key, or on a prefix per the options.
    async fn watch(&self, key: &str, options: KvWatchOptions) -> Result<KvWatchStream, KvError>;

    /// A linearizable read, used to force leader election at startup.
    async fn linearizable_get(&self, key: &str) -> Result<Option<Bytes>, KvError>;
}

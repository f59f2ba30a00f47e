//! The queue engine.
//!
//! [`Queue`] implements the public contract: `enqueue` schedules an item
//! and streams every observed change back to the caller, `front` yields
//! the highest-weight unfinished item of a bucket, `dequeue` removes an
//! item, and `watch` follows an already-scheduled item. Scheduled items
//! live under `_schd/`; items that reach terminal progress move to
//! `_cmpl/`.
//!
//! Split across submodules by operation:
//!
//! - `enqueue`: write path and the per-item watcher fan-in
//! - `front`: first-key reads with a watch fallback for empty buckets
//! - `dequeue`: unconditional removal
//! - `watch`: long-lived key watches

mod dequeue;
mod enqueue;
mod front;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::item::Item;
use crate::kv::{EmbeddedKvServer, EtcdKv, KvError, KvStore};
use crate::settings::EmbeddedKvConfig;

/// Capacity of the update streams returned by `enqueue` and `watch`.
// TODO: make this configurable
pub(crate) const UPDATE_STREAM_CAPACITY: usize = 100;

const READINESS_TIMEOUT: Duration = Duration::from_secs(5);
const READINESS_KEY: &str = "readiness";

/// Error type for queue operations that return a `Result`. Operations
/// that return an [`ItemStream`] surface failures as a single item with a
/// non-empty `error` instead.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("readiness probe failed after {0:?}")]
    ProbeTimeout(Duration),
    #[error("operation canceled")]
    Canceled,
}

/// Priority job queue backed by a linearizable KV store.
///
/// The engine holds one shared KV client. Update streams hold no
/// reference back to the engine; they close when their context is
/// canceled or their terminal event arrives.
pub struct Queue {
    pub(crate) kv: Arc<dyn KvStore>,
    /// Serializes enqueue/dequeue mutations so a key is visible in at
    /// most one namespace at any instant. Never held across stream
    /// delivery.
    pub(crate) mu: Mutex<()>,
    pub(crate) root: CancellationToken,
    endpoints: Vec<String>,
    embedded: Option<EmbeddedKvServer>,
}

impl Queue {
    /// Create a queue over an existing gateway. Issues the readiness
    /// probe before returning; a probe failure fails construction.
    pub async fn new(kv: Arc<dyn KvStore>, endpoints: Vec<String>) -> Result<Self, QueueError> {
        readiness_probe(kv.as_ref()).await?;
        Ok(Self {
            kv,
            mu: Mutex::new(()),
            root: CancellationToken::new(),
            endpoints,
            embedded: None,
        })
    }

    /// Connect to a remote etcd cluster and create a queue on top of it.
    pub async fn connect(endpoints: &[String]) -> Result<Self, QueueError> {
        info!(endpoints = ?endpoints, "connecting queue to remote kv");
        let kv = EtcdKv::connect(endpoints).await?;
        Self::new(Arc::new(kv), endpoints.to_vec()).await
    }

    /// Start an embedded single-node server and a queue on top of it.
    ///
    /// Construction fails when the server fails to start or the readiness
    /// probe fails; a partially started server is torn down.
    pub async fn start_embedded(
        ctx: &CancellationToken,
        cfg: &EmbeddedKvConfig,
    ) -> Result<Self, QueueError> {
        let server = EmbeddedKvServer::start(ctx, cfg).await?;
        let kv: Arc<dyn KvStore> = Arc::new(server.client());
        if let Err(err) = readiness_probe(kv.as_ref()).await {
            server.shutdown();
            return Err(err);
        }
        let endpoints = vec![server.client_endpoint().to_string()];
        info!(endpoint = %endpoints[0], "started queue with embedded kv server");
        Ok(Self {
            kv,
            mu: Mutex::new(()),
            root: ctx.child_token(),
            endpoints,
            embedded: Some(server),
        })
    }

    /// Stop the queue: terminate every in-flight watcher, then stop the
    /// embedded server when one is owned.
    pub async fn stop(&self) {
        let _guard = self.mu.lock().await;
        info!("stopping queue");
        self.root.cancel();
        if let Some(server) = &self.embedded {
            server.shutdown();
        }
        info!("stopped queue");
    }

    /// The shared KV client.
    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    /// Endpoints of the backing store.
    pub fn client_endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

/// One linearizable read with a short timeout, forcing leader election in
/// the backing store so the first real operation does not pay election
/// latency. The probe key is never mutated.
async fn readiness_probe(kv: &dyn KvStore) -> Result<(), QueueError> {
    match tokio::time::timeout(READINESS_TIMEOUT, kv.linearizable_get(READINESS_KEY)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(QueueError::ProbeTimeout(READINESS_TIMEOUT)),
    }
}

/// Bounded, single-consumer stream of successive states of one item.
///
/// Closed when the item terminates, an error item is emitted, or the
/// caller's context is canceled. If the consumer is slow the producing
/// task blocks; updates are never dropped.
pub struct ItemStream {
    rx: mpsc::Receiver<Item>,
}

impl ItemStream {
    pub(crate) fn new(rx: mpsc::Receiver<Item>) -> Self {
        Self { rx }
    }

    /// Next observed state, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<Item> {
        self.rx.recv().await
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> ReceiverStream<Item> {
        ReceiverStream::new(self.rx)
    }
}

//! In-process single-node KV server.
//!
//! When no external store is available the queue can own an embedded
//! server. Mutations are appended to an operation log under the configured
//! data directory and folded into a snapshot every
//! `snapshot_entry_count` entries to bound replay cost; a periodic
//! compaction task folds accumulated history on the retention interval.
//! Client and peer ports are both bound on localhost for parity with a
//! networked deployment, the peer port even though the cluster is a single
//! node; the in-process client handle returned by
//! [`EmbeddedKvServer::client`] bypasses the socket.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kv::{
    KvError, KvEvent, KvEventKind, KvStore, KvWatchOptions, KvWatchStream, WatchBatch,
};
use crate::settings::EmbeddedKvConfig;

const LOG_FILE: &str = "kv.log";
const SNAPSHOT_FILE: &str = "kv.snapshot";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogOp {
    Put,
    Delete,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    index: u64,
    op: LogOp,
    key: String,
    #[serde(default)]
    value: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    applied: u64,
    entries: Vec<(String, Vec<u8>)>,
}

#[derive(Debug)]
struct WatcherEntry {
    target: String,
    prefix: bool,
    prev_value: bool,
    tx: mpsc::UnboundedSender<WatchBatch>,
}

#[derive(Debug)]
struct StoreInner {
    entries: BTreeMap<String, Bytes>,
    watchers: Vec<WatcherEntry>,
    log: File,
    log_path: PathBuf,
    snapshot_path: PathBuf,
    applied: u64,
    since_snapshot: u64,
    snapshot_every: u64,
}

impl StoreInner {
    fn open(data_dir: &Path, snapshot_every: u64) -> Result<Self, KvError> {
        fs::create_dir_all(data_dir)?;
        let log_path = data_dir.join(LOG_FILE);
        let snapshot_path = data_dir.join(SNAPSHOT_FILE);

        let mut entries = BTreeMap::new();
        let mut applied = 0u64;
        if snapshot_path.exists() {
            let data = fs::read(&snapshot_path)?;
            let snapshot: Snapshot = serde_json::from_slice(&data)
                .map_err(|e| KvError::Backend(format!("corrupt snapshot: {e}")))?;
            applied = snapshot.applied;
            for (key, value) in snapshot.entries {
                entries.insert(key, Bytes::from(value));
            }
        }

        let mut replayed = 0u64;
        if log_path.exists() {
            let reader = BufReader::new(File::open(&log_path)?);
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let record: LogRecord = serde_json::from_str(&line)
                    .map_err(|e| KvError::Backend(format!("corrupt log record: {e}")))?;
                // Entries at or below the snapshot index are already folded in.
                if record.index <= applied {
                    continue;
                }
                match record.op {
                    LogOp::Put => {
                        entries.insert(record.key, Bytes::from(record.value));
                    }
                    LogOp::Delete => {
                        entries.remove(&record.key);
                    }
                }
                applied = record.index;
                replayed += 1;
            }
        }

        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        if replayed > 0 {
            info!(entries = entries.len(), replayed, "embedded kv: replayed operation log");
        }

        Ok(Self {
            entries,
            watchers: Vec::new(),
            log,
            log_path,
            snapshot_path,
            applied,
            since_snapshot: replayed,
            snapshot_every,
        })
    }

    fn append(&mut self, op: LogOp, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.applied += 1;
        let record = LogRecord {
            index: self.applied,
            op,
            key: key.to_string(),
            value: value.to_vec(),
        };
        let mut line =
            serde_json::to_vec(&record).map_err(|e| KvError::Backend(e.to_string()))?;
        line.push(b'\n');
        self.log.write_all(&line)?;
        self.log.flush()?;
        self.since_snapshot += 1;
        if self.since_snapshot >= self.snapshot_every {
            self.snapshot()?;
        }
        Ok(())
    }

    /// Fold the current state into a snapshot file and truncate the log.
    fn snapshot(&mut self) -> Result<(), KvError> {
        let snapshot = Snapshot {
            applied: self.applied,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_vec()))
                .collect(),
        };
        let data =
            serde_json::to_vec(&snapshot).map_err(|e| KvError::Backend(e.to_string()))?;
        let tmp = self.snapshot_path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.snapshot_path)?;
        self.log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.log_path)?;
        self.since_snapshot = 0;
        debug!(
            applied = self.applied,
            entries = self.entries.len(),
            "embedded kv: snapshot taken"
        );
        Ok(())
    }

    /// Deliver one event to every matching watcher, dropping watchers
    /// whose stream has been closed. Dispatch happens under the store lock
    /// so watchers observe mutations in apply order.
    fn dispatch(&mut self, event: KvEvent) {
        self.watchers.retain(|watcher| {
            let matched = if watcher.prefix {
                event.key.starts_with(&watcher.target)
            } else {
                event.key == watcher.target
            };
            if !matched {
                return true;
            }
            let mut event = event.clone();
            if !watcher.prev_value {
                event.prev_value = None;
            }
            watcher
                .tx
                .send(WatchBatch {
                    events: vec![event],
                })
                .is_ok()
        });
    }
}

/// In-process client handle for an embedded server.
#[derive(Clone)]
pub struct EmbeddedKv {
    state: Arc<Mutex<StoreInner>>,
    stop: CancellationToken,
}

#[async_trait]
impl KvStore for EmbeddedKv {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        if self.stop.is_cancelled() {
            return Err(KvError::Stopping);
        }
        let mut state = self.state.lock().await;
        let prev = state.entries.get(key).cloned();
        state.append(LogOp::Put, key, &value)?;
        state.entries.insert(key.to_string(), value.clone());
        state.dispatch(KvEvent {
            kind: KvEventKind::Put,
            key: key.to_string(),
            value,
            prev_value: prev,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<i64, KvError> {
        if self.stop.is_cancelled() {
            return Err(KvError::Stopping);
        }
        let mut state = self.state.lock().await;
        if !state.entries.contains_key(key) {
            return Ok(0);
        }
        state.append(LogOp::Delete, key, &[])?;
        let prev = state.entries.remove(key);
        state.dispatch(KvEvent {
            kind: KvEventKind::Delete,
            key: key.to_string(),
            value: Bytes::new(),
            prev_value: prev,
        });
        Ok(1)
    }

    async fn first_with_prefix(&self, prefix: &str) -> Result<Option<(String, Bytes)>, KvError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .next()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone())))
    }

    async fn watch(&self, key: &str, options: KvWatchOptions) -> Result<KvWatchStream, KvError> {
        if self.stop.is_cancelled() {
            return Err(KvError::Stopping);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.watchers.push(WatcherEntry {
            target: key.to_string(),
            prefix: options.prefix,
            prev_value: options.prev_value,
            tx,
        });
        Ok(KvWatchStream::new(rx))
    }

    async fn linearizable_get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        // A single-node store serves every read from its only replica.
        let state = self.state.lock().await;
        Ok(state.entries.get(key).cloned())
    }
}

/// Handle to a running embedded server.
#[derive(Debug)]
pub struct EmbeddedKvServer {
    state: Arc<Mutex<StoreInner>>,
    stop: CancellationToken,
    client_url: String,
    peer_url: String,
}

impl EmbeddedKvServer {
    /// Start a single-node embedded server.
    ///
    /// Resolves once the server signals ready; fails when the server
    /// reports a startup error, stops before becoming ready, or `ctx` is
    /// canceled first. A failed startup tears down anything the server had
    /// already claimed.
    pub async fn start(ctx: &CancellationToken, cfg: &EmbeddedKvConfig) -> Result<Self, KvError> {
        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (error_tx, error_rx) = oneshot::channel();

        info!(data_dir = %cfg.data_dir, "embedded kv: starting server");
        tokio::spawn(run_server(cfg.clone(), stop.clone(), ready_tx, error_tx));

        tokio::select! {
            ready = ready_rx => match ready {
                Ok(server) => Ok(server),
                Err(_) => Err(KvError::Stopping),
            },
            error = error_rx => match error {
                Ok(err) => Err(err),
                Err(_) => Err(KvError::Stopping),
            },
            _ = stop.cancelled() => Err(KvError::Stopping),
            _ = ctx.cancelled() => {
                stop.cancel();
                Err(KvError::StartupCanceled)
            }
        }
    }

    /// An in-process client for this server.
    pub fn client(&self) -> EmbeddedKv {
        EmbeddedKv {
            state: self.state.clone(),
            stop: self.stop.clone(),
        }
    }

    /// The URL clients would dial; the port reflects the bound listener.
    pub fn client_endpoint(&self) -> &str {
        &self.client_url
    }

    /// The peer URL, reserved even for a single-node cluster.
    pub fn peer_endpoint(&self) -> &str {
        &self.peer_url
    }

    /// Stop the server. In-process clients fail with
    /// [`KvError::Stopping`] afterwards.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

async fn run_server(
    cfg: EmbeddedKvConfig,
    stop: CancellationToken,
    ready_tx: oneshot::Sender<EmbeddedKvServer>,
    error_tx: oneshot::Sender<KvError>,
) {
    // Both ports are required even for a single-node cluster; the peer
    // listener only reserves its port.
    let client_listener = match TcpListener::bind(("127.0.0.1", cfg.client_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            let _ = error_tx.send(err.into());
            return;
        }
    };
    let peer_listener = match TcpListener::bind(("127.0.0.1", cfg.peer_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            let _ = error_tx.send(err.into());
            return;
        }
    };

    let urls = client_listener
        .local_addr()
        .and_then(|client| peer_listener.local_addr().map(|peer| (client, peer)));
    let (client_addr, peer_addr) = match urls {
        Ok(addrs) => addrs,
        Err(err) => {
            let _ = error_tx.send(err.into());
            return;
        }
    };
    let client_url = format!("http://localhost:{}", client_addr.port());
    let peer_url = format!("http://localhost:{}", peer_addr.port());

    let inner = match StoreInner::open(Path::new(&cfg.data_dir), cfg.snapshot_entry_count.max(1)) {
        Ok(inner) => inner,
        Err(err) => {
            let _ = error_tx.send(err);
            return;
        }
    };
    let state = Arc::new(Mutex::new(inner));

    info!(client_url = %client_url, peer_url = %peer_url, "embedded kv: server ready");
    let server = EmbeddedKvServer {
        state: state.clone(),
        stop: stop.clone(),
        client_url,
        peer_url,
    };
    if ready_tx.send(server).is_err() {
        // Caller gave up before ready; the listeners drop here.
        return;
    }

    // Hold the listeners and fold accumulated history into snapshots on
    // the retention interval until shutdown.
    let retention = Duration::from_secs(cfg.compaction_retention_hours.max(1) * 3600);
    let mut compaction = interval_at(Instant::now() + retention, retention);
    loop {
        tokio::select! {
            _ = compaction.tick() => {
                let mut inner = state.lock().await;
                if let Err(err) = inner.snapshot() {
                    warn!(error = %err, "embedded kv: periodic compaction failed");
                }
            }
            _ = stop.cancelled() => break,
        }
    }

    // Final snapshot so a restart replays from a compact image.
    {
        let mut inner = state.lock().await;
        if let Err(err) = inner.snapshot() {
            warn!(error = %err, "embedded kv: final snapshot failed");
        }
    }
    drop(client_listener);
    drop(peer_listener);
    info!("embedded kv: server stopped");
}

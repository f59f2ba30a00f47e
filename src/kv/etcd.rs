//! Remote backend over an etcd cluster.

use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, SortOrder, SortTarget, WatchOptions,
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::kv::{
    KvError, KvEvent, KvEventKind, KvStore, KvWatchOptions, KvWatchStream, WatchBatch,
};

/// Gateway to a remote etcd cluster.
///
/// etcd multiplexes watches internally, so every [`watch`](KvStore::watch)
/// call gets its own subscription without a shared pool.
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    /// Connect to the given endpoints, falling back to the conventional
    /// local endpoint when none are configured.
    pub async fn connect(endpoints: &[String]) -> Result<Self, KvError> {
        let endpoints = if endpoints.is_empty() {
            vec!["http://127.0.0.1:2379".to_string()]
        } else {
            endpoints.to_vec()
        };
        let client = Client::connect(endpoints, Some(ConnectOptions::default()))
            .await
            .map_err(|e| KvError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client })
    }
}

fn convert_event(event: &etcd_client::Event) -> KvEvent {
    let (key, value) = match event.kv() {
        Some(kv) => (
            String::from_utf8_lossy(kv.key()).into_owned(),
            Bytes::copy_from_slice(kv.value()),
        ),
        None => (String::new(), Bytes::new()),
    };
    KvEvent {
        kind: if event.event_type() == EventType::Delete {
            KvEventKind::Delete
        } else {
            KvEventKind::Put
        },
        key,
        value,
        prev_value: event.prev_kv().map(|kv| Bytes::copy_from_slice(kv.value())),
    }
}

#[async_trait]
impl KvStore for EtcdKv {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        self.client.kv_client().put(key, value.to_vec(), None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<i64, KvError> {
        let resp = self.client.kv_client().delete(key, None).await?;
        Ok(resp.deleted())
    }

    async fn first_with_prefix(&self, prefix: &str) -> Result<Option<(String, Bytes)>, KvError> {
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend)
            .with_limit(1);
        let resp = self.client.kv_client().get(prefix, Some(options)).await?;
        Ok(resp.kvs().first().map(|kv| {
            (
                String::from_utf8_lossy(kv.key()).into_owned(),
                Bytes::copy_from_slice(kv.value()),
            )
        }))
    }

    async fn watch(&self, key: &str, options: KvWatchOptions) -> Result<KvWatchStream, KvError> {
        let mut opts = WatchOptions::new();
        if options.prefix {
            opts = opts.with_prefix();
        }
        if options.prev_value {
            opts = opts.with_prev_key();
        }
        let (watcher, mut stream) = self.client.watch_client().watch(key, Some(opts)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let watched = key.to_string();
        tokio::spawn(async move {
            // Keep the watcher alive for as long as the stream is pumped;
            // dropping it cancels the server-side watch.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            break;
                        }
                        let events: Vec<KvEvent> = resp.events().iter().map(convert_event).collect();
                        if events.is_empty() {
                            // Progress notification.
                            continue;
                        }
                        if tx.send(WatchBatch { events }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(key = %watched, error = %err, "etcd watch stream error");
                        break;
                    }
                }
            }
        });
        Ok(KvWatchStream::new(rx))
    }

    async fn linearizable_get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        // etcd reads are linearizable unless explicitly marked serializable.
        let resp = self.client.kv_client().get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| Bytes::copy_from_slice(kv.value())))
    }
}

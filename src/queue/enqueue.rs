//! Enqueue and the per-item watcher fan-in.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::item::{Item, MAX_PROGRESS};
use crate::keys::{completed_key, scheduled_key};
use crate::kv::{KvEventKind, KvWatchOptions, KvWatchStream};
use crate::queue::{ItemStream, Queue, UPDATE_STREAM_CAPACITY};

impl Queue {
    /// Add or overwrite an item and stream every subsequent observed
    /// change until the item terminates or `ctx` is canceled.
    ///
    /// Updates are performed by external workers: a worker fetches the
    /// front of a bucket, works, and enqueues the item again with the same
    /// key. An item enqueued at terminal progress is moved to the
    /// completed namespace within this call, emitted once, and the stream
    /// closes. Failures surface as a single item with a non-empty `error`,
    /// after which the stream is closed.
    pub async fn enqueue(&self, ctx: CancellationToken, item: &Item) -> ItemStream {
        let (tx, rx) = mpsc::channel(UPDATE_STREAM_CAPACITY);
        let stream = ItemStream::new(rx);

        let mut cur = item.clone();
        if cur.bucket.is_empty() || cur.key.is_empty() {
            cur.error = "item has no bucket or key".to_string();
            let _ = tx.send(cur).await;
            return stream;
        }

        let payload = match serde_json::to_vec(&cur) {
            Ok(data) => Bytes::from(data),
            Err(err) => {
                cur.error = err.to_string();
                let _ = tx.send(cur).await;
                return stream;
            }
        };
        let key = scheduled_key(&cur.key);

        let guard = self.mu.lock().await;

        if let Err(err) = self.kv.put(&key, payload.clone()).await {
            drop(guard);
            cur.error = err.to_string();
            let _ = tx.send(cur).await;
            return stream;
        }
        info!(key = %cur.key, progress = cur.progress, "enqueue: wrote item");

        if cur.progress == MAX_PROGRESS {
            // Terminal write: move the item to the completed namespace
            // while still holding the engine lock.
            if let Err(err) = self.kv.delete(&key).await {
                drop(guard);
                cur.error = err.to_string();
                let _ = tx.send(cur).await;
                return stream;
            }
            if let Err(err) = self.kv.put(&completed_key(&cur.key), payload).await {
                drop(guard);
                cur.error = err.to_string();
                let _ = tx.send(cur).await;
                return stream;
            }
            drop(guard);
            info!(key = %cur.key, "enqueue: item finished");
            let _ = tx.send(cur).await;
            return stream;
        }

        let wch = match self
            .kv
            .watch(&key, KvWatchOptions::new().with_prev_value())
            .await
        {
            Ok(wch) => wch,
            Err(err) => {
                drop(guard);
                cur.error = err.to_string();
                let _ = tx.send(cur).await;
                return stream;
            }
        };
        drop(guard);

        let root = self.root.clone();
        tokio::spawn(run_enqueue_watcher(ctx, root, wch, cur, tx));
        stream
    }
}

/// Fan-in task of one `enqueue` call: owns the watch subscription and the
/// output channel, forwarding observed changes until a terminal event.
async fn run_enqueue_watcher(
    ctx: CancellationToken,
    root: CancellationToken,
    mut wch: KvWatchStream,
    mut cur: Item,
    tx: mpsc::Sender<Item>,
) {
    loop {
        tokio::select! {
            batch = wch.message() => {
                let Some(batch) = batch else {
                    cur.error = format!(
                        "enqueue-watcher: watch on {:?} closed by the store",
                        cur.key,
                    );
                    let _ = tx.send(cur).await;
                    return;
                };
                if batch.events.len() != 1 {
                    cur.error = format!(
                        "enqueue-watcher: {:?} expects 1 event per response, got {}",
                        cur.key,
                        batch.events.len(),
                    );
                    let _ = tx.send(cur).await;
                    return;
                }
                let event = &batch.events[0];

                if event.kind == KvEventKind::Delete {
                    info!(key = %cur.key, "enqueue-watcher: item deleted; completed or canceled");
                    // Previous-value retention guarantees the last state.
                    let prev_bytes = event.prev_value.clone().unwrap_or_default();
                    let mut prev: Item = match serde_json::from_slice(&prev_bytes) {
                        Ok(prev) => prev,
                        Err(_) => {
                            let text = String::from_utf8_lossy(&prev_bytes).into_owned();
                            let _ = tx
                                .send(Item::errored(format!(
                                    "enqueue-watcher: cannot parse {:?}",
                                    text,
                                )))
                                .await;
                            return;
                        }
                    };
                    if prev.progress != MAX_PROGRESS {
                        prev.canceled = true;
                        info!(
                            key = %prev.key,
                            progress = prev.progress,
                            "enqueue-watcher: item canceled before completion"
                        );
                    }
                    let _ = tx.send(prev).await;
                    return;
                }

                match serde_json::from_slice::<Item>(&event.value) {
                    Ok(next) => cur = next,
                    Err(_) => {
                        let text = String::from_utf8_lossy(&event.value).into_owned();
                        cur.error = format!("enqueue-watcher: cannot parse {:?}", text);
                        let _ = tx.send(cur).await;
                        return;
                    }
                }
                if tx.send(cur.clone()).await.is_err() {
                    // Consumer went away.
                    return;
                }
                if !cur.error.is_empty() {
                    warn!(key = %cur.key, error = %cur.error, "enqueue-watcher: item carries an error");
                    return;
                }
                if cur.progress == MAX_PROGRESS {
                    // The worker that wrote this performs the terminal
                    // transition shortly.
                    info!(key = %cur.key, "enqueue-watcher: item finished");
                    return;
                }
                debug!(key = %cur.key, progress = cur.progress, "enqueue-watcher: item updated");
            }
            _ = ctx.cancelled() => {
                cur.error = "context canceled".to_string();
                let _ = tx.send(cur).await;
                return;
            }
            _ = root.cancelled() => {
                cur.error = "queue stopped".to_string();
                let _ = tx.send(cur).await;
                return;
            }
        }
    }
}

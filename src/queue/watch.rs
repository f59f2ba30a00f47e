//! Long-lived item watches.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::item::Item;
use crate::keys::scheduled_key;
use crate::kv::{KvWatchOptions, KvWatchStream};
use crate::queue::{ItemStream, Queue, UPDATE_STREAM_CAPACITY};

impl Queue {
    /// Follow an item that is already scheduled, by its raw key.
    ///
    /// Every observed put is parsed and forwarded. Malformed events
    /// produce an item with a non-empty `error` but keep the stream open;
    /// the stream closes only when `ctx` is canceled or the queue stops.
    pub async fn watch(&self, ctx: CancellationToken, key: &str) -> ItemStream {
        info!(key = %key, "watch: watching item");
        let (tx, rx) = mpsc::channel(UPDATE_STREAM_CAPACITY);
        let stream = ItemStream::new(rx);
        let scheduled = scheduled_key(key);

        let wch = match self.kv.watch(&scheduled, KvWatchOptions::new()).await {
            Ok(wch) => wch,
            Err(err) => {
                let _ = tx.send(Item::errored(err.to_string())).await;
                return stream;
            }
        };

        let root = self.root.clone();
        let key = key.to_string();
        tokio::spawn(run_key_watcher(ctx, root, wch, key, tx));
        stream
    }
}

async fn run_key_watcher(
    ctx: CancellationToken,
    root: CancellationToken,
    mut wch: KvWatchStream,
    key: String,
    tx: mpsc::Sender<Item>,
) {
    loop {
        tokio::select! {
            batch = wch.message() => {
                let Some(batch) = batch else {
                    debug!(key = %key, "watch: closed by the store");
                    return;
                };
                if batch.events.len() != 1 {
                    let bad = Item::errored(format!(
                        "watch: {:?} expects 1 event per response, got {}",
                        key,
                        batch.events.len(),
                    ));
                    if tx.send(bad).await.is_err() {
                        return;
                    }
                    continue;
                }
                let event = &batch.events[0];
                match serde_json::from_slice::<Item>(&event.value) {
                    Ok(item) => {
                        debug!(key = %key, progress = item.progress, "watch: forwarding event");
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let text = String::from_utf8_lossy(&event.value).into_owned();
                        let bad = Item::errored(format!(
                            "watch: {:?} returned invalid JSON {:?} ({})",
                            key, text, err,
                        ));
                        if tx.send(bad).await.is_err() {
                            return;
                        }
                    }
                }
            }
            _ = ctx.cancelled() => {
                debug!(key = %key, "watch: canceled, closing stream");
                return;
            }
            _ = root.cancelled() => return,
        }
    }
}

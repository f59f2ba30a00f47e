//! First-item reads.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::item::Item;
use crate::keys::scheduled_bucket_prefix;
use crate::kv::KvWatchOptions;
use crate::queue::{ItemStream, Queue};

impl Queue {
    /// The highest-weight unfinished item of a bucket.
    ///
    /// Issues a linearizable read for the first key under the bucket's
    /// scheduled prefix; when the bucket is empty, waits for the first
    /// item to appear. Exactly one item is delivered on the returned
    /// stream in every outcome.
    pub async fn front(&self, ctx: CancellationToken, bucket: &str) -> ItemStream {
        let (tx, rx) = mpsc::channel(1);
        let stream = ItemStream::new(rx);
        let prefix = scheduled_bucket_prefix(bucket);

        let first = match self.kv.first_with_prefix(&prefix).await {
            Ok(first) => first,
            Err(err) => {
                let _ = tx.send(Item::errored(err.to_string())).await;
                return stream;
            }
        };

        if let Some((_key, value)) = first {
            let _ = tx.send(parse_front_item(&prefix, &value)).await;
            return stream;
        }

        debug!(bucket = %bucket, "front: bucket empty, waiting for the first item");
        let mut wch = match self
            .kv
            .watch(&prefix, KvWatchOptions::new().with_prefix())
            .await
        {
            Ok(wch) => wch,
            Err(err) => {
                let _ = tx.send(Item::errored(err.to_string())).await;
                return stream;
            }
        };

        let root = self.root.clone();
        tokio::spawn(async move {
            tokio::select! {
                batch = wch.message() => {
                    let Some(batch) = batch else {
                        let _ = tx
                            .send(Item::errored(format!(
                                "front: watch on {:?} closed by the store",
                                prefix,
                            )))
                            .await;
                        return;
                    };
                    if batch.events.len() != 1 {
                        let _ = tx
                            .send(Item::errored(format!(
                                "front: {:?} expects 1 event per response, got {}",
                                prefix,
                                batch.events.len(),
                            )))
                            .await;
                        return;
                    }
                    let _ = tx.send(parse_front_item(&prefix, &batch.events[0].value)).await;
                }
                _ = ctx.cancelled() => {
                    let _ = tx.send(Item::errored("context canceled")).await;
                }
                _ = root.cancelled() => {
                    let _ = tx.send(Item::errored("queue stopped")).await;
                }
            }
        });
        stream
    }
}

fn parse_front_item(prefix: &str, value: &[u8]) -> Item {
    match serde_json::from_slice(value) {
        Ok(item) => item,
        Err(err) => Item::errored(format!(
            "front: {:?} returned invalid JSON {:?} ({})",
            prefix,
            String::from_utf8_lossy(value),
            err,
        )),
    }
}

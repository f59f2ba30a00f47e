//! Item removal.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::item::Item;
use crate::keys::scheduled_key;
use crate::queue::{Queue, QueueError};

impl Queue {
    /// Delete an item from the queue, whether completed or in progress.
    /// The item need not be the front of its bucket, and deleting an item
    /// that is no longer scheduled succeeds.
    ///
    /// Live enqueue subscribers observe the deletion; when the item had
    /// not reached terminal progress they receive it with `canceled` set.
    /// No item is moved to the completed namespace here.
    pub async fn dequeue(&self, ctx: CancellationToken, item: &Item) -> Result<(), QueueError> {
        let key = scheduled_key(&item.key);
        let _guard = self.mu.lock().await;
        tokio::select! {
            deleted = self.kv.delete(&key) => {
                let deleted = deleted?;
                info!(key = %item.key, deleted, "dequeue: deleted item");
                Ok(())
            }
            _ = ctx.cancelled() => Err(QueueError::Canceled),
        }
    }
}


use bytes::Bytes;
use hopper::Item;
use tokio_util::sync::CancellationToken;

use test_helpers::*;

#[tokio::test]
async fn test_two_watchers_see_updates_in_order() {
    with_timeout!(20000, {
        let (_tmp, queue) = start_temp_queue().await;
        let ctx = CancellationToken::new();

        let item = Item::create("b", 5, "v");
        let mut s1 = queue.enqueue(ctx.clone(), &item).await;
        let mut s2 = queue.watch(ctx.clone(), &item.key).await;

        for progress in [25u8, 50u8] {
            let mut step = item.clone();
            step.progress = progress;
            let _ = queue.enqueue(ctx.clone(), &step).await;
        }

        for expected in [25u8, 50u8] {
            let u1 = s1.recv().await.expect("enqueue subscriber update");
            assert_eq!(u1.progress, expected);
            let u2 = s2.recv().await.expect("watch subscriber update");
            assert_eq!(u2.progress, expected);
        }

        queue.stop().await;
    });
}

#[tokio::test]
async fn test_watch_survives_malformed_events() {
    with_timeout!(20000, {
        let (_tmp, queue) = start_temp_queue().await;
        let ctx = CancellationToken::new();

        let item = Item::create("b", 1, "v");
        let mut stream = queue.watch(ctx.clone(), &item.key).await;

        // Write garbage directly under the scheduled key
        queue
            .kv()
            .put(
                &hopper::keys::scheduled_key(&item.key),
                Bytes::from_static(b"not json"),
            )
            .await
            .expect("raw put");

        let bad = stream.recv().await.expect("error item");
        assert!(!bad.error.is_empty());

        // The stream stays open: a valid update still arrives
        let mut update = item.clone();
        update.progress = 10;
        let _ = queue.enqueue(ctx.clone(), &update).await;

        let good = stream.recv().await.expect("valid update");
        assert!(good.error.is_empty());
        assert_eq!(good.progress, 10);

        queue.stop().await;
    });
}

#[tokio::test]
async fn test_watch_closes_silently_on_cancellation() {
    with_timeout!(20000, {
        let (_tmp, queue) = start_temp_queue().await;
        let ctx = CancellationToken::new();

        let item = Item::create("b", 1, "v");
        let mut stream = queue.watch(ctx.clone(), &item.key).await;
        ctx.cancel();

        assert!(
            stream.recv().await.is_none(),
            "watch closes without a synthetic item on cancellation"
        );

        queue.stop().await;
    });
}

#[tokio::test]
async fn test_watch_observes_error_items_without_terminating_early() {
    with_timeout!(20000, {
        let (_tmp, queue) = start_temp_queue().await;
        let ctx = CancellationToken::new();

        let item = Item::create("b", 1, "v");
        let mut stream = queue.watch(ctx.clone(), &item.key).await;

        let mut failed = item.clone();
        failed.error = "worker exploded".to_string();
        let _ = queue.enqueue(ctx.clone(), &failed).await;

        let observed = stream.recv().await.expect("errored update");
        assert_eq!(observed.error, "worker exploded");

        // Watch streams only close on cancellation, so another update is
        // still delivered
        let mut retried = item.clone();
        retried.progress = 5;
        let _ = queue.enqueue(ctx.clone(), &retried).await;
        let observed = stream.recv().await.expect("subsequent update");
        assert_eq!(observed.progress, 5);

        queue.stop().await;
    });
}


use bytes::Bytes;
use hopper::kv::{EmbeddedKvServer, KvError, KvEventKind, KvStore, KvWatchOptions};
use tokio_util::sync::CancellationToken;

use test_helpers::*;

async fn start_server(tmp: &tempfile::TempDir) -> EmbeddedKvServer {
    EmbeddedKvServer::start(&CancellationToken::new(), &test_config(tmp))
        .await
        .expect("start embedded server")
}

#[tokio::test]
async fn test_put_get_delete_roundtrip() {
    with_timeout!(20000, {
        let tmp = tempfile::tempdir().unwrap();
        let server = start_server(&tmp).await;
        let kv = server.client();

        kv.put("k", Bytes::from_static(b"v")).await.expect("put");
        assert_eq!(
            kv.linearizable_get("k").await.expect("get"),
            Some(Bytes::from_static(b"v"))
        );

        assert_eq!(kv.delete("k").await.expect("delete"), 1);
        assert_eq!(kv.linearizable_get("k").await.expect("get"), None);

        // Deleting an absent key is not an error
        assert_eq!(kv.delete("k").await.expect("second delete"), 0);

        server.shutdown();
    });
}

#[tokio::test]
async fn test_first_with_prefix_returns_smallest_key() {
    with_timeout!(20000, {
        let tmp = tempfile::tempdir().unwrap();
        let server = start_server(&tmp).await;
        let kv = server.client();

        kv.put("q/b", Bytes::from_static(b"2")).await.expect("put");
        kv.put("q/a", Bytes::from_static(b"1")).await.expect("put");
        kv.put("q/c", Bytes::from_static(b"3")).await.expect("put");
        kv.put("r/a", Bytes::from_static(b"other")).await.expect("put");

        let first = kv.first_with_prefix("q/").await.expect("first");
        assert_eq!(first, Some(("q/a".to_string(), Bytes::from_static(b"1"))));

        assert_eq!(kv.first_with_prefix("s/").await.expect("first"), None);

        server.shutdown();
    });
}

#[tokio::test]
async fn test_watch_sees_mutations_in_order_with_prev_values() {
    with_timeout!(20000, {
        let tmp = tempfile::tempdir().unwrap();
        let server = start_server(&tmp).await;
        let kv = server.client();

        let mut wch = kv
            .watch("k", KvWatchOptions::new().with_prev_value())
            .await
            .expect("watch");

        kv.put("k", Bytes::from_static(b"v1")).await.expect("put");
        kv.put("k", Bytes::from_static(b"v2")).await.expect("put");
        kv.delete("k").await.expect("delete");

        let batch = wch.message().await.expect("first batch");
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].kind, KvEventKind::Put);
        assert_eq!(batch.events[0].value, Bytes::from_static(b"v1"));
        assert_eq!(batch.events[0].prev_value, None);

        let batch = wch.message().await.expect("second batch");
        assert_eq!(batch.events[0].kind, KvEventKind::Put);
        assert_eq!(batch.events[0].value, Bytes::from_static(b"v2"));
        assert_eq!(
            batch.events[0].prev_value,
            Some(Bytes::from_static(b"v1"))
        );

        let batch = wch.message().await.expect("third batch");
        assert_eq!(batch.events[0].kind, KvEventKind::Delete);
        assert!(batch.events[0].value.is_empty());
        assert_eq!(
            batch.events[0].prev_value,
            Some(Bytes::from_static(b"v2"))
        );

        server.shutdown();
    });
}

#[tokio::test]
async fn test_prefix_watch_matches_only_prefix() {
    with_timeout!(20000, {
        let tmp = tempfile::tempdir().unwrap();
        let server = start_server(&tmp).await;
        let kv = server.client();

        let mut wch = kv
            .watch("q/", KvWatchOptions::new().with_prefix())
            .await
            .expect("watch");

        kv.put("r/elsewhere", Bytes::from_static(b"no")).await.expect("put");
        kv.put("q/here", Bytes::from_static(b"yes")).await.expect("put");

        let batch = wch.message().await.expect("batch");
        assert_eq!(batch.events[0].key, "q/here");

        server.shutdown();
    });
}

#[tokio::test]
async fn test_delete_of_absent_key_fires_no_event() {
    with_timeout!(20000, {
        let tmp = tempfile::tempdir().unwrap();
        let server = start_server(&tmp).await;
        let kv = server.client();

        let mut wch = kv.watch("k", KvWatchOptions::new()).await.expect("watch");

        assert_eq!(kv.delete("k").await.expect("delete"), 0);
        kv.put("k", Bytes::from_static(b"v")).await.expect("put");

        // The first observed event is the put, not the no-op delete
        let batch = wch.message().await.expect("batch");
        assert_eq!(batch.events[0].kind, KvEventKind::Put);

        server.shutdown();
    });
}

#[tokio::test]
async fn test_snapshot_and_restart_replays_state() {
    with_timeout!(20000, {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_config(&tmp);
        // Snapshot aggressively so both the snapshot and the log tail are
        // exercised on replay
        cfg.snapshot_entry_count = 2;

        let server = EmbeddedKvServer::start(&CancellationToken::new(), &cfg)
            .await
            .expect("start server");
        let kv = server.client();
        kv.put("a", Bytes::from_static(b"1")).await.expect("put");
        kv.put("b", Bytes::from_static(b"2")).await.expect("put");
        kv.put("c", Bytes::from_static(b"3")).await.expect("put");
        kv.delete("a").await.expect("delete");
        server.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let server = EmbeddedKvServer::start(&CancellationToken::new(), &cfg)
            .await
            .expect("restart server");
        let kv = server.client();
        assert_eq!(kv.linearizable_get("a").await.expect("get"), None);
        assert_eq!(
            kv.linearizable_get("b").await.expect("get"),
            Some(Bytes::from_static(b"2"))
        );
        assert_eq!(
            kv.linearizable_get("c").await.expect("get"),
            Some(Bytes::from_static(b"3"))
        );
        server.shutdown();
    });
}

#[tokio::test]
async fn test_startup_canceled_by_caller() {
    with_timeout!(20000, {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = EmbeddedKvServer::start(&ctx, &test_config(&tmp))
            .await
            .expect_err("canceled startup should fail");
        assert!(matches!(err, KvError::StartupCanceled));
    });
}

#[tokio::test]
async fn test_port_conflict_fails_startup() {
    with_timeout!(20000, {
        let tmp_a = tempfile::tempdir().unwrap();
        let server = start_server(&tmp_a).await;
        let taken_port: u16 = server
            .client_endpoint()
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .expect("endpoint port");

        let tmp_b = tempfile::tempdir().unwrap();
        let mut cfg = test_config(&tmp_b);
        cfg.client_port = taken_port;
        let result = EmbeddedKvServer::start(&CancellationToken::new(), &cfg).await;
        assert!(result.is_err(), "binding a taken port should fail startup");

        server.shutdown();
    });
}

#[tokio::test]
async fn test_clients_fail_after_shutdown() {
    with_timeout!(20000, {
        let tmp = tempfile::tempdir().unwrap();
        let server = start_server(&tmp).await;
        let kv = server.client();
        server.shutdown();

        let err = kv
            .put("k", Bytes::from_static(b"v"))
            .await
            .expect_err("put after shutdown should fail");
        assert!(matches!(err, KvError::Stopping));
    });
}

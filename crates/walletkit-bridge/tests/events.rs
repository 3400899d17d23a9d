//! Integration tests for event routing, TonConnect requests and retry

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use walletkit_bridge::requests::methods;
use walletkit_bridge::{
    EngineOptions, EventHandler, MemoryStore, PendingEventStore, ReplayPolicy, StorageHandles,
    WalletKitConfig, WalletKitEngine, WalletKitError, WalletKitEvent,
};
use walletkit_testing::{messages, mock_options, MockReply, MockScriptHost};

struct Harness {
    host: Arc<MockScriptHost>,
    store: Arc<MemoryStore>,
    engine: WalletKitEngine,
}

async fn harness(host: MockScriptHost) -> Harness {
    harness_with(host, mock_options()).await
}

async fn harness_with(host: MockScriptHost, options: EngineOptions) -> Harness {
    let host = Arc::new(host);
    let store = Arc::new(MemoryStore::new());
    let engine = WalletKitEngine::start(host.clone(), StorageHandles::from_store(store.clone()), options)
        .await
        .unwrap();
    engine.init(WalletKitConfig::testnet()).await.unwrap();
    Harness { host, store, engine }
}

fn forward(engine: &WalletKitEngine) -> mpsc::UnboundedReceiver<WalletKitEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    engine.add_event_handler(Arc::new(move |event: &WalletKitEvent| {
        let _ = tx.send(event.clone());
        Ok(())
    }));
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<WalletKitEvent>) -> WalletKitEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event not delivered")
        .expect("handler dropped")
}

async fn wait_for_pending(store: &MemoryStore, count: usize) {
    for _ in 0..200 {
        if store.load_all().unwrap().len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} pending events");
}

mod routing_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_request_approval() {
        let h = harness(MockScriptHost::new()).await;
        let mut rx = forward(&h.engine);

        h.host.post(&messages::connect_request("7")).unwrap();
        let WalletKitEvent::ConnectRequest(request) = next(&mut rx).await else {
            panic!("expected connect request");
        };
        assert_eq!(request.id(), "7");
        assert_eq!(request.dapp_info().and_then(|d| d.name.as_deref()), Some("Ston.fi"));
        assert_eq!(request.permissions()[0].name, "ton_addr");

        h.engine.approve_connect(&request, "EQa").await.unwrap();
        let params = h.host.calls_to(methods::APPROVE_CONNECT)[0].params.clone().unwrap();
        assert_eq!(params["walletAddress"], "EQa");
        assert_eq!(params["event"]["id"], "7");
    }

    #[tokio::test]
    async fn test_transaction_request_summary_and_reject() {
        let h = harness(MockScriptHost::new()).await;
        let mut rx = forward(&h.engine);

        h.host
            .post(&messages::transaction_request("9", "EQdest", "2500000000"))
            .unwrap();
        let WalletKitEvent::TransactionRequest(request) = next(&mut rx).await else {
            panic!("expected transaction request");
        };
        assert_eq!(request.amount().as_deref(), Some("2500000000"));
        assert_eq!(request.recipient().as_deref(), Some("EQdest"));
        assert_eq!(request.valid_until(), Some(1_900_000_000));

        h.engine
            .reject_transaction(&request, Some("user declined"))
            .await
            .unwrap();
        let params = h.host.calls_to(methods::REJECT_TRANSACTION)[0].params.clone().unwrap();
        assert_eq!(params["reason"], "user declined");
    }

    #[tokio::test]
    async fn test_sign_data_signature_locations() {
        let h = harness(MockScriptHost::new()).await;
        let mut rx = forward(&h.engine);
        h.host.post(&messages::sign_data_request("3", "hello")).unwrap();
        let WalletKitEvent::SignDataRequest(request) = next(&mut rx).await else {
            panic!("expected sign-data request");
        };
        assert_eq!(request.payload_type(), Some("text"));

        h.host.set_responder(|_| MockReply::result(json!({"signature": "top"})));
        assert_eq!(h.engine.approve_sign_data(&request).await.unwrap(), "top");

        h.host
            .set_responder(|_| MockReply::result(json!({"result": {"signature": "nested"}})));
        assert_eq!(h.engine.approve_sign_data(&request).await.unwrap(), "nested");

        h.host.set_responder(|_| MockReply::result(json!({"ok": true})));
        assert!(matches!(
            h.engine.approve_sign_data(&request).await,
            Err(WalletKitError::Bridge(_))
        ));
    }

    #[tokio::test]
    async fn test_events_keep_posting_order() {
        let h = harness(MockScriptHost::new()).await;
        let mut rx = forward(&h.engine);

        for session in ["a", "b", "c"] {
            h.host.post(&messages::disconnect(session)).unwrap();
        }
        for expected in ["a", "b", "c"] {
            match next(&mut rx).await {
                WalletKitEvent::Disconnect { session_id } => assert_eq!(session_id, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped_without_retry() {
        let h = harness(MockScriptHost::new()).await;
        let mut rx = forward(&h.engine);

        let no_messages = messages::event("transactionRequest", Some("5"), json!({"id": "5"}));
        h.host.post(&no_messages).unwrap();
        h.host.post(&json!({"kind": "mystery"})).unwrap();
        h.host.post(&messages::disconnect("after")).unwrap();

        assert!(matches!(
            next(&mut rx).await,
            WalletKitEvent::Disconnect { session_id } if session_id == "after"
        ));
        h.engine.replay_pending_events().await;
        assert!(h.store.load_all().unwrap().is_empty());
    }

    struct AutoApprove {
        approved: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl EventHandler for AutoApprove {
        async fn handle(&self, event: &WalletKitEvent) -> anyhow::Result<()> {
            if let WalletKitEvent::ConnectRequest(request) = event {
                request.approve("EQauto").await?;
                let _ = self.approved.send(request.id().to_string());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_can_approve_inline() {
        let h = harness(MockScriptHost::new()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.engine.add_event_handler(Arc::new(AutoApprove { approved: tx }));

        h.host.post(&messages::connect_request("11")).unwrap();
        let id = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "11");
        assert_eq!(h.host.calls_to(methods::APPROVE_CONNECT).len(), 1);
    }
}

mod retry_tests {
    use super::*;

    #[tokio::test]
    async fn test_undelivered_event_replays_once_to_new_handler() {
        let h = harness(MockScriptHost::new()).await;

        h.host.post(&messages::connect_request("42")).unwrap();
        wait_for_pending(&h.store, 1).await;
        let records = h.store.load_all().unwrap();
        assert_eq!(records[0].id, "42");
        assert_eq!(records[0].event_type, "connectRequest");

        let mut rx = forward(&h.engine);
        let WalletKitEvent::ConnectRequest(request) = next(&mut rx).await else {
            panic!("expected connect request");
        };
        assert_eq!(request.id(), "42");

        let report = h.engine.replay_pending_events().await;
        assert_eq!(report.delivered, 0);
        assert!(h.store.load_all().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_without_id_is_not_persisted() {
        let h = harness(MockScriptHost::new()).await;

        h.host.post(&messages::disconnect("s1")).unwrap();
        h.host.post(&messages::connect_request("marker")).unwrap();
        wait_for_pending(&h.store, 1).await;
        assert_eq!(h.store.load_all().unwrap()[0].id, "marker");
    }

    #[tokio::test]
    async fn test_failing_handler_exhausts_retries() {
        let policy = ReplayPolicy::default().with_max_retries(2).with_schedule(None);
        let options = mock_options().with_replay_policy(policy);
        let h = harness_with(MockScriptHost::new(), options).await;

        let accept = Arc::new(AtomicBool::new(false));
        let flag = accept.clone();
        h.engine.add_event_handler(Arc::new(move |_: &WalletKitEvent| {
            if flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            anyhow::bail!("ui busy")
        }));

        h.host
            .post(&messages::transaction_request("t1", "EQdest", "1"))
            .unwrap();
        wait_for_pending(&h.store, 1).await;

        assert_eq!(h.store.load_all().unwrap()[0].retry_count, 0);

        for attempt in 1..=2 {
            let report = h.engine.replay_pending_events().await;
            assert_eq!(report.failed, 1);
            assert_eq!(h.store.load_all().unwrap()[0].retry_count, attempt);
        }

        // init() carried the default policy; the one given at start still applies
        let report = h.engine.replay_pending_events().await;
        assert_eq!(report.discarded, 1);
        assert!(h.store.load_all().unwrap().is_empty());
        assert!(!accept.load(Ordering::SeqCst));
    }

    #[derive(Default)]
    struct SlowFlakyHandler {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        failed_once: AtomicBool,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for SlowFlakyHandler {
        async fn handle(&self, event: &WalletKitEvent) -> anyhow::Result<()> {
            let WalletKitEvent::TransactionRequest(request) = event else {
                return Ok(());
            };
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.seen.lock().unwrap().push(request.id().to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if !self.failed_once.swap(true, Ordering::SeqCst) {
                anyhow::bail!("ui busy");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_replayed_events_never_overlap_live_dispatch() {
        let options = mock_options().with_replay_policy(ReplayPolicy::default().with_schedule(None));
        let h = harness_with(MockScriptHost::new(), options).await;
        let handler = Arc::new(SlowFlakyHandler::default());
        h.engine.add_event_handler(handler.clone());

        for id in ["t1", "t2", "t3", "t4", "t5"] {
            h.host
                .post(&messages::transaction_request(id, "EQdest", "1"))
                .unwrap();
        }
        wait_for_pending(&h.store, 1).await;
        let report = h.engine.replay_pending_events().await;

        assert_eq!(report.delivered, 1);
        assert!(h.store.load_all().unwrap().is_empty());
        assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(
            *handler.seen.lock().unwrap(),
            ["t1", "t2", "t3", "t4", "t5", "t1"]
        );
    }

    #[tokio::test]
    async fn test_destroy_stops_event_delivery() {
        let h = harness(MockScriptHost::new()).await;
        let mut rx = forward(&h.engine);
        h.engine.destroy().await;

        assert!(h.host.post(&messages::disconnect("late")).is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(h.engine.replay_pending_events().await.delivered, 0);
    }
}

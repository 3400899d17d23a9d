//! Durable retry of undelivered events.
//!
//! One worker task owns the pending-event table: persist, replay and delete
//! requests are queued to it, so an event persisted before a replay request
//! is always seen by that replay. Stored events are handed back to the
//! router's dispatch queue; the worker only loads, updates and deletes
//! records. Storage calls run on the blocking pool and their failures are
//! logged, never propagated.

use crate::message::EventEnvelope;
use crate::router::{DispatchQueue, HandlerRegistry, ReplayOutcome};
use crate::storage::{PendingEvent, PendingEventStore};
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use walletkit_error::{Result, WalletKitError};
use walletkit_resilience::{ExponentialBackoff, ReplayPolicy, ReplayVerdict};

/// Outcome of one replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Events a handler accepted; their records were deleted
    pub delivered: usize,
    /// Events still undelivered; their retry count was bumped
    pub failed: usize,
    /// Records dropped as expired, exhausted, corrupt or undecodable
    pub discarded: usize,
}

impl ReplayReport {
    /// Records left in the table after the pass
    pub fn remaining(&self) -> usize {
        self.failed
    }
}

enum Command {
    Persist(EventEnvelope, u64),
    Replay(Option<oneshot::Sender<ReplayReport>>),
    Delete(String, oneshot::Sender<Result<()>>),
}

/// Handle to the retry worker
pub struct RetryStore {
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetryStore {
    /// Starts the worker. Must be called inside a tokio runtime.
    pub fn start(
        store: Arc<dyn PendingEventStore>,
        queue: DispatchQueue,
        handlers: Arc<HandlerRegistry>,
        policy: ReplayPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = RetryWorker {
            store,
            queue,
            handlers,
            backoff: policy.schedule.clone().map(ExponentialBackoff::new),
            policy,
            next_replay: None,
        };
        let handle = tokio::spawn(worker.run(rx));
        Self {
            commands: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queues an undelivered event for durable storage.
    ///
    /// `generation` is the handler registry generation observed before the
    /// failed delivery; if a handler was added since, the event is replayed
    /// right after it is stored. Events without a correlation id are ignored.
    pub fn persist(&self, envelope: EventEnvelope, generation: u64) {
        if envelope.id.is_none() {
            tracing::debug!(event_type = %envelope.event_type, "Not persisting event without id");
            return;
        }
        self.send(Command::Persist(envelope, generation));
    }

    /// Asks the worker to replay without waiting for the outcome
    pub fn request_replay(&self) {
        self.send(Command::Replay(None));
    }

    /// Replays every stored event and waits for the outcome.
    ///
    /// Replays run on the dispatch task, so this must not be awaited from
    /// inside an event handler.
    pub async fn replay_all(&self) -> ReplayReport {
        let (tx, rx) = oneshot::channel();
        if !self.send(Command::Replay(Some(tx))) {
            return ReplayReport::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Deletes a stored event
    pub async fn delete(&self, id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Command::Delete(id.to_string(), tx)) {
            return Err(WalletKitError::storage("Retry store stopped"));
        }
        rx.await
            .map_err(|_| WalletKitError::storage("Retry store stopped"))?
    }

    /// Stops the worker; queued requests are discarded
    pub fn shutdown(&self) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.take();
        }
        if let Some(worker) = self.worker.lock().ok().and_then(|mut w| w.take()) {
            worker.abort();
        }
    }

    fn send(&self, command: Command) -> bool {
        self.commands
            .lock()
            .ok()
            .and_then(|commands| commands.as_ref().map(|tx| tx.send(command).is_ok()))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for RetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self.commands.lock().map(|c| c.is_some()).unwrap_or(false);
        f.debug_struct("RetryStore").field("running", &running).finish()
    }
}

struct RetryWorker {
    store: Arc<dyn PendingEventStore>,
    queue: DispatchQueue,
    handlers: Arc<HandlerRegistry>,
    policy: ReplayPolicy,
    backoff: Option<ExponentialBackoff>,
    next_replay: Option<Instant>,
}

impl RetryWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let wake = self.next_replay;
            let timer = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Persist(envelope, generation)) => {
                        self.persist(envelope).await;
                        if self.handlers.generation() == generation {
                            self.schedule_if_idle();
                        } else {
                            let report = self.replay().await;
                            self.reschedule(&report);
                        }
                    }
                    Some(Command::Replay(reply)) => {
                        if let Some(backoff) = self.backoff.as_mut() {
                            backoff.reset();
                        }
                        let report = self.replay().await;
                        self.reschedule(&report);
                        if let Some(reply) = reply {
                            let _ = reply.send(report);
                        }
                    }
                    Some(Command::Delete(id, reply)) => {
                        let _ = reply.send(self.delete(&id).await);
                    }
                    None => break,
                },
                _ = timer => {
                    self.next_replay = None;
                    let report = self.replay().await;
                    self.reschedule(&report);
                }
            }
        }
        tracing::debug!("Retry worker stopped");
    }

    fn schedule_if_idle(&mut self) {
        if self.next_replay.is_none() {
            self.schedule_next();
        }
    }

    fn schedule_next(&mut self) {
        self.next_replay = self
            .backoff
            .as_mut()
            .and_then(|backoff| backoff.next())
            .map(|delay| Instant::now() + delay);
    }

    fn reschedule(&mut self, report: &ReplayReport) {
        if report.remaining() == 0 {
            if let Some(backoff) = self.backoff.as_mut() {
                backoff.reset();
            }
            self.next_replay = None;
        } else {
            self.schedule_next();
        }
    }

    async fn persist(&self, envelope: EventEnvelope) {
        let Some(id) = envelope.id else {
            return;
        };
        let record = PendingEvent {
            id,
            event_type: envelope.event_type,
            data: envelope.data.to_string(),
            timestamp: Utc::now(),
            retry_count: 0,
        };
        let event_id = record.id.clone();
        match self.blocking(move |store| store.save(&record)).await {
            Ok(()) => tracing::info!(event_id = %event_id, "Persisted undelivered event"),
            Err(e) => tracing::error!(event_id = %event_id, error = %e, "Failed to persist event"),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.blocking(move |store| store.delete(&id)).await
    }

    async fn replay(&self) -> ReplayReport {
        let mut report = ReplayReport::default();
        if self.handlers.is_empty() {
            return report;
        }

        let records = match self.blocking(|store| store.load_all()).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load pending events");
                return report;
            }
        };
        if records.is_empty() {
            return report;
        }
        tracing::debug!(count = records.len(), "Replaying pending events");

        for mut record in records {
            let age = (Utc::now() - record.timestamp)
                .to_std()
                .unwrap_or(Duration::ZERO);
            match self.policy.verdict(record.retry_count, age) {
                ReplayVerdict::Replay => {}
                verdict => {
                    tracing::warn!(event_id = %record.id, ?verdict, "Discarding pending event");
                    self.discard(&record.id, &mut report).await;
                    continue;
                }
            }

            let data: Value = match serde_json::from_str(&record.data) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(event_id = %record.id, error = %e, "Discarding corrupt pending event");
                    self.discard(&record.id, &mut report).await;
                    continue;
                }
            };
            let envelope = EventEnvelope::new(record.event_type.clone(), data, Some(record.id.clone()));
            match self.queue.replay(envelope).await {
                Some(ReplayOutcome::Delivered) => {
                    report.delivered += 1;
                    if let Err(e) = self.delete(&record.id).await {
                        tracing::error!(event_id = %record.id, error = %e, "Failed to delete delivered event");
                    }
                }
                Some(ReplayOutcome::Undelivered) => {
                    report.failed += 1;
                    record.retry_count = record.retry_count.saturating_add(1);
                    let event_id = record.id.clone();
                    if let Err(e) = self.blocking(move |store| store.save(&record)).await {
                        tracing::error!(event_id = %event_id, error = %e, "Failed to update pending event");
                    }
                }
                Some(ReplayOutcome::Dropped) => self.discard(&record.id, &mut report).await,
                None => {
                    tracing::debug!("Event router stopped, ending replay");
                    break;
                }
            }
        }

        tracing::info!(
            delivered = report.delivered,
            failed = report.failed,
            discarded = report.discarded,
            "Replay finished"
        );
        report
    }

    async fn discard(&self, id: &str, report: &mut ReplayReport) {
        report.discarded += 1;
        if let Err(e) = self.delete(id).await {
            tracing::error!(event_id = %id, error = %e, "Failed to delete pending event");
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PendingEventStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| WalletKitError::storage(format!("Storage task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostFunction, HostValue, ScriptExecutor, ScriptHost};
    use crate::router::{dispatch_channel, EventRouter};
    use crate::rpc::RpcClient;
    use crate::storage::MemoryStore;
    use crate::WalletKitEvent;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NullHost;

    #[async_trait]
    impl ScriptHost for NullHost {
        async fn evaluate(&self, _: &str, _: &str) -> Result<HostValue> {
            Ok(HostValue::Void)
        }
        async fn register(&self, _: &str, _: &str, _: HostFunction) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    struct Setup {
        store: Arc<MemoryStore>,
        handlers: Arc<HandlerRegistry>,
        retry: Arc<RetryStore>,
        _router: EventRouter,
    }

    fn setup(policy: ReplayPolicy) -> Setup {
        let store = Arc::new(MemoryStore::new());
        let rpc = Arc::new(RpcClient::new(Arc::new(ScriptExecutor::new(Arc::new(NullHost)))));
        let handlers = Arc::new(HandlerRegistry::new());
        let (queue, inbox) = dispatch_channel();
        let retry = Arc::new(RetryStore::start(store.clone(), queue.clone(), handlers.clone(), policy));
        let router = EventRouter::start(rpc, handlers.clone(), retry.clone(), queue, inbox);
        Setup {
            store,
            handlers,
            retry,
            _router: router,
        }
    }

    fn disconnect(id: &str) -> EventEnvelope {
        EventEnvelope::new("disconnect", json!({"sessionId": id}), Some(id.to_string()))
    }

    #[tokio::test]
    async fn test_persist_then_replay_delivers_and_deletes() {
        let Setup { store, handlers, retry, _router } = setup(ReplayPolicy::unbounded());
        retry.persist(disconnect("s1"), handlers.generation());
        assert_eq!(retry.replay_all().await, ReplayReport::default());
        assert_eq!(store.load_all().unwrap().len(), 1);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        handlers.add(Arc::new(move |event: &WalletKitEvent| {
            assert!(matches!(event, WalletKitEvent::Disconnect { session_id } if session_id == "s1"));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let report = retry.replay_all().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_replay_bumps_retry_count() {
        let Setup { store, handlers, retry, _router } = setup(ReplayPolicy::unbounded());
        let fail = Arc::new(AtomicBool::new(true));
        let flag = fail.clone();
        handlers.add(Arc::new(move |_: &WalletKitEvent| {
            if flag.load(Ordering::SeqCst) {
                anyhow::bail!("still failing");
            }
            Ok(())
        }));

        store
            .save(&PendingEvent {
                id: "s2".into(),
                event_type: "disconnect".into(),
                data: json!({"sessionId": "s2"}).to_string(),
                timestamp: Utc::now(),
                retry_count: 0,
            })
            .unwrap();

        let report = retry.replay_all().await;
        assert_eq!(report.failed, 1);
        assert_eq!(store.load_all().unwrap()[0].retry_count, 1);

        fail.store(false, Ordering::SeqCst);
        assert_eq!(retry.replay_all().await.delivered, 1);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_policy_discards_exhausted_and_expired() {
        let policy = ReplayPolicy::unbounded()
            .with_max_retries(3)
            .with_max_age(Duration::from_secs(60));
        let Setup { store, handlers, retry, _router } = setup(policy);
        handlers.add(Arc::new(|_: &WalletKitEvent| Ok(())));

        let mut exhausted = PendingEvent {
            id: "old-retries".into(),
            event_type: "disconnect".into(),
            data: json!({"sessionId": "x"}).to_string(),
            timestamp: Utc::now(),
            retry_count: 3,
        };
        store.save(&exhausted).unwrap();
        exhausted.id = "too-old".into();
        exhausted.retry_count = 0;
        exhausted.timestamp = Utc::now() - chrono::Duration::hours(1);
        store.save(&exhausted).unwrap();

        let report = retry.replay_all().await;
        assert_eq!(report.discarded, 2);
        assert_eq!(report.delivered, 0);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_added_before_persist_gets_event() {
        let Setup { store, handlers, retry, _router } = setup(ReplayPolicy::unbounded());
        let before = handlers.generation();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        handlers.add(Arc::new(move |_: &WalletKitEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        retry.persist(disconnect("late-handler"), before);
        for _ in 0..200 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        retry.replay_all().await;
        assert!(store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_not_replayed_immediately() {
        let Setup { store, handlers, retry, _router } = setup(ReplayPolicy::unbounded());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        handlers.add(Arc::new(move |_: &WalletKitEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("busy")
        }));

        retry.persist(disconnect("s4"), handlers.generation());
        let report = retry.replay_all().await;
        assert_eq!(report.failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.load_all().unwrap()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_events_without_id_are_not_persisted() {
        let Setup { store, retry, _router, .. } = setup(ReplayPolicy::unbounded());
        retry.persist(EventEnvelope::new("disconnect", json!({"sessionId": "s"}), None), 0);
        retry.replay_all().await;
        assert!(store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_shutdown() {
        let Setup { store, retry, _router, .. } = setup(ReplayPolicy::unbounded());
        retry.persist(disconnect("s3"), 0);
        retry.delete("s3").await.unwrap();
        assert!(store.load_all().unwrap().is_empty());

        retry.shutdown();
        assert!(retry.delete("s3").await.is_err());
        assert_eq!(retry.replay_all().await, ReplayReport::default());
    }
}

//! Routing of messages posted by the script.
//!
//! Responses resolve their pending call as soon as they are posted. Ready
//! and event messages are queued and handled by one dispatch task in the
//! order the script posted them. Replays of stored events join the same
//! queue, so handlers never run concurrently.

use crate::events::{decode_event, WalletKitEvent};
use crate::message::{BridgeMessage, EventEnvelope, ReadyInfo};
use crate::retry::RetryStore;
use crate::rpc::RpcClient;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Receives events from the bridge.
///
/// Handlers run one after another on the dispatch task and may call back
/// into the bridge, for example to approve a request. An event counts as
/// delivered once any handler returns `Ok`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event
    async fn handle(&self, event: &WalletKitEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(&WalletKitEvent) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &WalletKitEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Identifies a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// The set of registered handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<(HandlerId, Arc<dyn EventHandler>)>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler
    pub fn add(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push((id, handler));
        }
        id
    }

    /// Unregisters a handler, returning whether it was registered
    pub fn remove(&self, id: HandlerId) -> bool {
        match self.handlers.write() {
            Ok(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(existing, _)| *existing != id);
                handlers.len() != before
            }
            Err(_) => false,
        }
    }

    /// Counter that moves every time a handler is added
    pub fn generation(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    /// Returns true when no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers `event` to every handler; true if at least one succeeded
    pub async fn deliver(&self, event: &WalletKitEvent) -> bool {
        let snapshot: Vec<Arc<dyn EventHandler>> = match self.handlers.read() {
            Ok(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(_) => return false,
        };

        let mut delivered = false;
        for handler in snapshot {
            match handler.handle(event).await {
                Ok(()) => delivered = true,
                Err(e) => tracing::warn!(
                    event_type = event.event_type(),
                    error = %e,
                    "Event handler failed"
                ),
            }
        }
        delivered
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

/// What happened to a stored event offered to the dispatch task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// A handler accepted the event
    Delivered,
    /// No handler accepted the event
    Undelivered,
    /// The event no longer decodes, or its type is ignored
    Dropped,
}

enum Dispatch {
    Message(BridgeMessage),
    Replay {
        envelope: EventEnvelope,
        outcome: oneshot::Sender<ReplayOutcome>,
    },
}

/// Sending half of the dispatch queue, used to replay stored events
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Dispatch>,
}

/// Receiving half of the dispatch queue, consumed by [`EventRouter::start`]
pub struct DispatchInbox {
    rx: mpsc::UnboundedReceiver<Dispatch>,
}

/// Creates the queue the router's dispatch task drains
pub fn dispatch_channel() -> (DispatchQueue, DispatchInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DispatchQueue { tx }, DispatchInbox { rx })
}

impl DispatchQueue {
    /// Queues a stored event behind the messages already waiting and
    /// reports the outcome. Returns `None` once the router stopped.
    pub async fn replay(&self, envelope: EventEnvelope) -> Option<ReplayOutcome> {
        let (outcome, rx) = oneshot::channel();
        self.tx.send(Dispatch::Replay { envelope, outcome }).ok()?;
        rx.await.ok()
    }

    fn post(&self, message: BridgeMessage) -> bool {
        self.tx.send(Dispatch::Message(message)).is_ok()
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

struct RouterCore {
    rpc: Arc<RpcClient>,
    handlers: Arc<HandlerRegistry>,
    retry: Arc<RetryStore>,
    ready_info: RwLock<Option<ReadyInfo>>,
}

impl RouterCore {
    async fn run(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Message(message) => self.dispatch(message).await,
            Dispatch::Replay { envelope, outcome } => {
                let _ = outcome.send(self.replay(envelope).await);
            }
        }
    }

    async fn dispatch(&self, message: BridgeMessage) {
        match message {
            BridgeMessage::Response(response) => {
                self.rpc.resolve(response);
            }
            BridgeMessage::Ready(info) => {
                tracing::info!(network = ?info.network, "WalletKit bundle ready");
                if let Ok(mut cached) = self.ready_info.write() {
                    *cached = Some(info.clone());
                }
                self.rpc.mark_app_ready();
                self.handlers.deliver(&WalletKitEvent::Ready(info)).await;
            }
            BridgeMessage::Event(envelope) => self.dispatch_event(envelope).await,
        }
    }

    fn decode(&self, envelope: &EventEnvelope) -> Option<WalletKitEvent> {
        match decode_event(envelope, &self.rpc) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(event_type = %envelope.event_type, error = %e, "Dropping undecodable event");
                None
            }
        }
    }

    async fn dispatch_event(&self, envelope: EventEnvelope) {
        let Some(event) = self.decode(&envelope) else {
            return;
        };

        let generation = self.handlers.generation();
        if self.handlers.deliver(&event).await {
            tracing::debug!(event_type = %envelope.event_type, "Event delivered");
            return;
        }
        match envelope.id {
            Some(_) => {
                tracing::debug!(event_type = %envelope.event_type, "Event undelivered, queueing for retry");
                self.retry.persist(envelope, generation);
            }
            None => {
                tracing::debug!(event_type = %envelope.event_type, "Event undelivered and has no id, dropping");
            }
        }
    }

    async fn replay(&self, envelope: EventEnvelope) -> ReplayOutcome {
        let Some(event) = self.decode(&envelope) else {
            return ReplayOutcome::Dropped;
        };
        match self.handlers.deliver(&event).await {
            true => ReplayOutcome::Delivered,
            false => ReplayOutcome::Undelivered,
        }
    }
}

/// Classifies script messages and delivers events to handlers
pub struct EventRouter {
    core: Arc<RouterCore>,
    queue: Mutex<Option<DispatchQueue>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventRouter {
    /// Starts the dispatch task draining `inbox`. Must be called inside a
    /// tokio runtime.
    pub fn start(
        rpc: Arc<RpcClient>,
        handlers: Arc<HandlerRegistry>,
        retry: Arc<RetryStore>,
        queue: DispatchQueue,
        inbox: DispatchInbox,
    ) -> Self {
        let core = Arc::new(RouterCore {
            rpc,
            handlers,
            retry,
            ready_info: RwLock::new(None),
        });
        let mut rx = inbox.rx;
        let worker = tokio::spawn({
            let core = Arc::clone(&core);
            async move {
                while let Some(dispatch) = rx.recv().await {
                    core.run(dispatch).await;
                }
                tracing::debug!("Event dispatch stopped");
            }
        });
        Self {
            core,
            queue: Mutex::new(Some(queue)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Accepts raw message text from the script.
    ///
    /// Responses resolve immediately; everything else is queued for the
    /// dispatch task. Malformed messages are logged and dropped.
    pub fn post(&self, raw: &str) {
        let message = match BridgeMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed bridge message");
                return;
            }
        };
        if let BridgeMessage::Response(response) = message {
            self.core.rpc.resolve(response);
            return;
        }

        let queued = self
            .queue
            .lock()
            .ok()
            .and_then(|queue| queue.as_ref().map(|queue| queue.post(message)))
            .unwrap_or(false);
        if !queued {
            tracing::debug!("Event router stopped, dropping message");
        }
    }

    /// Parses and handles one message on the calling task
    pub async fn dispatch(&self, raw: &str) {
        match BridgeMessage::parse(raw) {
            Ok(message) => self.core.dispatch(message).await,
            Err(e) => tracing::warn!(error = %e, "Dropping malformed bridge message"),
        }
    }

    /// Registers a handler and replays undelivered events to it
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = self.core.handlers.add(handler);
        tracing::debug!(handler = ?id, "Event handler registered");
        self.core.retry.request_replay();
        id
    }

    /// Unregisters a handler
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.core.handlers.remove(id)
    }

    /// Network and endpoints from the script's last `ready` message
    pub fn ready_info(&self) -> Option<ReadyInfo> {
        self.core.ready_info.read().ok().and_then(|info| info.clone())
    }

    /// Stops the dispatch task; queued messages and replays are discarded
    pub fn shutdown(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
        if let Some(worker) = self.worker.lock().ok().and_then(|mut w| w.take()) {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("handlers", &self.core.handlers)
            .field("ready_info", &self.ready_info())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_closure_handler_and_removal() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = registry.add(Arc::new(move |_: &WalletKitEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(registry.deliver(&WalletKitEvent::SessionsChanged).await);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
        assert!(!registry.deliver(&WalletKitEvent::SessionsChanged).await);
    }

    #[tokio::test]
    async fn test_one_success_counts_as_delivered() {
        let registry = HandlerRegistry::new();
        registry.add(Arc::new(|_: &WalletKitEvent| anyhow::bail!("ui not ready")));
        assert!(!registry.deliver(&WalletKitEvent::SessionsChanged).await);

        registry.add(Arc::new(|_: &WalletKitEvent| Ok(())));
        assert!(registry.deliver(&WalletKitEvent::SessionsChanged).await);
    }
}

//! The public WalletKit surface.
//!
//! [`WalletKitEngine`] wires a script host to the RPC client, router and
//! retry store, loads the bundle, and exposes the wallet, TonConnect and
//! session operations. Every operation initializes the bundle on first use.

use crate::classifier::{classify_all, Transaction};
use crate::config::{BundleSource, WalletKitConfig};
use crate::events::WalletKitEvent;
use crate::host::{host_function, string_arg, HostFunction, HostValue, ScriptExecutor, ScriptHost};
use crate::init::InitializationGate;
use crate::message::ReadyInfo;
use crate::requests::{ConnectRequest, SignDataRequest, TransactionRequest};
use crate::retry::{ReplayReport, RetryStore};
use crate::router::{dispatch_channel, EventHandler, EventRouter, HandlerId, HandlerRegistry};
use crate::rpc::{bridge_check_passed, RpcClient, BRIDGE_CHECK, INIT_METHOD};
use crate::storage::{KeyValueStore, StorageHandles};
use crate::wallet::{
    decode_list, result_list, TransferParams, WalletAccount, WalletRecord, WalletRecordStore,
    WalletSession, WalletState, DEFAULT_WALLET_VERSION,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;
use walletkit_error::{Result, WalletKitError};
use walletkit_resilience::ReplayPolicy;

/// Global object the host functions are installed on
pub const NATIVE_OBJECT: &str = "WalletKitNative";

/// Script-side method names
pub mod methods {
    /// Add a wallet from mnemonic words
    pub const ADD_WALLET_FROM_MNEMONIC: &str = "addWalletFromMnemonic";
    /// List wallets
    pub const GET_WALLETS: &str = "getWallets";
    /// Remove a wallet
    pub const REMOVE_WALLET: &str = "removeWallet";
    /// Balance of a wallet
    pub const GET_WALLET_STATE: &str = "getWalletState";
    /// Recent transactions of a wallet
    pub const GET_RECENT_TRANSACTIONS: &str = "getRecentTransactions";
    /// Ingest a TonConnect link
    pub const HANDLE_TON_CONNECT_URL: &str = "handleTonConnectUrl";
    /// Build a TON transfer
    pub const CREATE_TRANSFER_TON_TRANSACTION: &str = "createTransferTonTransaction";
    /// Sign and send a transaction
    pub const SEND_TRANSACTION: &str = "sendTransaction";
    /// List TonConnect sessions
    pub const LIST_SESSIONS: &str = "listSessions";
    /// Close one or all sessions
    pub const DISCONNECT_SESSION: &str = "disconnectSession";
}

const BUNDLE_MISSING_ENTRY: &str = "WalletKit bundle did not install __walletkitCall";

/// Construction options for [`WalletKitEngine`]
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Script bundle to load
    pub bundle: BundleSource,
    /// Replay bounds for undelivered events
    pub replay: ReplayPolicy,
    /// Configuration used when an operation runs before `init`
    pub config: Option<WalletKitConfig>,
}

impl EngineOptions {
    /// Options loading `bundle` with default replay bounds
    pub fn new(bundle: BundleSource) -> Self {
        Self {
            bundle,
            replay: ReplayPolicy::default(),
            config: None,
        }
    }

    /// Stashes `config` for lazy initialization and adopts its replay policy
    pub fn with_config(mut self, config: WalletKitConfig) -> Self {
        self.replay = config.replay.clone();
        self.config = Some(config);
        self
    }

    /// Sets the replay policy
    pub fn with_replay_policy(mut self, policy: ReplayPolicy) -> Self {
        self.replay = policy;
        self
    }
}

/// A running WalletKit bundle
pub struct WalletKitEngine {
    executor: Arc<ScriptExecutor>,
    rpc: Arc<RpcClient>,
    router: Arc<EventRouter>,
    retry: Arc<RetryStore>,
    gate: InitializationGate,
    wallets: WalletRecordStore,
    call_timeout: RwLock<Option<Duration>>,
    replay: ReplayPolicy,
    host_watch: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl WalletKitEngine {
    /// Installs the host functions, loads the bundle and waits for the
    /// call entry point to appear.
    ///
    /// A startup failure leaves nothing running and returns a transport error.
    pub async fn start(
        host: Arc<dyn ScriptHost>,
        storage: StorageHandles,
        options: EngineOptions,
    ) -> Result<Self> {
        let termination = host.termination();
        let executor = Arc::new(ScriptExecutor::new(host));
        let rpc = Arc::new(RpcClient::new(Arc::clone(&executor)));
        let handlers = Arc::new(HandlerRegistry::new());
        let (queue, inbox) = dispatch_channel();
        let retry = Arc::new(RetryStore::start(
            Arc::clone(&storage.events),
            queue.clone(),
            Arc::clone(&handlers),
            options.replay.clone(),
        ));
        let router = Arc::new(EventRouter::start(
            Arc::clone(&rpc),
            handlers,
            Arc::clone(&retry),
            queue,
            inbox,
        ));
        let host_watch = termination.map(|exited| watch_host(Arc::downgrade(&rpc), exited));

        let engine = Self {
            executor,
            rpc,
            router,
            retry,
            gate: InitializationGate::new(),
            wallets: WalletRecordStore::new(Arc::clone(&storage.wallets)),
            call_timeout: RwLock::new(None),
            replay: options.replay,
            host_watch: Mutex::new(host_watch),
            destroyed: AtomicBool::new(false),
        };
        if let Some(config) = options.config {
            engine.set_call_timeout(config.call_timeout);
            engine.gate.stash(config);
        }

        if let Err(error) = engine.boot(&options.bundle, storage.kv).await {
            let error = match error {
                WalletKitError::Transport(_) => error,
                other => WalletKitError::transport(other.to_string()),
            };
            engine.rpc.fail(error.clone());
            engine.shutdown().await;
            return Err(error);
        }
        Ok(engine)
    }

    async fn boot(&self, bundle: &BundleSource, kv: Arc<dyn KeyValueStore>) -> Result<()> {
        for (method, function) in native_functions(Arc::downgrade(&self.router), kv) {
            self.executor.register(NATIVE_OBJECT, method, function).await?;
        }

        let source = bundle.load().await?;
        let filename = bundle.filename();
        self.executor
            .evaluate(source, &filename)
            .await
            .map_err(|e| WalletKitError::transport(format!("Failed to load {filename}: {e}")))?;
        self.rpc.mark_bundle_loaded();
        tracing::info!(bundle = %filename, "WalletKit bundle loaded");

        let check = self
            .executor
            .evaluate(BRIDGE_CHECK, "walletkit-check.js")
            .await?;
        if !bridge_check_passed(&check) {
            return Err(WalletKitError::transport(BUNDLE_MISSING_ENTRY));
        }
        self.rpc.mark_bridge_installed();
        tracing::debug!("WalletKit bridge installed");
        Ok(())
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Initializes the bundle with `config`. Later calls are no-ops.
    ///
    /// The replay policy is fixed when the engine starts, through
    /// [`EngineOptions`]; `config.replay` is ignored here.
    pub async fn init(&self, config: WalletKitConfig) -> Result<()> {
        self.ensure_initialized(Some(config)).await
    }

    /// Returns true once `init` succeeded
    pub fn is_initialized(&self) -> bool {
        self.gate.is_initialized()
    }

    async fn ensure_initialized(&self, config: Option<WalletKitConfig>) -> Result<()> {
        self.check_alive()?;
        self.gate
            .ensure_initialized(config, |config| self.run_init(config))
            .await
    }

    async fn run_init(&self, config: WalletKitConfig) -> Result<()> {
        config.validate()?;
        if config.replay != self.replay {
            tracing::warn!("Ignoring replay policy passed to init; the policy is fixed at start");
        }
        self.set_call_timeout(config.call_timeout);
        self.raw_call(INIT_METHOD, Some(config.to_init_params()?))
            .await?;
        self.restore_wallets().await;
        Ok(())
    }

    async fn restore_wallets(&self) {
        let records = match self.wallets.load().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load wallet records");
                return;
            }
        };
        for record in records {
            let params = json!({
                "mnemonic": record.mnemonic,
                "name": record.name,
                "version": record.version,
                "network": record.network.chain_id(),
            });
            match self
                .raw_call(methods::ADD_WALLET_FROM_MNEMONIC, Some(params))
                .await
            {
                Ok(_) => tracing::debug!(address = %record.address, "Restored wallet"),
                Err(e) => tracing::warn!(address = %record.address, error = %e, "Failed to restore wallet"),
            }
        }
    }

    // ========================================================================
    // Wallets
    // ========================================================================

    /// Adds a wallet derived from `words` and remembers it across restarts
    pub async fn add_wallet_from_mnemonic(
        &self,
        words: &[String],
        name: Option<&str>,
        version: Option<&str>,
    ) -> Result<WalletAccount> {
        self.ensure_initialized(None).await?;
        let network = self
            .gate
            .stashed_config()
            .map(|c| c.network)
            .unwrap_or_default();
        let version = version.unwrap_or(DEFAULT_WALLET_VERSION);

        let params = json!({
            "mnemonic": words,
            "name": name,
            "version": version,
            "network": network.chain_id(),
        });
        let result = self
            .raw_call(methods::ADD_WALLET_FROM_MNEMONIC, Some(params))
            .await?;
        let account = parse_account(&result)?;

        let record = WalletRecord {
            address: account.address.clone(),
            mnemonic: words.to_vec(),
            name: name.map(str::to_string),
            network,
            version: version.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.wallets.upsert(record).await {
            tracing::warn!(address = %account.address, error = %e, "Failed to persist wallet record");
        }
        tracing::info!(address = %account.address, "Wallet added");
        Ok(account)
    }

    /// Wallets known to the bundle
    pub async fn get_wallets(&self) -> Result<Vec<WalletAccount>> {
        let result = self.call(methods::GET_WALLETS, None).await?;
        Ok(decode_list(result_list(&result, "wallets"), "wallet"))
    }

    /// Removes a wallet and forgets its record
    pub async fn remove_wallet(&self, address: &str) -> Result<()> {
        self.call(methods::REMOVE_WALLET, Some(json!({ "address": address })))
            .await?;
        if let Err(e) = self.wallets.remove(address).await {
            tracing::warn!(address, error = %e, "Failed to delete wallet record");
        }
        Ok(())
    }

    /// Balance of a wallet
    pub async fn get_wallet_state(&self, address: &str) -> Result<WalletState> {
        let result = self
            .call(methods::GET_WALLET_STATE, Some(json!({ "address": address })))
            .await?;
        let bare_balance = match result.get("balance") {
            Some(_) => None,
            None => result.get("value").cloned(),
        };
        let state = match bare_balance {
            Some(balance) => json!({ "balance": balance }),
            None => result,
        };
        serde_json::from_value(state)
            .map_err(|e| WalletKitError::bridge(format!("Invalid wallet state: {e}")))
    }

    /// Latest native transactions of a wallet, jetton transfers removed
    pub async fn get_recent_transactions(&self, address: &str, limit: u32) -> Result<Vec<Transaction>> {
        let result = self
            .call(
                methods::GET_RECENT_TRANSACTIONS,
                Some(json!({ "address": address, "limit": limit })),
            )
            .await?;
        Ok(classify_all(&result_list(&result, "transactions")))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Builds a TON transfer for later signing
    pub async fn create_transfer_ton_transaction(&self, params: &TransferParams) -> Result<Value> {
        params.validate()?;
        self.call(
            methods::CREATE_TRANSFER_TON_TRANSACTION,
            Some(serde_json::to_value(params)?),
        )
        .await
    }

    /// Signs and sends a transaction built by the bundle
    pub async fn send_transaction(&self, wallet_address: &str, transaction_content: Value) -> Result<Value> {
        self.call(
            methods::SEND_TRANSACTION,
            Some(json!({
                "walletAddress": wallet_address,
                "transactionContent": transaction_content,
            })),
        )
        .await
    }

    // ========================================================================
    // TonConnect
    // ========================================================================

    /// Hands a TonConnect link to the bundle; the resulting connect request
    /// arrives as an event
    pub async fn handle_ton_connect_url(&self, url: &str) -> Result<Value> {
        Url::parse(url)
            .map_err(|e| WalletKitError::bridge(format!("Invalid TonConnect URL: {e}")))?;
        self.call(methods::HANDLE_TON_CONNECT_URL, Some(json!({ "url": url })))
            .await
    }

    /// Approves a connect request for `wallet_address`
    pub async fn approve_connect(&self, request: &ConnectRequest, wallet_address: &str) -> Result<()> {
        self.ensure_initialized(None).await?;
        request.approve(wallet_address).await
    }

    /// Rejects a connect request
    pub async fn reject_connect(&self, request: &ConnectRequest, reason: Option<&str>) -> Result<()> {
        self.ensure_initialized(None).await?;
        request.reject(reason).await
    }

    /// Approves a transaction request
    pub async fn approve_transaction(&self, request: &TransactionRequest) -> Result<Value> {
        self.ensure_initialized(None).await?;
        request.approve().await
    }

    /// Rejects a transaction request
    pub async fn reject_transaction(&self, request: &TransactionRequest, reason: Option<&str>) -> Result<()> {
        self.ensure_initialized(None).await?;
        request.reject(reason).await
    }

    /// Approves a sign-data request, returning the signature
    pub async fn approve_sign_data(&self, request: &SignDataRequest) -> Result<String> {
        self.ensure_initialized(None).await?;
        request.approve().await
    }

    /// Rejects a sign-data request
    pub async fn reject_sign_data(&self, request: &SignDataRequest, reason: Option<&str>) -> Result<()> {
        self.ensure_initialized(None).await?;
        request.reject(reason).await
    }

    /// Active TonConnect sessions
    pub async fn list_sessions(&self) -> Result<Vec<WalletSession>> {
        let result = self.call(methods::LIST_SESSIONS, None).await?;
        Ok(decode_list(result_list(&result, "sessions"), "session"))
    }

    /// Closes one session, or every session when `session_id` is `None`
    pub async fn disconnect_session(&self, session_id: Option<&str>) -> Result<()> {
        let params = session_id.map(|id| json!({ "sessionId": id }));
        self.call(methods::DISCONNECT_SESSION, params).await?;
        Ok(())
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Registers an event handler; undelivered events are replayed to it
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.router.add_handler(handler)
    }

    /// Unregisters an event handler
    pub fn remove_event_handler(&self, id: HandlerId) -> bool {
        self.router.remove_handler(id)
    }

    /// Network and endpoints reported by the bundle's `ready` message
    pub fn ready_info(&self) -> Option<ReadyInfo> {
        self.router.ready_info()
    }

    /// Replays undelivered events now
    pub async fn replay_pending_events(&self) -> ReplayReport {
        self.retry.replay_all().await
    }

    /// The underlying RPC client
    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Fails pending calls, stops background work and closes the host.
    ///
    /// Every later operation fails without touching the host.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.rpc.close();
        self.shutdown().await;
        tracing::info!("WalletKit destroyed");
    }

    /// Returns true after [`WalletKitEngine::destroy`]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        if let Some(task) = self.host_watch.lock().ok().and_then(|mut w| w.take()) {
            task.abort();
        }
        self.router.shutdown();
        self.retry.shutdown();
        self.executor.shutdown().await;
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(WalletKitError::transport("Bridge destroyed"));
        }
        Ok(())
    }

    fn set_call_timeout(&self, timeout: Option<Duration>) {
        if let Ok(mut current) = self.call_timeout.write() {
            *current = timeout;
        }
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.ensure_initialized(None).await?;
        self.raw_call(method, params).await
    }

    async fn raw_call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let timeout = self.call_timeout.read().ok().and_then(|t| *t);
        match timeout {
            Some(timeout) => self.rpc.call_with_timeout(method, params, timeout).await,
            None => self.rpc.call(method, params).await,
        }
    }
}

impl std::fmt::Debug for WalletKitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletKitEngine")
            .field("rpc", &self.rpc)
            .field("initialized", &self.is_initialized())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Fails the client once the host reports it terminated on its own
fn watch_host(rpc: Weak<RpcClient>, mut exited: watch::Receiver<Option<String>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            let current = exited.borrow_and_update().clone();
            if let Some(reason) = current {
                break reason;
            }
            if exited.changed().await.is_err() {
                return;
            }
        };
        if let Some(rpc) = rpc.upgrade() {
            rpc.fail(WalletKitError::transport(reason));
        }
    })
}

fn parse_account(result: &Value) -> Result<WalletAccount> {
    let account = result
        .get("wallet")
        .filter(|w| w.is_object())
        .unwrap_or(result);
    if let Some(address) = account.get("value").and_then(Value::as_str) {
        return Ok(WalletAccount {
            address: address.to_string(),
            public_key: None,
            version: None,
            network: None,
            index: None,
        });
    }
    serde_json::from_value(account.clone())
        .map_err(|e| WalletKitError::bridge(format!("Invalid wallet in response: {e}")))
}

/// Host functions installed on [`NATIVE_OBJECT`]
fn native_functions(router: Weak<EventRouter>, kv: Arc<dyn KeyValueStore>) -> Vec<(&'static str, HostFunction)> {
    let storage_error = |e: WalletKitError| {
        tracing::warn!(error = %e, "Script storage call failed");
        e.to_string()
    };

    let get_kv = Arc::clone(&kv);
    let set_kv = Arc::clone(&kv);
    let remove_kv = Arc::clone(&kv);
    let clear_kv = kv;

    vec![
        (
            "postMessage",
            host_function(move |args| {
                let message = string_arg(&args, 0, "postMessage")?;
                match router.upgrade() {
                    Some(router) => router.post(&message),
                    None => tracing::debug!("Message posted after teardown"),
                }
                Ok(HostValue::Void)
            }),
        ),
        (
            "log",
            host_function(|args| {
                let level = string_arg(&args, 0, "log")?;
                let message = string_arg(&args, 1, "log").unwrap_or_default();
                match level.to_ascii_lowercase().as_str() {
                    "error" => tracing::error!(target: "walletkit::script", "{message}"),
                    "warn" | "warning" => tracing::warn!(target: "walletkit::script", "{message}"),
                    "debug" => tracing::debug!(target: "walletkit::script", "{message}"),
                    "trace" => tracing::trace!(target: "walletkit::script", "{message}"),
                    _ => tracing::info!(target: "walletkit::script", "{message}"),
                }
                Ok(HostValue::Void)
            }),
        ),
        (
            "storageGet",
            host_function(move |args| {
                let key = string_arg(&args, 0, "storageGet")?;
                match get_kv.get(&key).map_err(storage_error)? {
                    Some(value) => Ok(HostValue::String(value)),
                    None => Ok(HostValue::Void),
                }
            }),
        ),
        (
            "storageSet",
            host_function(move |args| {
                let key = string_arg(&args, 0, "storageSet")?;
                let value = string_arg(&args, 1, "storageSet")?;
                set_kv.set(&key, &value).map_err(storage_error)?;
                Ok(HostValue::Void)
            }),
        ),
        (
            "storageRemove",
            host_function(move |args| {
                let key = string_arg(&args, 0, "storageRemove")?;
                remove_kv.remove(&key).map_err(storage_error)?;
                Ok(HostValue::Void)
            }),
        ),
        (
            "storageClear",
            host_function(move |_| {
                clear_kv.clear().map_err(storage_error)?;
                Ok(HostValue::Void)
            }),
        ),
    ]
}

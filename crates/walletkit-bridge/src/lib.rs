//! # WalletKit Bridge
//!
//! Host-side bridge to the TON WalletKit script bundle. The bundle runs in an
//! embedded script engine; this crate drives it over a message channel and
//! exposes wallets, TonConnect requests and sessions as typed Rust APIs.
//!
//! ## Features
//!
//! - Call-id correlated RPC over a serialized script executor
//! - Lazy, single-flight initialization
//! - Typed TonConnect events with approve/reject request objects
//! - Persistence and bounded replay of events no handler accepted
//! - Native vs jetton transaction classification
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use walletkit_bridge::{
//!     BundleSource, EngineOptions, ProcessHostConfig, ProcessScriptHost, StorageHandles,
//!     WalletKitConfig, WalletKitEngine, WalletKitEvent,
//! };
//!
//! let host = Arc::new(ProcessScriptHost::spawn(ProcessHostConfig::default())?);
//! let options = EngineOptions::new(BundleSource::File("walletkit.js".into()));
//! let engine = WalletKitEngine::start(host, StorageHandles::in_memory(), options).await?;
//!
//! engine.init(WalletKitConfig::testnet()).await?;
//! engine.add_event_handler(Arc::new(|event: &WalletKitEvent| {
//!     println!("{}", event.event_type());
//!     Ok(())
//! }));
//! for wallet in engine.get_wallets().await? {
//!     println!("{}", wallet.address);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod classifier;
pub mod config;
pub mod engine;
pub mod events;
pub mod host;
pub mod init;
pub mod message;
pub mod requests;
pub mod retry;
pub mod router;
pub mod rpc;
pub mod storage;
pub mod wallet;

pub use classifier::{classify, classify_all, classify_value, RawTransaction, Transaction, TransactionType};
pub use config::{BundleSource, DeviceInfo, TonNetwork, WalletKitConfig, WalletManifest};
pub use engine::{EngineOptions, WalletKitEngine};
pub use events::{ConnectPermission, DAppInfo, TransactionMessage, WalletKitEvent};
pub use host::{
    host_function, HostFunction, HostValue, ProcessHostConfig, ProcessScriptHost, ScriptExecutor,
    ScriptHost,
};
pub use init::InitializationGate;
pub use message::{BridgeMessage, EventEnvelope, ReadyInfo, ResponseMessage};
pub use requests::{ConnectRequest, SignDataRequest, TransactionRequest};
pub use retry::{ReplayReport, RetryStore};
pub use router::{EventHandler, EventRouter, HandlerId, HandlerRegistry};
pub use rpc::{CallScript, RpcClient};
pub use storage::{
    FileStore, KeyValueStore, MemoryStore, PendingEvent, PendingEventStore, ScopedStore,
    StorageHandles,
};
pub use wallet::{TransferParams, WalletAccount, WalletRecord, WalletSession, WalletState};

pub use walletkit_error::{Result, WalletKitError};
pub use walletkit_resilience::ReplayPolicy;

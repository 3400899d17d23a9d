//! # WalletKit Testing Infrastructure
//!
//! Testing utilities for the WalletKit bridge:
//! - A scriptable in-process [`MockScriptHost`]
//! - Canned bridge messages
//! - Raw transaction fixtures
//! - Property-based strategies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use walletkit_testing::*;
//!
//! let host = Arc::new(MockScriptHost::new().with_responder(|call| match call.method.as_str() {
//!     "getWallets" => MockReply::result(json!([{"address": "EQa"}])),
//!     _ => MockReply::result(json!({})),
//! }));
//! let engine = WalletKitEngine::start(host.clone(), StorageHandles::in_memory(), options()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use walletkit_bridge::engine::NATIVE_OBJECT;
use walletkit_bridge::rpc::{BRIDGE_CHECK, INIT_METHOD};
use walletkit_bridge::{BundleSource, CallScript, EngineOptions, HostFunction, HostValue, ScriptHost};
use walletkit_error::{Result, WalletKitError};

// ============================================================================
// Mock Script Host
// ============================================================================

/// How the mock answers one call
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Post a response with this result
    Result(Value),
    /// Post an error response
    Error(String),
    /// Post nothing; the call stays pending
    Silent,
}

impl MockReply {
    /// Successful reply
    pub fn result(value: Value) -> Self {
        MockReply::Result(value)
    }

    /// Error reply
    pub fn error(message: impl Into<String>) -> Self {
        MockReply::Error(message.into())
    }
}

type Responder = Arc<dyn Fn(&CallScript) -> MockReply + Send + Sync>;

/// An in-process [`ScriptHost`] standing in for the WalletKit bundle.
///
/// Calls are parsed back into [`CallScript`]s and answered through the
/// registered `postMessage` function, exactly as the bundle would. After
/// answering `init` the mock posts a `ready` message.
pub struct MockScriptHost {
    functions: Mutex<HashMap<String, HostFunction>>,
    scripts: Mutex<Vec<String>>,
    calls: Mutex<Vec<CallScript>>,
    responder: Mutex<Responder>,
    bridge_installed: AtomicBool,
    fail_bundle: AtomicBool,
    auto_ready: AtomicBool,
    closed: AtomicBool,
    exited: watch::Sender<Option<String>>,
}

impl Default for MockScriptHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScriptHost {
    /// A host answering every call with `{}`
    pub fn new() -> Self {
        Self {
            functions: Mutex::new(HashMap::new()),
            scripts: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            responder: Mutex::new(Arc::new(|_: &CallScript| MockReply::result(json!({})))),
            bridge_installed: AtomicBool::new(true),
            fail_bundle: AtomicBool::new(false),
            auto_ready: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            exited: watch::channel(None).0,
        }
    }

    /// Replaces the responder
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&CallScript) -> MockReply + Send + Sync + 'static,
    {
        self.set_responder(responder);
        self
    }

    /// Makes the bundle leave `__walletkitCall` undefined
    pub fn without_bridge(self) -> Self {
        self.bridge_installed.store(false, Ordering::SeqCst);
        self
    }

    /// Makes bundle evaluation throw
    pub fn with_failing_bundle(self) -> Self {
        self.fail_bundle.store(true, Ordering::SeqCst);
        self
    }

    /// Stops the mock from posting `ready` after `init`
    pub fn without_auto_ready(self) -> Self {
        self.auto_ready.store(false, Ordering::SeqCst);
        self
    }

    /// Replaces the responder on a running host
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&CallScript) -> MockReply + Send + Sync + 'static,
    {
        if let Ok(mut current) = self.responder.lock() {
            *current = Arc::new(responder);
        }
    }

    /// Posts `message` through the registered `postMessage` function
    pub fn post(&self, message: &Value) -> std::result::Result<(), String> {
        let function = self
            .function(NATIVE_OBJECT, "postMessage")
            .ok_or_else(|| "postMessage not registered".to_string())?;
        function(vec![HostValue::String(message.to_string())]).map(|_| ())
    }

    /// Invokes a registered host function directly
    pub fn invoke(&self, object: &str, method: &str, args: Vec<HostValue>) -> std::result::Result<HostValue, String> {
        let function = self
            .function(object, method)
            .ok_or_else(|| format!("{object}.{method} not registered"))?;
        function(args)
    }

    /// Returns true if `object.method` was registered
    pub fn is_registered(&self, object: &str, method: &str) -> bool {
        self.function(object, method).is_some()
    }

    /// Every evaluated script, in order
    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Every call received, in order
    pub fn calls(&self) -> Vec<CallScript> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls received for `method`
    pub fn calls_to(&self, method: &str) -> Vec<CallScript> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method)
            .collect()
    }

    /// Simulates the engine dying on its own: later evaluations fail and
    /// the termination watch reports `reason`
    pub fn terminate(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        self.exited.send_replace(Some(reason.to_string()));
    }

    /// Returns true once the host was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn function(&self, object: &str, method: &str) -> Option<HostFunction> {
        self.functions
            .lock()
            .ok()
            .and_then(|f| f.get(&format!("{object}.{method}")).cloned())
    }

    fn answer(&self, call: &CallScript) -> std::result::Result<(), String> {
        let responder = match self.responder.lock() {
            Ok(responder) => Arc::clone(&responder),
            Err(_) => return Err("responder poisoned".to_string()),
        };
        match responder(call) {
            MockReply::Result(result) => self.post(&messages::response(&call.call_id, result))?,
            MockReply::Error(message) => self.post(&messages::error_response(&call.call_id, &message))?,
            MockReply::Silent => return Ok(()),
        }
        if call.method == INIT_METHOD && self.auto_ready.load(Ordering::SeqCst) {
            self.post(&messages::ready("testnet"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptHost for MockScriptHost {
    async fn evaluate(&self, script: &str, filename: &str) -> Result<HostValue> {
        if self.is_closed() {
            return Err(WalletKitError::transport("Script host closed"));
        }
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push(script.to_string());
        }

        if script == BRIDGE_CHECK {
            return Ok(HostValue::Boolean(self.bridge_installed.load(Ordering::SeqCst)));
        }
        if let Some(call) = CallScript::parse(script) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call.clone());
            }
            self.answer(&call).map_err(WalletKitError::bridge)?;
            return Ok(HostValue::Void);
        }
        if self.fail_bundle.load(Ordering::SeqCst) {
            return Err(WalletKitError::bridge(format!(
                "SyntaxError: unexpected token in {filename}"
            )));
        }
        Ok(HostValue::Void)
    }

    async fn register(&self, object: &str, method: &str, function: HostFunction) -> Result<()> {
        if let Ok(mut functions) = self.functions.lock() {
            functions.insert(format!("{object}.{method}"), function);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn termination(&self) -> Option<watch::Receiver<Option<String>>> {
        Some(self.exited.subscribe())
    }
}

impl std::fmt::Debug for MockScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockScriptHost")
            .field("scripts", &self.scripts().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Engine options loading an empty inline bundle
pub fn mock_options() -> EngineOptions {
    EngineOptions::new(BundleSource::inline("/* walletkit */", "walletkit-mock.js"))
}

// ============================================================================
// Canned Messages
// ============================================================================

/// Builders for messages the bundle posts
pub mod messages {
    use serde_json::{json, Value};

    /// `ready` message
    pub fn ready(network: &str) -> Value {
        json!({
            "kind": "ready",
            "network": network,
            "tonApiUrl": "https://testnet.tonapi.io",
        })
    }

    /// Successful `response`
    pub fn response(id: &str, result: Value) -> Value {
        json!({ "kind": "response", "id": id, "result": result })
    }

    /// Failed `response`
    pub fn error_response(id: &str, message: &str) -> Value {
        json!({ "kind": "response", "id": id, "error": { "message": message } })
    }

    /// Nested `event` message
    pub fn event(event_type: &str, id: Option<&str>, data: Value) -> Value {
        let mut event = json!({ "type": event_type, "data": data });
        if let Some(id) = id {
            event["id"] = json!(id);
        }
        json!({ "kind": "event", "event": event })
    }

    /// `connectRequest` event
    pub fn connect_request(id: &str) -> Value {
        event(
            "connectRequest",
            Some(id),
            json!({
                "id": id,
                "preview": {
                    "manifest": {
                        "name": "Ston.fi",
                        "url": "https://app.ston.fi",
                        "iconUrl": "https://app.ston.fi/icon.png"
                    },
                    "manifestUrl": "https://app.ston.fi/tonconnect-manifest.json"
                },
                "request": { "items": [{ "name": "ton_addr" }] }
            }),
        )
    }

    /// `transactionRequest` event with one message
    pub fn transaction_request(id: &str, to: &str, amount: &str) -> Value {
        event(
            "transactionRequest",
            Some(id),
            json!({
                "id": id,
                "dAppInfo": { "name": "Ston.fi" },
                "request": {
                    "messages": [{ "address": to, "amount": amount }],
                    "validUntil": 1_900_000_000
                }
            }),
        )
    }

    /// `signDataRequest` event with a text payload
    pub fn sign_data_request(id: &str, text: &str) -> Value {
        event(
            "signDataRequest",
            Some(id),
            json!({
                "id": id,
                "request": { "payload": { "type": "text", "text": text } }
            }),
        )
    }

    /// `disconnect` event
    pub fn disconnect(session_id: &str) -> Value {
        event("disconnect", None, json!({ "sessionId": session_id }))
    }
}

// ============================================================================
// Transaction Fixtures
// ============================================================================

/// Raw indexer records
pub mod fixtures {
    use serde_json::{json, Value};

    /// Incoming native transfer
    pub fn incoming(hash: &str, amount: &str, comment: Option<&str>) -> Value {
        json!({
            "hash_hex": hash,
            "now": 1_700_000_000,
            "lt": "4200",
            "total_fees": "1000",
            "in_msg": {
                "source_friendly": "EQsender",
                "value": amount,
                "message": comment
            },
            "out_msgs": []
        })
    }

    /// Outgoing native transfer
    pub fn outgoing(hash: &str, amount: &str) -> Value {
        json!({
            "hash_hex": hash,
            "now": 1_700_000_100,
            "in_msg": { "value": "0" },
            "out_msgs": [{ "destination_friendly": "EQrecipient", "value": amount }]
        })
    }

    /// Incoming jetton notification
    pub fn jetton(hash: &str) -> Value {
        json!({
            "hash_hex": hash,
            "now": 1_700_000_200,
            "in_msg": {
                "value": "50000000",
                "opcode": "0x7362d09c",
                "message_content": { "body": "te6cckEBAQEADgAAGAAAAABoZWxsbz8=" }
            },
            "out_msgs": []
        })
    }
}

// ============================================================================
// Property-Based Testing Strategies
// ============================================================================

/// Strategy for nanoton amounts
pub fn nanoton_amount() -> impl Strategy<Value = u64> {
    1u64..=5_000_000_000_000
}

/// Strategy for message comments, short and long
pub fn comment_text() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z0-9 ]{0,64}",
        "[a-z]{190,260}",
    ]
}

/// Strategy for optional op codes
pub fn opcode() -> impl Strategy<Value = Option<String>> {
    proptest::option::of("0x[0-9a-f]{8}")
}

/// Strategy for raw transaction records mixing native and jetton shapes
pub fn raw_transaction() -> impl Strategy<Value = Value> {
    (
        "[0-9a-f]{64}",
        nanoton_amount(),
        proptest::option::of(comment_text()),
        opcode(),
        any::<bool>(),
    )
        .prop_map(|(hash, amount, comment, opcode, incoming)| {
            let message = json!({
                "value": amount.to_string(),
                "message": comment,
                "opcode": opcode,
                "source_friendly": "EQsender",
                "destination_friendly": "EQrecipient",
            });
            if incoming {
                json!({ "hash_hex": hash, "now": 1_700_000_000, "in_msg": message, "out_msgs": [] })
            } else {
                json!({ "hash_hex": hash, "now": 1_700_000_000, "out_msgs": [message] })
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use walletkit_bridge::{classify_value, TransactionType};

    #[test]
    fn test_fixtures_classify() {
        let tx = classify_value(&fixtures::incoming("aa", "100", Some("hi"))).unwrap();
        assert_eq!(tx.transaction_type, TransactionType::Incoming);
        let tx = classify_value(&fixtures::outgoing("bb", "7")).unwrap();
        assert_eq!(tx.transaction_type, TransactionType::Outgoing);
        assert_eq!(tx.recipient.as_deref(), Some("EQrecipient"));
        assert!(classify_value(&fixtures::jetton("cc")).is_none());
    }

    #[tokio::test]
    async fn test_mock_answers_calls() {
        let host = MockScriptHost::new().with_responder(|call| match call.method.as_str() {
            "boom" => MockReply::error("nope"),
            _ => MockReply::result(json!({"ok": true})),
        });
        let posted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&posted);
        host.register(
            NATIVE_OBJECT,
            "postMessage",
            Arc::new(move |args: Vec<HostValue>| {
                if let Some(HostValue::String(s)) = args.first() {
                    sink.lock().unwrap().push(s.clone());
                }
                Ok(HostValue::Void)
            }),
        )
        .await
        .unwrap();

        let script = CallScript {
            call_id: "1".to_string(),
            method: "boom".to_string(),
            params: None,
        }
        .render()
        .unwrap();
        host.evaluate(&script, "call.js").await.unwrap();

        let posted = posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].contains("nope"));
        assert_eq!(host.calls_to("boom").len(), 1);
    }

    #[tokio::test]
    async fn test_mock_bridge_check_and_close() {
        let host = MockScriptHost::new().without_bridge();
        assert_eq!(
            host.evaluate(BRIDGE_CHECK, "check.js").await.unwrap(),
            HostValue::Boolean(false)
        );
        host.close().await;
        assert!(host.evaluate("1", "x.js").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_terminate_reports_reason() {
        let host = MockScriptHost::new();
        let exited = host.termination().unwrap();
        assert_eq!(*exited.borrow(), None);

        host.terminate("exit code 3");
        assert_eq!(exited.borrow().as_deref(), Some("exit code 3"));
        assert!(host.evaluate("1", "x.js").await.is_err());
    }

    proptest! {
        #[test]
        fn test_raw_transactions_parse(record in raw_transaction()) {
            let parsed: std::result::Result<walletkit_bridge::RawTransaction, _> =
                serde_json::from_value(record);
            prop_assert!(parsed.is_ok());
        }
    }
}

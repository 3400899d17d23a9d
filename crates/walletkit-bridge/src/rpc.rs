//! Correlated calls into the script.
//!
//! A call registers a pending entry under a fresh call id, evaluates
//! `globalThis.__walletkitCall(id, method, payload)` and waits until the
//! script posts a `response` message carrying the same id.

use crate::host::{HostValue, ScriptExecutor};
use crate::message::ResponseMessage;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;
use walletkit_error::{Result, WalletKitError};
use walletkit_resilience::with_timeout;

/// Global function the bundle installs to receive calls
pub const CALL_ENTRY_POINT: &str = "__walletkitCall";

/// Script that evaluates to `true` once the entry point is installed
pub const BRIDGE_CHECK: &str = "typeof globalThis.__walletkitCall === \"function\"";

/// The only method allowed before the bundle reports ready
pub const INIT_METHOD: &str = "init";

const CALL_FILENAME: &str = "walletkit-call.js";
const BRIDGE_DESTROYED: &str = "Bridge destroyed";

/// A rendered invocation of [`CALL_ENTRY_POINT`]
#[derive(Debug, Clone, PartialEq)]
pub struct CallScript {
    /// Correlation id
    pub call_id: String,
    /// Method name
    pub method: String,
    /// Parameters, if any
    pub params: Option<Value>,
}

impl CallScript {
    /// Renders the script text. Parameters travel as base64 of their JSON.
    pub fn render(&self) -> Result<String> {
        let payload = match &self.params {
            Some(params) => {
                let json = serde_json::to_vec(params)?;
                serde_json::to_string(&STANDARD.encode(json))?
            }
            None => "null".to_string(),
        };
        Ok(format!(
            "globalThis.{CALL_ENTRY_POINT}({},{},{})",
            serde_json::to_string(&self.call_id)?,
            serde_json::to_string(&self.method)?,
            payload
        ))
    }

    /// Parses script text produced by [`CallScript::render`]
    pub fn parse(script: &str) -> Option<Self> {
        let args = script
            .trim()
            .strip_prefix("globalThis.")?
            .strip_prefix(CALL_ENTRY_POINT)?
            .strip_prefix('(')?
            .strip_suffix(')')?;
        let args: Vec<Value> = serde_json::from_str(&format!("[{args}]")).ok()?;
        let [call_id, method, payload] = <[Value; 3]>::try_from(args).ok()?;

        let params = match payload {
            Value::Null => None,
            Value::String(encoded) => {
                let bytes = STANDARD.decode(encoded).ok()?;
                Some(serde_json::from_slice(&bytes).ok()?)
            }
            _ => return None,
        };
        Some(Self {
            call_id: call_id.as_str()?.to_string(),
            method: method.as_str()?.to_string(),
            params,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Readiness {
    bundle_loaded: bool,
    bridge_installed: bool,
    app_ready: bool,
    terminal: Option<WalletKitError>,
}

impl Readiness {
    fn satisfied(&self, require_app: bool) -> bool {
        self.bundle_loaded && self.bridge_installed && (self.app_ready || !require_app)
    }
}

/// Removes a pending entry when the waiting call goes away
struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Result<Value>>>,
    call_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.call_id);
    }
}

/// Issues calls into the script and resolves them from `response` messages
pub struct RpcClient {
    executor: Arc<ScriptExecutor>,
    pending: DashMap<String, oneshot::Sender<Result<Value>>>,
    readiness: watch::Sender<Readiness>,
}

impl RpcClient {
    /// Creates a client evaluating through `executor`
    pub fn new(executor: Arc<ScriptExecutor>) -> Self {
        let (readiness, _) = watch::channel(Readiness::default());
        Self {
            executor,
            pending: DashMap::new(),
            readiness,
        }
    }

    /// Calls `method` and waits for its response.
    ///
    /// Every method except `init` first waits for the bundle to report ready.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.wait_ready(method != INIT_METHOD).await?;

        let call_id = Uuid::new_v4().to_string();
        let script = CallScript {
            call_id: call_id.clone(),
            method: method.to_string(),
            params,
        }
        .render()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            call_id: call_id.clone(),
        };
        if let Some(error) = self.terminal_error() {
            return Err(error);
        }

        tracing::debug!(call_id = %call_id, method, "Calling bridge");
        if let Err(e) = self.executor.evaluate(script, CALL_FILENAME).await {
            if matches!(e, WalletKitError::Transport(_)) {
                self.fail(e.clone());
            }
            return Err(e);
        }

        match rx.await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::debug!(call_id = %call_id, method, error = %e, "Bridge call failed");
                }
                result
            }
            Err(_) => Err(self
                .terminal_error()
                .unwrap_or_else(|| WalletKitError::transport(BRIDGE_DESTROYED))),
        }
    }

    /// [`RpcClient::call`] with a deadline.
    ///
    /// On expiry the pending entry is dropped; a late response is ignored.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        with_timeout(timeout, method, self.call(method, params))
            .await
            .map_err(|e| WalletKitError::Timeout {
                operation: e.operation,
                millis: u64::try_from(e.duration.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    /// Resolves the pending call a response belongs to.
    ///
    /// Returns false when no call is waiting for that id.
    pub fn resolve(&self, response: ResponseMessage) -> bool {
        match self.pending.remove(&response.id) {
            Some((call_id, reply)) => {
                tracing::trace!(call_id = %call_id, "Resolving bridge call");
                let _ = reply.send(response.into_result());
                true
            }
            None => {
                tracing::debug!(call_id = %response.id, "No pending call for response");
                false
            }
        }
    }

    /// Records that the bundle was evaluated
    pub fn mark_bundle_loaded(&self) {
        self.readiness.send_modify(|r| r.bundle_loaded = true);
    }

    /// Records that the call entry point exists
    pub fn mark_bridge_installed(&self) {
        self.readiness.send_modify(|r| r.bridge_installed = true);
    }

    /// Records the bundle's own `ready` signal
    pub fn mark_app_ready(&self) {
        self.readiness.send_modify(|r| r.app_ready = true);
    }

    /// Returns true once all three readiness conditions hold
    pub fn is_ready(&self) -> bool {
        let state = self.readiness.borrow();
        state.terminal.is_none() && state.satisfied(true)
    }

    /// Fails every pending and future call with `error`.
    ///
    /// Only the first failure or close is kept.
    pub fn fail(&self, error: WalletKitError) {
        let message = error.to_string();
        if self.enter_terminal(error) {
            tracing::error!(error = %message, "Bridge failed");
        }
    }

    /// Tears the client down; pending and future calls fail
    pub fn close(&self) {
        self.enter_terminal(WalletKitError::transport(BRIDGE_DESTROYED));
    }

    /// Returns true after [`RpcClient::close`] or [`RpcClient::fail`]
    pub fn is_closed(&self) -> bool {
        self.readiness.borrow().terminal.is_some()
    }

    /// Number of calls awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn enter_terminal(&self, error: WalletKitError) -> bool {
        let entered = self.readiness.send_if_modified(|r| {
            if r.terminal.is_some() {
                return false;
            }
            r.terminal = Some(error);
            true
        });

        let error = self
            .terminal_error()
            .unwrap_or_else(|| WalletKitError::transport(BRIDGE_DESTROYED));
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(error.clone()));
            }
        }
        entered
    }

    fn terminal_error(&self) -> Option<WalletKitError> {
        self.readiness.borrow().terminal.clone()
    }

    async fn wait_ready(&self, require_app: bool) -> Result<()> {
        let mut rx = self.readiness.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if let Some(error) = &state.terminal {
                    return Err(error.clone());
                }
                if state.satisfied(require_app) {
                    return Ok(());
                }
            }
            rx.changed()
                .await
                .map_err(|_| WalletKitError::transport(BRIDGE_DESTROYED))?;
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("pending", &self.pending.len())
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Interprets the bridge check result
pub(crate) fn bridge_check_passed(value: &HostValue) -> bool {
    match value {
        HostValue::Boolean(b) => *b,
        HostValue::String(s) => s == "true",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostFunction, ScriptHost};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptLog {
        scripts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ScriptHost for ScriptLog {
        async fn evaluate(&self, script: &str, _filename: &str) -> Result<HostValue> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(HostValue::Void)
        }

        async fn register(&self, _: &str, _: &str, _: HostFunction) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn client() -> (Arc<ScriptLog>, Arc<RpcClient>) {
        let host = Arc::new(ScriptLog::default());
        let executor = Arc::new(ScriptExecutor::new(host.clone()));
        (host, Arc::new(RpcClient::new(executor)))
    }

    fn ready(client: &RpcClient) {
        client.mark_bundle_loaded();
        client.mark_bridge_installed();
        client.mark_app_ready();
    }

    async fn wait_for_scripts(host: &ScriptLog, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let scripts = host.scripts.lock().unwrap().clone();
            if scripts.len() >= count {
                return scripts;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} evaluations");
    }

    #[test]
    fn test_call_script_render_and_parse() {
        let call = CallScript {
            call_id: "abc".into(),
            method: "getWallets".into(),
            params: Some(json!({"limit": 10, "note": "quote\" and \\ slash"})),
        };
        let script = call.render().unwrap();
        assert!(script.starts_with("globalThis.__walletkitCall(\"abc\",\"getWallets\",\""));
        assert_eq!(CallScript::parse(&script), Some(call));

        let bare = CallScript {
            call_id: "x".into(),
            method: "init".into(),
            params: None,
        };
        let script = bare.render().unwrap();
        assert!(script.ends_with(",null)"));
        assert_eq!(CallScript::parse(&script), Some(bare));
        assert_eq!(CallScript::parse(BRIDGE_CHECK), None);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_is_noop() {
        let (_host, client) = client();
        let resolved = client.resolve(ResponseMessage {
            id: "missing".into(),
            result: None,
            error: None,
        });
        assert!(!resolved);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_resolves_and_second_resolution_is_ignored() {
        let (host, client) = client();
        ready(&client);

        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.call("getWallets", None).await })
        };
        let scripts = wait_for_scripts(&host, 1).await;
        let call = CallScript::parse(&scripts[0]).unwrap();

        assert!(client.resolve(ResponseMessage {
            id: call.call_id.clone(),
            result: Some(json!([{"address": "EQ1"}])),
            error: None,
        }));
        assert!(!client.resolve(ResponseMessage {
            id: call.call_id,
            result: None,
            error: Some("late".into()),
        }));

        let value = caller.await.unwrap().unwrap();
        assert_eq!(value, json!({"items": [{"address": "EQ1"}]}));
    }

    #[tokio::test]
    async fn test_init_only_waits_for_bridge_install() {
        let (host, client) = client();
        client.mark_bundle_loaded();
        client.mark_bridge_installed();

        let init = {
            let client = client.clone();
            tokio::spawn(async move { client.call(INIT_METHOD, Some(json!({}))).await })
        };
        let scripts = wait_for_scripts(&host, 1).await;
        let call = CallScript::parse(&scripts[0]).unwrap();
        assert_eq!(call.method, INIT_METHOD);

        client.resolve(ResponseMessage {
            id: call.call_id,
            result: Some(json!(true)),
            error: None,
        });
        assert_eq!(init.await.unwrap().unwrap(), json!({"value": true}));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_future_calls() {
        let (host, client) = client();
        ready(&client);

        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.call("listSessions", None).await })
        };
        wait_for_scripts(&host, 1).await;

        client.close();
        assert!(caller.await.unwrap().unwrap_err().is_fatal());
        assert!(client.call("listSessions", None).await.unwrap_err().is_fatal());
        assert_eq!(host.scripts.lock().unwrap().len(), 1);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_reports_startup_reason() {
        let (_host, client) = client();
        client.fail(WalletKitError::transport("bundle threw"));
        let err = client.call("getWallets", None).await.unwrap_err();
        assert_eq!(err, WalletKitError::transport("bundle threw"));
    }

    struct DeadHost;

    #[async_trait]
    impl ScriptHost for DeadHost {
        async fn evaluate(&self, _: &str, _: &str) -> Result<HostValue> {
            Err(WalletKitError::transport("Script host closed"))
        }

        async fn register(&self, _: &str, _: &str, _: HostFunction) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_transport_failure_during_call_fails_client() {
        let executor = Arc::new(ScriptExecutor::new(Arc::new(DeadHost)));
        let client = RpcClient::new(executor);
        ready(&client);

        let err = client.call("getWallets", None).await.unwrap_err();
        assert_eq!(err, WalletKitError::transport("Script host closed"));
        assert!(client.is_closed());
        assert_eq!(client.pending_count(), 0);

        client.fail(WalletKitError::transport("second failure"));
        let err = client.call("getWallets", None).await.unwrap_err();
        assert_eq!(err, WalletKitError::transport("Script host closed"));
    }

    #[tokio::test]
    async fn test_call_with_timeout_removes_pending_entry() {
        let (_host, client) = client();
        ready(&client);

        let err = client
            .call_with_timeout("getWallets", None, Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, WalletKitError::Timeout { ref operation, .. } if operation == "getWallets"));
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_bridge_check_result() {
        assert!(bridge_check_passed(&HostValue::Boolean(true)));
        assert!(bridge_check_passed(&HostValue::from("true")));
        assert!(!bridge_check_passed(&HostValue::Void));
    }
}

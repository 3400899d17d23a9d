//! Script host backed by a Node.js subprocess.
//!
//! The child runs a small harness that reads line-delimited JSON requests on
//! stdin and writes line-delimited JSON replies on stdout:
//!
//! ```text
//! host  -> child  {"op":"eval","id":1,"script":"...","filename":"bundle.js"}
//! host  -> child  {"op":"register","id":2,"object":"WalletKitNative","method":"postMessage"}
//! host  -> child  {"op":"hostreturn","id":7,"value":"..."}
//! child -> host   {"op":"result","id":1,"value":true}
//! child -> host   {"op":"error","id":1,"message":"ReferenceError: ..."}
//! child -> host   {"op":"hostcall","id":7,"object":"WalletKitNative","method":"storageGet","args":["k"]}
//! ```
//!
//! Host functions appear in the script as functions returning a promise
//! that settles with the host's reply. A script exception fails the
//! evaluation with a bridge error; a dead process fails it with a transport
//! error.

use super::{HostFunction, HostValue, ScriptHost};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};
use walletkit_error::{Result, WalletKitError};

const HARNESS: &str = r#"
const readline = require('readline');
const vm = require('vm');
const send = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');
const waiting = new Map();
let nextHostCall = 1;
if (typeof globalThis.atob !== 'function') {
  globalThis.atob = (s) => Buffer.from(s, 'base64').toString('binary');
}
const scalar = (v) => {
  if (v === undefined || v === null) return null;
  const t = typeof v;
  if (t === 'string' || t === 'boolean' || t === 'number') return v;
  if (t === 'object' && typeof v.then === 'function') return null;
  try { return JSON.stringify(v); } catch (_) { return String(v); }
};
readline.createInterface({ input: process.stdin }).on('line', (line) => {
  let req;
  try { req = JSON.parse(line); } catch (_) { return; }
  if (req.op === 'eval') {
    try {
      const value = vm.runInThisContext(req.script, { filename: req.filename });
      send({ op: 'result', id: req.id, value: scalar(value) });
    } catch (e) {
      send({ op: 'error', id: req.id, message: String((e && e.stack) || e) });
    }
  } else if (req.op === 'register') {
    const target = (globalThis[req.object] = globalThis[req.object] || {});
    target[req.method] = (...args) => new Promise((resolve, reject) => {
      const id = nextHostCall++;
      waiting.set(id, { resolve, reject });
      send({ op: 'hostcall', id, object: req.object, method: req.method, args: args.map(scalar) });
    });
    send({ op: 'result', id: req.id, value: null });
  } else if (req.op === 'hostreturn') {
    const entry = waiting.get(req.id);
    if (!entry) return;
    waiting.delete(req.id);
    if (req.error !== undefined && req.error !== null) entry.reject(new Error(req.error));
    else entry.resolve(req.value);
  }
});
"#;

/// Configuration for [`ProcessScriptHost`]
#[derive(Debug, Clone)]
pub struct ProcessHostConfig {
    /// Path to the `node` executable
    pub node_path: PathBuf,
    /// Extra arguments placed before the harness
    pub node_args: Vec<String>,
}

impl Default for ProcessHostConfig {
    fn default() -> Self {
        Self {
            node_path: PathBuf::from("node"),
            node_args: Vec::new(),
        }
    }
}

impl ProcessHostConfig {
    /// Uses a specific `node` executable
    pub fn with_node_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.node_path = path.into();
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum ChildMessage {
    Result {
        id: u64,
        #[serde(default)]
        value: Value,
    },
    Error {
        id: u64,
        #[serde(default)]
        message: String,
    },
    Hostcall {
        id: u64,
        object: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

struct Shared {
    writer: Mutex<ChildStdin>,
    pending: DashMap<u64, oneshot::Sender<Result<HostValue>>>,
    functions: DashMap<String, HostFunction>,
    closed: AtomicBool,
    exited: watch::Sender<Option<String>>,
}

impl Shared {
    async fn write_line(&self, message: Value) -> Result<()> {
        let mut line = message.to_string();
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| WalletKitError::transport(format!("Failed writing to script host: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| WalletKitError::transport(format!("Failed writing to script host: {e}")))
    }

    fn fail_all(&self, message: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(WalletKitError::transport(message)));
            }
        }
    }

    async fn handle_host_call(&self, id: u64, object: &str, method: &str, args: Vec<Value>) {
        let key = format!("{object}.{method}");
        let reply = match self.functions.get(&key).map(|f| f.value().clone()) {
            Some(function) => {
                let args = args.iter().map(HostValue::from_json).collect();
                match function(args) {
                    Ok(value) => json!({ "op": "hostreturn", "id": id, "value": value.to_json() }),
                    Err(error) => json!({ "op": "hostreturn", "id": id, "error": error }),
                }
            }
            None => json!({
                "op": "hostreturn",
                "id": id,
                "error": format!("{key} is not registered"),
            }),
        };
        if let Err(e) = self.write_line(reply).await {
            tracing::warn!(error = %e, function = %key, "Failed to return host call result");
        }
    }
}

/// [`ScriptHost`] running the bundle in a `node` child process
pub struct ProcessScriptHost {
    shared: Arc<Shared>,
    child: Mutex<Child>,
    next_id: AtomicU64,
}

impl ProcessScriptHost {
    /// Spawns `node` with the harness. Must be called inside a tokio runtime.
    pub fn spawn(config: ProcessHostConfig) -> Result<Self> {
        let mut child = Command::new(&config.node_path)
            .args(&config.node_args)
            .arg("-e")
            .arg(HARNESS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WalletKitError::transport(format!(
                    "Failed to start {}: {e}",
                    config.node_path.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WalletKitError::transport("Script host stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WalletKitError::transport("Script host stdout unavailable"))?;

        let shared = Arc::new(Shared {
            writer: Mutex::new(stdin),
            pending: DashMap::new(),
            functions: DashMap::new(),
            closed: AtomicBool::new(false),
            exited: watch::channel(None).0,
        });
        spawn_reader(Arc::clone(&shared), stdout);

        tracing::info!(node = %config.node_path.display(), "Started script host process");
        Ok(Self {
            shared,
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(&self, mut message: Value) -> Result<HostValue> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(WalletKitError::transport("Script host closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        message["id"] = json!(id);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        if let Err(e) = self.shared.write_line(message).await {
            self.shared.pending.remove(&id);
            return Err(e);
        }
        rx.await
            .map_err(|_| WalletKitError::transport("Script host closed"))?
    }
}

fn spawn_reader(shared: Arc<Shared>, stdout: ChildStdout) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ChildMessage>(trimmed) {
                        Ok(ChildMessage::Result { id, value }) => {
                            if let Some((_, reply)) = shared.pending.remove(&id) {
                                let _ = reply.send(Ok(HostValue::from_json(&value)));
                            }
                        }
                        Ok(ChildMessage::Error { id, message }) => {
                            if let Some((_, reply)) = shared.pending.remove(&id) {
                                let _ = reply.send(Err(WalletKitError::bridge(message)));
                            }
                        }
                        Ok(ChildMessage::Hostcall {
                            id,
                            object,
                            method,
                            args,
                        }) => {
                            shared.handle_host_call(id, &object, &method, args).await;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, line = %trimmed, "Ignoring script host output");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Script host stdout read error");
                    break;
                }
            }
        }

        let closed_by_host = shared.closed.swap(true, Ordering::SeqCst);
        shared.fail_all("Script host process exited");
        if closed_by_host {
            tracing::info!("Script host process output closed");
        } else {
            tracing::error!("Script host process exited unexpectedly");
            shared
                .exited
                .send_replace(Some("Script host process exited".to_string()));
        }
    });
}

#[async_trait]
impl ScriptHost for ProcessScriptHost {
    async fn evaluate(&self, script: &str, filename: &str) -> Result<HostValue> {
        self.request(json!({ "op": "eval", "script": script, "filename": filename }))
            .await
    }

    async fn register(&self, object: &str, method: &str, function: HostFunction) -> Result<()> {
        self.shared
            .functions
            .insert(format!("{object}.{method}"), function);
        self.request(json!({ "op": "register", "object": object, "method": method }))
            .await
            .map(|_| ())
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.fail_all("Script host closed");
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "Failed to stop script host process");
        }
    }

    fn termination(&self) -> Option<watch::Receiver<Option<String>>> {
        Some(self.shared.exited.subscribe())
    }
}

impl std::fmt::Debug for ProcessScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessScriptHost")
            .field("pending", &self.shared.pending.len())
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

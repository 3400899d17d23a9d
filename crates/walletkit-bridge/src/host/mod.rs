//! Script host adapter contract.
//!
//! A script host is an embedded execution environment that can evaluate
//! script text and expose host-defined functions to that script. The bridge
//! only ever talks to it through [`ScriptHost`]; every evaluation goes
//! through a single [`ScriptExecutor`] so the engine is touched from one
//! logical thread at a time.

mod executor;
mod process;

pub use executor::ScriptExecutor;
pub use process::{ProcessHostConfig, ProcessScriptHost};

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use walletkit_error::Result;

/// Scalar values that cross the host/script boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    /// `undefined` / no value
    Void,
    /// A string
    String(String),
    /// A boolean
    Boolean(bool),
    /// A 32-bit integer
    Int(i32),
    /// A 64-bit integer
    Long(i64),
    /// A double
    Double(f64),
}

impl HostValue {
    /// Returns the string content, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            HostValue::Void => ValueKind::Void,
            HostValue::String(_) => ValueKind::String,
            HostValue::Boolean(_) => ValueKind::Boolean,
            HostValue::Int(_) => ValueKind::Int,
            HostValue::Long(_) => ValueKind::Long,
            HostValue::Double(_) => ValueKind::Double,
        }
    }

    /// Converts a JSON scalar into a host value.
    ///
    /// Objects and arrays are carried as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => HostValue::Void,
            Value::Bool(b) => HostValue::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match i32::try_from(i) {
                        Ok(small) => HostValue::Int(small),
                        Err(_) => HostValue::Long(i),
                    }
                } else {
                    HostValue::Double(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => HostValue::String(s.clone()),
            other => HostValue::String(other.to_string()),
        }
    }

    /// Converts this value to JSON
    pub fn to_json(&self) -> Value {
        match self {
            HostValue::Void => Value::Null,
            HostValue::String(s) => Value::String(s.clone()),
            HostValue::Boolean(b) => Value::Bool(*b),
            HostValue::Int(i) => Value::from(*i),
            HostValue::Long(l) => Value::from(*l),
            HostValue::Double(d) => Value::from(*d),
        }
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Boolean(b)
    }
}

/// Kinds of [`HostValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `undefined`
    Void,
    /// String
    String,
    /// Boolean
    Boolean,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// Double
    Double,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Void => "void",
            ValueKind::String => "string",
            ValueKind::Boolean => "boolean",
            ValueKind::Int => "int",
            ValueKind::Long => "long",
            ValueKind::Double => "double",
        };
        f.write_str(name)
    }
}

/// A host-callable function exposed to the script.
///
/// Errors are raised in the script as exceptions carrying the message.
pub type HostFunction =
    Arc<dyn Fn(Vec<HostValue>) -> std::result::Result<HostValue, String> + Send + Sync>;

/// Wraps a closure as a [`HostFunction`]
pub fn host_function<F>(f: F) -> HostFunction
where
    F: Fn(Vec<HostValue>) -> std::result::Result<HostValue, String> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An embedded script engine.
///
/// Implementations need not be reentrant: the bridge serializes every call
/// through [`ScriptExecutor`].
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Evaluates `script`, attributing it to `filename` in stack traces
    async fn evaluate(&self, script: &str, filename: &str) -> Result<HostValue>;

    /// Installs `function` as `object.method` in the script's global scope
    async fn register(&self, object: &str, method: &str, function: HostFunction) -> Result<()>;

    /// Drains pending script jobs (promise continuations), returning how many ran
    async fn execute_pending_jobs(&self) -> Result<usize> {
        Ok(0)
    }

    /// Releases the engine. Later evaluations must fail.
    async fn close(&self);

    /// Watches for the engine dying on its own, such as a crashed process.
    ///
    /// The value turns `Some(reason)` once the host can no longer run
    /// scripts. Hosts that cannot terminate independently return `None`.
    fn termination(&self) -> Option<watch::Receiver<Option<String>>> {
        None
    }
}

/// Fetches a string argument by position for host functions
pub(crate) fn string_arg(args: &[HostValue], index: usize, name: &str) -> std::result::Result<String, String> {
    match args.get(index) {
        Some(HostValue::String(s)) => Ok(s.clone()),
        Some(other) => Err(format!("{name}: expected string, got {}", other.kind())),
        None => Err(format!("{name}: missing argument")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_host_value_from_json() {
        assert_eq!(HostValue::from_json(&json!(null)), HostValue::Void);
        assert_eq!(HostValue::from_json(&json!(true)), HostValue::Boolean(true));
        assert_eq!(HostValue::from_json(&json!(7)), HostValue::Int(7));
        assert_eq!(
            HostValue::from_json(&json!(5_000_000_000i64)),
            HostValue::Long(5_000_000_000)
        );
        assert_eq!(HostValue::from_json(&json!(1.5)), HostValue::Double(1.5));
        assert_eq!(
            HostValue::from_json(&json!({"a": 1})),
            HostValue::String("{\"a\":1}".to_string())
        );
    }

    #[test]
    fn test_string_arg() {
        let args = vec![HostValue::from("key"), HostValue::Int(3)];
        assert_eq!(string_arg(&args, 0, "storageGet").unwrap(), "key");
        assert!(string_arg(&args, 1, "storageGet").unwrap_err().contains("int"));
        assert!(string_arg(&args, 2, "storageGet").unwrap_err().contains("missing"));
    }
}

use super::{HostFunction, HostValue, ScriptHost};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use walletkit_error::{Result, WalletKitError};

const SHUT_DOWN: &str = "Script executor shut down";

enum Job {
    Evaluate {
        script: String,
        filename: String,
        reply: oneshot::Sender<Result<HostValue>>,
    },
    Register {
        object: String,
        method: String,
        function: HostFunction,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Serializes all access to a [`ScriptHost`] through one worker task.
///
/// Jobs run strictly in submission order. After every evaluation the worker
/// drains the host's pending jobs so promise continuations make progress.
pub struct ScriptExecutor {
    host: Arc<dyn ScriptHost>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScriptExecutor {
    /// Spawns the worker task. Must be called inside a tokio runtime.
    pub fn new(host: Arc<dyn ScriptHost>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(Arc::clone(&host), rx));
        Self {
            host,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues an evaluation and waits for its result
    pub async fn evaluate(&self, script: impl Into<String>, filename: &str) -> Result<HostValue> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Evaluate {
            script: script.into(),
            filename: filename.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| WalletKitError::transport(SHUT_DOWN))?
    }

    /// Queues a host function registration and waits for it to complete
    pub async fn register(&self, object: &str, method: &str, function: HostFunction) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Register {
            object: object.to_string(),
            method: method.to_string(),
            function,
            reply,
        })?;
        rx.await.map_err(|_| WalletKitError::transport(SHUT_DOWN))?
    }

    /// Returns true once [`ScriptExecutor::shutdown`] ran
    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    /// Stops the worker, fails queued jobs and closes the host.
    ///
    /// An evaluation in progress is cancelled.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().ok().and_then(|mut s| s.take());
        if sender.is_none() {
            return;
        }
        drop(sender);

        if let Some(worker) = self.worker.lock().ok().and_then(|mut w| w.take()) {
            worker.abort();
        }
        self.host.close().await;
        tracing::debug!("Script executor shut down");
    }

    fn submit(&self, job: Job) -> Result<()> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| WalletKitError::transport("Script executor lock poisoned"))?;
        match guard.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| WalletKitError::transport(SHUT_DOWN)),
            None => Err(WalletKitError::transport(SHUT_DOWN)),
        }
    }
}

impl std::fmt::Debug for ScriptExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptExecutor")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

async fn run_worker(host: Arc<dyn ScriptHost>, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Evaluate {
                script,
                filename,
                reply,
            } => {
                let result = host.evaluate(&script, &filename).await;
                if result.is_ok() {
                    match host.execute_pending_jobs().await {
                        Ok(0) => {}
                        Ok(count) => tracing::trace!(count, "Executed pending script jobs"),
                        Err(e) => tracing::warn!(error = %e, "Pending script jobs failed"),
                    }
                }
                let _ = reply.send(result);
            }
            Job::Register {
                object,
                method,
                function,
                reply,
            } => {
                let _ = reply.send(host.register(&object, &method, function).await);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::host_function;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHost {
        in_flight: AtomicUsize,
        overlapped: AtomicBool,
        evaluated: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl ScriptHost for RecordingHost {
        async fn evaluate(&self, script: &str, _filename: &str) -> Result<HostValue> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.evaluated.lock().unwrap().push(script.to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(HostValue::Void)
        }

        async fn register(&self, _: &str, _: &str, _: HostFunction) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_evaluations_never_overlap() {
        let host = Arc::new(RecordingHost::default());
        let executor = Arc::new(ScriptExecutor::new(host.clone()));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let executor = executor.clone();
            tasks.push(tokio::spawn(async move {
                executor.evaluate(format!("job{i}"), "test.js").await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(!host.overlapped.load(Ordering::SeqCst));
        assert_eq!(host.evaluated.lock().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_shutdown_fails_later_jobs_and_closes_host() {
        let host = Arc::new(RecordingHost::default());
        let executor = ScriptExecutor::new(host.clone());

        executor.shutdown().await;

        assert!(executor.is_shut_down());
        assert!(host.closed.load(Ordering::SeqCst));
        let err = executor.evaluate("1", "test.js").await.unwrap_err();
        assert!(err.is_fatal());
        let err = executor
            .register("WalletKitNative", "log", host_function(|_| Ok(HostValue::Void)))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(host.evaluated.lock().unwrap().is_empty());
    }
}

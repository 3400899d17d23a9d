//! Lazy one-time initialization.
//!
//! Every public operation runs through [`InitializationGate::ensure_initialized`]
//! first. The first caller runs the initializer while holding the gate's
//! mutex; concurrent callers wait behind it and share its outcome.

use crate::config::WalletKitConfig;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use walletkit_error::{Result, WalletKitError};

/// Error message when no configuration was ever supplied
pub const NOT_INITIALIZED: &str = "WalletKit must be initialized first";

/// Double-checked initialization guard
#[derive(Debug, Default)]
pub struct InitializationGate {
    initialized: AtomicBool,
    failed_attempts: AtomicU64,
    lock: tokio::sync::Mutex<Option<WalletKitError>>,
    stashed: Mutex<Option<WalletKitConfig>>,
}

impl InitializationGate {
    /// Creates an uninitialized gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true after a successful initialization
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Records a configuration for a later lazy initialization
    pub fn stash(&self, config: WalletKitConfig) {
        if let Ok(mut stashed) = self.stashed.lock() {
            *stashed = Some(config);
        }
    }

    /// The configuration the next attempt would use
    pub fn stashed_config(&self) -> Option<WalletKitConfig> {
        self.stashed.lock().ok().and_then(|c| c.clone())
    }

    /// Runs `initializer` unless initialization already succeeded.
    ///
    /// `config` replaces any stashed configuration. Callers that queued
    /// behind a failed attempt get that attempt's error; later callers retry.
    pub async fn ensure_initialized<F, Fut>(
        &self,
        config: Option<WalletKitConfig>,
        initializer: F,
    ) -> Result<()>
    where
        F: FnOnce(WalletKitConfig) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.is_initialized() {
            return Ok(());
        }
        if let Some(config) = config {
            self.stash(config);
        }

        let observed_failures = self.failed_attempts.load(Ordering::Acquire);
        let mut last_failure = self.lock.lock().await;

        if self.is_initialized() {
            return Ok(());
        }
        if self.failed_attempts.load(Ordering::Acquire) != observed_failures {
            if let Some(error) = last_failure.as_ref() {
                return Err(error.clone());
            }
        }

        let config = self
            .stashed_config()
            .ok_or_else(|| WalletKitError::bridge(NOT_INITIALIZED))?;

        tracing::info!(network = %config.network, "Initializing WalletKit");
        match initializer(config).await {
            Ok(()) => {
                *last_failure = None;
                self.initialized.store(true, Ordering::Release);
                tracing::info!("WalletKit initialized");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(error = %error, "WalletKit initialization failed");
                *last_failure = Some(error.clone());
                self.failed_attempts.fetch_add(1, Ordering::AcqRel);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_missing_config_fails() {
        let gate = InitializationGate::new();
        let err = gate
            .ensure_initialized(None, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err, WalletKitError::bridge(NOT_INITIALIZED));
        assert!(!gate.is_initialized());
    }

    #[tokio::test]
    async fn test_concurrent_callers_initialize_once() {
        let gate = Arc::new(InitializationGate::new());
        gate.stash(WalletKitConfig::testnet());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                gate.ensure_initialized(None, |_| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(gate.is_initialized());
    }

    #[tokio::test]
    async fn test_waiters_share_failure_then_later_call_retries() {
        let gate = Arc::new(InitializationGate::new());
        gate.stash(WalletKitConfig::testnet());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                gate.ensure_initialized(None, |_| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err(WalletKitError::bridge("init rejected"))
                })
                .await
            }));
        }
        for task in tasks {
            assert_eq!(
                task.await.unwrap().unwrap_err(),
                WalletKitError::bridge("init rejected")
            );
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!gate.is_initialized());

        gate.ensure_initialized(None, |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(gate.is_initialized());
    }

    #[tokio::test]
    async fn test_explicit_config_is_used_and_kept() {
        let gate = InitializationGate::new();
        gate.ensure_initialized(Some(WalletKitConfig::testnet()), |config| async move {
            assert_eq!(config.network, crate::config::TonNetwork::Testnet);
            Ok(())
        })
        .await
        .unwrap();

        assert!(gate.stashed_config().is_some());
        gate.ensure_initialized(None, |_| async {
            Err(WalletKitError::bridge("must not run"))
        })
        .await
        .unwrap();
    }
}

//! Request context handed to every task execution, plus engine tuning.

use crate::domain::ports::{
    Broadcaster, HttpClient, ObjectStore, SecretStore, ServiceDispatch, TransactionHandle,
    UserDirectory,
};
use crate::domain::reference::References;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff applied to object-store calls.
///
/// Only `CoreError::Transient` is retried. A definitive outcome such as
/// `AlreadyExists` is returned to the caller on the first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay_ms: u64,
    /// Growth factor between attempts
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the given retry (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as f64;
        let delay_ms = (self.initial_delay_ms as f64 * self.backoff_multiplier.powf(exponent))
            .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < self.max_attempts.max(1) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on loop passes per run
    pub max_passes: usize,
    /// Row-Update batch width
    pub update_concurrency: usize,
    /// Retry policy for object-store calls
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_passes: 10_000,
            update_concurrency: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// External collaborators reachable from tasks
#[derive(Clone)]
pub struct Services {
    /// Dynamic object store
    pub objects: Arc<dyn ObjectStore>,
    /// Secret storage
    pub secrets: Arc<dyn SecretStore>,
    /// Outbound service dispatch
    pub dispatch: Arc<dyn ServiceDispatch>,
    /// Live push notifications
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Role and account lookup
    pub users: Arc<dyn UserDirectory>,
    /// HTTP transport
    pub http: Arc<dyn HttpClient>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Per-run context passed to `Task::execute`
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// External collaborators
    pub services: Services,
    /// Engine configuration
    pub config: EngineConfig,
    /// Transaction the run participates in, if any
    pub transaction: Option<TransactionHandle>,
    /// Label index of the running definition
    pub references: References,
}

impl RequestContext {
    /// Create a context outside any transaction
    pub fn new(services: Services, config: EngineConfig) -> Self {
        Self {
            services,
            config,
            transaction: None,
            references: References::default(),
        }
    }

    /// Attach the label index of a definition
    pub fn with_references(mut self, references: References) -> Self {
        self.references = references;
        self
    }

    /// Run inside a caller-supplied transaction
    pub fn with_transaction(mut self, transaction: TransactionHandle) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// The retry policy for store calls
    #[inline]
    pub fn retry(&self) -> &RetryPolicy {
        &self.config.retry
    }
}

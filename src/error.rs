//! Error Handling and Retry Logic
//!
//! Core error type for the collaboration engine, plus the retry policy used
//! when (re)connecting to a session gateway.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::crdt::SiteId;

/// Errors raised by the collaboration core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    /// A transformed edit does not fit the current document content.
    #[error("operation out of range: {position}+{length} on a document of {document_len} chars")]
    OutOfRangeOperation {
        position: usize,
        length: usize,
        document_len: usize,
    },

    /// A buffered remote operation waited too long for a missing predecessor.
    #[error("desynchronized: operation {clock} from {site} still waiting after {waited:?}")]
    DesyncTimeout {
        site: SiteId,
        clock: u64,
        waited: Duration,
    },

    /// Untrusted input that cannot be integrated.
    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    /// The gateway is not connected; pending operations stay queued.
    #[error("gateway disconnected")]
    Disconnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias for the collaboration core
pub type Result<T, E = CollabError> = std::result::Result<T, E>;

impl CollabError {
    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            CollabError::Disconnected | CollabError::Transport(_) => ErrorCategory::Network,
            CollabError::DesyncTimeout { .. } => ErrorCategory::Timeout,
            CollabError::OutOfRangeOperation { .. } => ErrorCategory::Consistency,
            CollabError::MalformedOperation(_) => ErrorCategory::Validation,
            CollabError::Config(_) => ErrorCategory::Configuration,
        }
    }

    /// Whether the local replica must be rebuilt from a peer
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            CollabError::OutOfRangeOperation { .. } | CollabError::DesyncTimeout { .. }
        )
    }
}

/// Categorized error types for better handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network-related errors (retryable)
    Network,

    /// Timeout errors (may be retryable)
    Timeout,

    /// Local replica no longer matches its peers
    Consistency,

    /// Validation errors (not retryable)
    Validation,

    /// Configuration errors (not retryable)
    Configuration,
}

impl ErrorCategory {
    /// Check if this error category is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Network | ErrorCategory::Timeout)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after `delay`
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Execute with retry logic. Only errors whose category is retryable are
/// retried; anything else is returned after the first attempt.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.category().is_retryable() => return Err(e),
            Err(e) => {
                if attempts >= policy.max_attempts {
                    tracing::warn!(attempts, "giving up: {e}");
                    return Err(e);
                }

                tracing::warn!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    "attempt failed: {e}; retrying"
                );

                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}

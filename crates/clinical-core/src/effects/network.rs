//! Network effect surface shared by the Sync Orchestrator and EMR Adapter.
//! The error taxonomy here is intentionally rich — it is the vocabulary the
//! Circuit Breaker (C7) and retry policies key off of — mirroring the
//! teacher's `NetworkError` enum.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors a [`NetworkEffects`] implementation may raise.
#[derive(Debug, Error, Clone)]
pub enum NetworkError {
    #[error("circuit breaker open for {endpoint}: {reason}")]
    CircuitBreakerOpen { endpoint: String, reason: String },

    #[error("retry limit exceeded after {attempts} attempts: {last_error}")]
    RetryLimitExceeded { attempts: u32, last_error: String },

    #[error("rate limited: {limit} requests per {window_ms}ms")]
    RateLimitExceeded { limit: u32, window_ms: u64 },

    #[error("operation {operation} timed out after {timeout_ms}ms")]
    OperationTimeout { operation: String, timeout_ms: u64 },

    #[error("peer unreachable: {endpoint}")]
    PeerUnreachable { endpoint: String },

    #[error("connection refused by {endpoint}")]
    ConnectionRefused { endpoint: String },

    #[error("unexpected status {status} from {endpoint}: {body}")]
    UnexpectedStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl NetworkError {
    /// Whether the retry policy in §4.7 considers this worth retrying:
    /// transport-level failures and 429/503 are retryable; other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::PeerUnreachable { .. }
            | NetworkError::ConnectionRefused { .. }
            | NetworkError::Transport(_)
            | NetworkError::OperationTimeout { .. } => true,
            NetworkError::UnexpectedStatus { status, .. } => *status == 429 || *status == 503,
            NetworkError::CircuitBreakerOpen { .. }
            | NetworkError::RetryLimitExceeded { .. }
            | NetworkError::RateLimitExceeded { .. } => false,
        }
    }
}

/// A single outbound call's observability metadata.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub correlation_id: String,
}

/// Outbound network access used by the Sync Orchestrator (to reach the
/// backend) and, via a more specific trait in `clinical-emr`, the EMR
/// Adapter. Kept deliberately small: the concrete request/response shapes
/// live with their callers.
#[async_trait]
pub trait NetworkEffects: Send + Sync {
    /// POST `body` to `url` and return the raw response body, or a
    /// [`NetworkError`] the caller's circuit breaker/retry policy can act on.
    async fn post_json(
        &self,
        url: &str,
        body: Vec<u8>,
        ctx: &RequestContext,
        timeout: Duration,
    ) -> Result<Vec<u8>, NetworkError>;

    /// GET `url` and return the raw response body.
    async fn get(
        &self,
        url: &str,
        ctx: &RequestContext,
        timeout: Duration,
    ) -> Result<Vec<u8>, NetworkError>;
}

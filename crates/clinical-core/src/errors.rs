//! Unified error type for the clinical sync engine.
//!
//! Each crate in the workspace defines its own narrow error enum where it
//! has domain-specific variants to report (see `clinical-emr::EmrError`,
//! `clinical-sync::SyncError`); all of them convert into `ClinicalError` at
//! the boundary a caller actually needs a single type, mirroring the
//! teacher's `AuraError` pattern.

use thiserror::Error;

/// The unified error type returned by public APIs across the workspace.
#[derive(Debug, Error, Clone)]
pub enum ClinicalError {
    /// A request or input failed validation.
    #[error("invalid input: {message}")]
    Invalid { message: String },

    /// The requested resource does not exist.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// A vector clock counter would have overflowed `u64`.
    #[error("vector clock counter overflow for node {node}")]
    VectorClockOverflow { node: String },

    /// A CRDT merge could not proceed (e.g. conflicting schema versions).
    #[error("merge failed: {message}")]
    MergeFailed { message: String },

    /// The local persistence layer failed to read or write state.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// A remote peer or EMR endpoint could not be reached or responded incorrectly.
    #[error("network error: {message}")]
    Network { message: String },

    /// The circuit breaker for a downstream dependency is open.
    #[error("circuit breaker open for {dependency}: {reason}")]
    CircuitOpen { dependency: String, reason: String },

    /// OAuth2 token acquisition or refresh failed.
    #[error("token acquisition failed: {message}")]
    TokenAcquisition { message: String },

    /// A downstream EMR's record diverged from the local replica in a way
    /// verification could not reconcile.
    #[error("verification mismatch: {message}")]
    VerificationMismatch { message: String },

    /// Serialization or deserialization of a wire or storage payload failed.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Configuration was missing, malformed, or internally inconsistent.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A backpressure limit was exceeded and the caller should retry later.
    #[error("backpressure: {message}")]
    BackPressure { message: String },

    /// An operation exceeded its deadline.
    #[error("operation timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Caller lacks permission to perform the requested action.
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// An invariant the engine relies on was violated; indicates a bug.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// `start_sync` was called while a round was already in progress.
    #[error("sync already in progress")]
    SyncInProgress,

    /// The caller's cancellation signal fired at a chunk boundary.
    #[error("operation cancelled: {operation}")]
    Cancelled { operation: String },
}

impl ClinicalError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ClinicalError::Invalid {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ClinicalError::NotFound {
            message: message.into(),
        }
    }

    pub fn merge_failed(message: impl Into<String>) -> Self {
        ClinicalError::MergeFailed {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        ClinicalError::Storage {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        ClinicalError::Network {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ClinicalError::Config {
            message: message.into(),
        }
    }

    pub fn back_pressure(message: impl Into<String>) -> Self {
        ClinicalError::BackPressure {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ClinicalError::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later has a reasonable chance of success.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClinicalError::Network { .. }
                | ClinicalError::Timeout { .. }
                | ClinicalError::BackPressure { .. }
                | ClinicalError::CircuitOpen { .. }
        )
    }

    /// Coarse category used for metrics/log grouping.
    pub fn category(&self) -> &'static str {
        match self {
            ClinicalError::Invalid { .. } => "invalid",
            ClinicalError::NotFound { .. } => "not_found",
            ClinicalError::VectorClockOverflow { .. } => "clock_overflow",
            ClinicalError::MergeFailed { .. } => "merge_failed",
            ClinicalError::Storage { .. } => "storage",
            ClinicalError::Network { .. } => "network",
            ClinicalError::CircuitOpen { .. } => "circuit_open",
            ClinicalError::TokenAcquisition { .. } => "token_acquisition",
            ClinicalError::VerificationMismatch { .. } => "verification_mismatch",
            ClinicalError::Serialization { .. } => "serialization",
            ClinicalError::Config { .. } => "config",
            ClinicalError::BackPressure { .. } => "back_pressure",
            ClinicalError::Timeout { .. } => "timeout",
            ClinicalError::PermissionDenied { .. } => "permission_denied",
            ClinicalError::Internal { .. } => "internal",
            ClinicalError::SyncInProgress => "sync_in_progress",
            ClinicalError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Convenience alias used across the workspace's public APIs.
pub type Result<T> = std::result::Result<T, ClinicalError>;

impl From<serde_json::Error> for ClinicalError {
    fn from(err: serde_json::Error) -> Self {
        ClinicalError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for ClinicalError {
    fn from(err: toml::de::Error) -> Self {
        ClinicalError::Config {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ClinicalError {
    fn from(err: std::io::Error) -> Self {
        ClinicalError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<uuid::Error> for ClinicalError {
    fn from(err: uuid::Error) -> Self {
        ClinicalError::Invalid {
            message: err.to_string(),
        }
    }
}

//! OAuth2 Token Manager (C6), Circuit Breaker + Retry (C7), EMR Adapter
//! (C8), and Verification Engine (C9).

pub mod adapter;
pub mod breaker;
pub mod token;
pub mod verify;

pub use adapter::{
    envelope_from_task, CorrelationId, CrossCheck, EmrAdapter, EmrError, FetchOutcome, FhirClient,
    Hl7Client, PatientResource, ReqwestFhirClient, TaskResource, TcpHl7Client,
};
pub use breaker::{retry_with_backoff, BreakerError, CircuitBreaker};
pub use token::{
    CachedToken, ReqwestTokenFetcher, TokenError, TokenFetcher, TokenKey, TokenManager,
    TokenRequestConfig,
};
pub use verify::{
    is_stale, VerificationEngine, VerificationError, VerificationResult, VerificationWarning,
};

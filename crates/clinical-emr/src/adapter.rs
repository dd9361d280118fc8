//! EMR Adapter (C8, §4.8): fetches patient/task resources via FHIR R4 and
//! cross-checks them against a parallel HL7 v2 fetch, behind the circuit
//! breaker (C7) and token manager (C6).

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::token::{TokenError, TokenFetcher, TokenManager, TokenRequestConfig};
use async_trait::async_trait;
use clinical_core::task::{EmrPayloadEnvelope, EmrResourceFields, EmrSystem, TerminologyCoding};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// A correlation id attached to every outgoing request and carried into
/// the span so a failed fetch can be traced end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    #[allow(clippy::disallowed_methods)]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised fetching or cross-verifying an EMR resource.
#[derive(Debug, Error, Clone)]
pub enum EmrError {
    #[error("fhir request failed: {0}")]
    FhirRequestFailed(String),
    #[error("hl7 request failed: {0}")]
    Hl7RequestFailed(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("circuit open for {0}")]
    CircuitOpen(String),
    #[error("token acquisition failed: {0}")]
    Token(#[from] TokenError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl<E: Into<EmrError>> From<BreakerError<E>> for EmrError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open { endpoint } => EmrError::CircuitOpen(endpoint),
            BreakerError::Inner(inner) => inner.into(),
        }
    }
}

/// A FHIR `Patient` resource, flattened to the fields this adapter needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientResource {
    pub id: String,
    pub identifiers: Vec<String>,
    pub general_practitioner_reference: Option<String>,
}

/// A FHIR `Task` resource, flattened to the fields this adapter needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResource {
    pub id: String,
    pub status: String,
    pub for_patient_reference: Option<String>,
    pub codings: Vec<TerminologyCoding>,
}

/// Result of cross-checking a FHIR fetch against an HL7 fetch of the same
/// logical resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossCheck {
    pub matched: bool,
    pub fhir_identifier: String,
    pub hl7_identifier: String,
}

/// Outcome of a single adapter fetch, carrying the tracing/correlation
/// context alongside the resource (§4.8 `{resource, verification_result,
/// tracing, performance}`).
#[derive(Debug, Clone)]
pub struct FetchOutcome<T> {
    pub resource: T,
    pub cross_check: CrossCheck,
    pub correlation_id: CorrelationId,
    pub elapsed: Duration,
}

/// The FHIR R4 REST collaborator.
#[async_trait]
pub trait FhirClient: Send + Sync {
    async fn get_patient(
        &self,
        system: EmrSystem,
        patient_id: &str,
        bearer_token: &str,
        correlation_id: CorrelationId,
    ) -> Result<PatientResource, EmrError>;

    async fn get_task(
        &self,
        system: EmrSystem,
        task_id: &str,
        bearer_token: &str,
        correlation_id: CorrelationId,
    ) -> Result<TaskResource, EmrError>;
}

/// The HL7 v2 / MLLP collaborator.
#[async_trait]
pub trait Hl7Client: Send + Sync {
    async fn fetch_patient_identifier(
        &self,
        system: EmrSystem,
        patient_id: &str,
    ) -> Result<String, EmrError>;

    async fn fetch_task_status(&self, system: EmrSystem, task_id: &str) -> Result<String, EmrError>;
}

/// MLLP frame delimiters (`\x0b ... \x1c\x0d`), per §4.8.
pub const MLLP_START: u8 = 0x0b;
pub const MLLP_END: [u8; 2] = [0x1c, 0x0d];

/// Wrap a raw HL7 v2 message in MLLP framing for transmission.
pub fn mllp_frame(message: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(message.len() + 3);
    framed.push(MLLP_START);
    framed.extend_from_slice(message);
    framed.extend_from_slice(&MLLP_END);
    framed
}

/// Strip MLLP framing from a received buffer, failing if the delimiters
/// are missing or malformed.
pub fn mllp_unframe(framed: &[u8]) -> Result<&[u8], EmrError> {
    if framed.len() < 3 || framed[0] != MLLP_START || framed[framed.len() - 2..] != MLLP_END {
        return Err(EmrError::Hl7RequestFailed("malformed MLLP frame".into()));
    }
    Ok(&framed[1..framed.len() - 2])
}

/// Wrap a fetched [`TaskResource`] into the [`EmrPayloadEnvelope`] shape
/// `clinical-journal`/`clinical-emr::verify` operate on (§3, §4.8).
pub fn envelope_from_task(system: EmrSystem, resource: &TaskResource, version: u64, fetched_at_ns: u64) -> EmrPayloadEnvelope {
    let raw_fields = EmrResourceFields::Task {
        status: resource.status.clone(),
        for_patient_reference: resource.for_patient_reference.clone(),
        codings: resource.codings.clone(),
    };
    let checksum = serde_json::to_vec(&raw_fields)
        .map(|bytes| blake3::hash(&bytes).to_hex().to_string())
        .unwrap_or_default();

    EmrPayloadEnvelope {
        system,
        resource_type: "Task".to_string(),
        resource_id: resource.id.clone(),
        version,
        raw_fields,
        checksum,
        fetched_at_ns,
    }
}

/// `reqwest`-backed FHIR R4 REST collaborator: plain bearer-authenticated
/// GETs against `{base_url}/Patient/{id}` and `{base_url}/Task/{id}`, one
/// base URL per EMR system.
pub struct ReqwestFhirClient {
    client: reqwest::Client,
    base_urls: std::collections::HashMap<EmrSystem, String>,
}

impl ReqwestFhirClient {
    pub fn new(client: reqwest::Client, base_urls: std::collections::HashMap<EmrSystem, String>) -> Self {
        Self { client, base_urls }
    }

    fn base_url(&self, system: EmrSystem) -> Result<&str, EmrError> {
        self.base_urls
            .get(&system)
            .map(String::as_str)
            .ok_or_else(|| EmrError::FhirRequestFailed(format!("no base url configured for {system:?}")))
    }
}

#[derive(serde::Deserialize)]
struct FhirPatientBody {
    id: String,
    #[serde(default)]
    identifier: Vec<FhirIdentifier>,
    #[serde(default, rename = "generalPractitioner")]
    general_practitioner: Vec<FhirReference>,
}

#[derive(serde::Deserialize)]
struct FhirIdentifier {
    #[serde(default)]
    value: Option<String>,
}

#[derive(serde::Deserialize)]
struct FhirReference {
    #[serde(default)]
    reference: Option<String>,
}

#[derive(serde::Deserialize)]
struct FhirTaskBody {
    id: String,
    status: String,
    #[serde(default, rename = "for")]
    for_reference: Option<FhirReference>,
    #[serde(default)]
    code: Option<FhirCodeableConcept>,
}

#[derive(serde::Deserialize)]
struct FhirCodeableConcept {
    #[serde(default)]
    coding: Vec<FhirCoding>,
}

#[derive(serde::Deserialize)]
struct FhirCoding {
    system: Option<String>,
    code: Option<String>,
}

#[async_trait]
impl FhirClient for ReqwestFhirClient {
    async fn get_patient(
        &self,
        system: EmrSystem,
        patient_id: &str,
        bearer_token: &str,
        correlation_id: CorrelationId,
    ) -> Result<PatientResource, EmrError> {
        let url = format!("{}/Patient/{patient_id}", self.base_url(system)?);
        let body: FhirPatientBody = self
            .client
            .get(&url)
            .bearer_auth(bearer_token)
            .header("X-Correlation-Id", correlation_id.to_string())
            .send()
            .await
            .map_err(|e| EmrError::FhirRequestFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| EmrError::FhirRequestFailed(e.to_string()))?;

        Ok(PatientResource {
            id: body.id,
            identifiers: body.identifier.into_iter().filter_map(|i| i.value).collect(),
            general_practitioner_reference: body
                .general_practitioner
                .into_iter()
                .next()
                .and_then(|r| r.reference),
        })
    }

    async fn get_task(
        &self,
        system: EmrSystem,
        task_id: &str,
        bearer_token: &str,
        correlation_id: CorrelationId,
    ) -> Result<TaskResource, EmrError> {
        let url = format!("{}/Task/{task_id}", self.base_url(system)?);
        let body: FhirTaskBody = self
            .client
            .get(&url)
            .bearer_auth(bearer_token)
            .header("X-Correlation-Id", correlation_id.to_string())
            .send()
            .await
            .map_err(|e| EmrError::FhirRequestFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| EmrError::FhirRequestFailed(e.to_string()))?;

        let codings = body
            .code
            .map(|c| {
                c.coding
                    .into_iter()
                    .map(|c| TerminologyCoding {
                        system: c.system,
                        code: c.code,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(TaskResource {
            id: body.id,
            status: body.status,
            for_patient_reference: body.for_reference.and_then(|r| r.reference),
            codings,
        })
    }
}

/// `tokio::net::TcpStream`-backed HL7 client. Hand-rolled MLLP framing
/// since no HL7 crate is available; this wraps a plain TCP round trip with
/// the start/end delimiters and a length-prefix-free read-until-`MLLP_END`
/// loop.
pub struct TcpHl7Client {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
}

#[async_trait]
impl Hl7Client for TcpHl7Client {
    async fn fetch_patient_identifier(
        &self,
        _system: EmrSystem,
        patient_id: &str,
    ) -> Result<String, EmrError> {
        let query = format!("QRY^A19|{patient_id}");
        let response = self.round_trip(query.as_bytes()).await?;
        parse_identifier_field(&response)
    }

    async fn fetch_task_status(&self, _system: EmrSystem, task_id: &str) -> Result<String, EmrError> {
        let query = format!("QRY^T12|{task_id}");
        let response = self.round_trip(query.as_bytes()).await?;
        parse_identifier_field(&response)
    }
}

impl TcpHl7Client {
    async fn round_trip(&self, message: &[u8]) -> Result<Vec<u8>, EmrError> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let framed = mllp_frame(message);
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let mut stream = tokio::time::timeout(self.request_timeout, connect)
            .await
            .map_err(|_| EmrError::Timeout(self.request_timeout))?
            .map_err(|e| EmrError::Hl7RequestFailed(e.to_string()))?;

        stream
            .write_all(&framed)
            .await
            .map_err(|e| EmrError::Hl7RequestFailed(e.to_string()))?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = tokio::time::timeout(self.request_timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| EmrError::Timeout(self.request_timeout))?
                .map_err(|e| EmrError::Hl7RequestFailed(e.to_string()))?;
            if n == 0 {
                return Err(EmrError::Hl7RequestFailed("connection closed mid-frame".into()));
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() >= 2 && buf[buf.len() - 2..] == MLLP_END {
                break;
            }
        }
        Ok(mllp_unframe(&buf)?.to_vec())
    }
}

fn parse_identifier_field(message: &[u8]) -> Result<String, EmrError> {
    std::str::from_utf8(message)
        .ok()
        .and_then(|s| s.split('|').nth(1))
        .map(|s| s.to_string())
        .ok_or_else(|| EmrError::Hl7RequestFailed("no identifier field in response".into()))
}

/// FHIR + HL7 cross-checking EMR adapter (§4.8), wired to a token manager
/// and a circuit breaker per external endpoint.
pub struct EmrAdapter<F: FhirClient, H: Hl7Client, T: TokenFetcher> {
    fhir: F,
    hl7: H,
    tokens: TokenManager<T>,
    breaker: CircuitBreaker,
    request_timeout: Duration,
}

impl<F: FhirClient, H: Hl7Client, T: TokenFetcher> EmrAdapter<F, H, T> {
    pub fn new(
        fhir: F,
        hl7: H,
        tokens: TokenManager<T>,
        breaker: CircuitBreaker,
        request_timeout: Duration,
    ) -> Self {
        Self {
            fhir,
            hl7,
            tokens,
            breaker,
            request_timeout,
        }
    }

    fn endpoint_name(system: EmrSystem) -> &'static str {
        match system {
            EmrSystem::Epic => "fhir:epic",
            EmrSystem::Cerner => "fhir:cerner",
        }
    }

    pub async fn fetch_patient(
        &self,
        system: EmrSystem,
        patient_id: &str,
        token_request: &TokenRequestConfig,
        now_ns: u64,
    ) -> Result<FetchOutcome<PatientResource>, EmrError> {
        let started = tokio::time::Instant::now();
        let correlation_id = CorrelationId::generate();
        let token = self.tokens.get_token(token_request, false, now_ns).await?;

        let endpoint = Self::endpoint_name(system);
        let fhir = &self.fhir;
        let patient_id_owned = patient_id.to_string();
        let access_token = token.access_token.clone();
        let resource = self
            .breaker
            .guard::<_, EmrError, _>(endpoint, now_ns, || async move {
                tokio::time::timeout(
                    self.request_timeout,
                    fhir.get_patient(system, &patient_id_owned, &access_token, correlation_id),
                )
                .await
                .map_err(|_| EmrError::Timeout(self.request_timeout))?
            })
            .await?;

        let hl7_identifier = self.hl7.fetch_patient_identifier(system, patient_id).await?;
        let fhir_identifier = resource
            .identifiers
            .first()
            .cloned()
            .unwrap_or_default();
        let cross_check = CrossCheck {
            matched: fhir_identifier == hl7_identifier,
            fhir_identifier,
            hl7_identifier,
        };
        if !cross_check.matched {
            tracing::warn!(
                patient_id,
                correlation_id = %correlation_id,
                "patient_id_mismatch between FHIR and HL7"
            );
        }

        Ok(FetchOutcome {
            resource,
            cross_check,
            correlation_id,
            elapsed: started.elapsed(),
        })
    }

    pub async fn fetch_task(
        &self,
        system: EmrSystem,
        task_id: &str,
        token_request: &TokenRequestConfig,
        now_ns: u64,
    ) -> Result<FetchOutcome<TaskResource>, EmrError> {
        let started = tokio::time::Instant::now();
        let correlation_id = CorrelationId::generate();
        let token = self.tokens.get_token(token_request, false, now_ns).await?;

        let endpoint = Self::endpoint_name(system);
        let fhir = &self.fhir;
        let task_id_owned = task_id.to_string();
        let access_token = token.access_token.clone();
        let resource = self
            .breaker
            .guard::<_, EmrError, _>(endpoint, now_ns, || async move {
                tokio::time::timeout(
                    self.request_timeout,
                    fhir.get_task(system, &task_id_owned, &access_token, correlation_id),
                )
                .await
                .map_err(|_| EmrError::Timeout(self.request_timeout))?
            })
            .await?;

        let hl7_status = self.hl7.fetch_task_status(system, task_id).await?;
        let cross_check = CrossCheck {
            matched: resource.status == hl7_status,
            fhir_identifier: resource.status.clone(),
            hl7_identifier: hl7_status,
        };

        Ok(FetchOutcome {
            resource,
            cross_check,
            correlation_id,
            elapsed: started.elapsed(),
        })
    }
}

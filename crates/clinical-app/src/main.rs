//! Wiring binary: loads configuration, constructs every component named in
//! the workspace shape, and drives one sync-and-verify tick. The HTTP
//! router, mobile UI, and a real message-bus transport are out of scope
//! (external collaborators); this binary exists to prove the components
//! compose, the way the teacher's `aura-cli` wires its middleware stack
//! and handlers behind a `clap` front door.

use clap::Parser;
use clinical_core::config::{ConfigLoader, TokenConfig};
use clinical_core::effects::{MetricsSink, SyncEffects, SyncEnvelope, SyncError, SyncMetrics, SyncResponse};
use clinical_core::task::EmrSystem;
use clinical_core::{ClinicalConfig, NodeId, VectorClock};
use clinical_dispatch::{EventDispatcher, InMemoryEventBus, TaskEventHandler, TopicEvent};
use clinical_emr::{
    envelope_from_task, CircuitBreaker, EmrAdapter, ReqwestFhirClient, ReqwestTokenFetcher,
    TcpHl7Client, TokenKey, TokenManager, TokenRequestConfig, VerificationEngine,
};
use clinical_persistence::{InMemoryPersistence, InMemoryOutbox, StaticKeyProvider};
use clinical_sync::{CancellationFlag, SyncOrchestrator};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "clinical-app")]
#[command(about = "Clinical task sync / EMR-verification engine", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file; falls back to defaults overlaid
    /// with `CLINICAL_*` environment variables when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// This node's stable identifier.
    #[arg(long, default_value = "node-1")]
    node_id: String,

    /// Run a single sync-and-verify tick and exit, rather than looping.
    #[arg(long, default_value_t = true)]
    once: bool,
}

/// Backend round-trip placeholder: the real backend is an external
/// collaborator per the workspace's Non-goals. This handler always reports
/// an empty remote batch, which is enough to exercise the orchestrator's
/// full round (drain outbox, exchange, resolve, persist, report metrics)
/// without a live network dependency.
struct LoopbackBackend;

#[async_trait::async_trait]
impl SyncEffects for LoopbackBackend {
    async fn exchange(&self, envelope: SyncEnvelope) -> Result<SyncResponse, SyncError> {
        tracing::info!(
            batch_id = %envelope.batch_id,
            operations = envelope.operations.len(),
            "sync_exchange (loopback backend, no remote operations)"
        );
        Ok(SyncResponse {
            operations: Vec::new(),
            server_vector: VectorClock::new(),
        })
    }
}

struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_sync(&self, metrics: &SyncMetrics) {
        tracing::info!(
            latency_ms = metrics.latency_ms,
            sent = metrics.operations_sent,
            received = metrics.operations_received,
            conflicts_resolved = metrics.conflicts_resolved,
            success = metrics.success,
            "sync_metrics"
        );
    }
}

type ConfiguredEmrAdapter = EmrAdapter<ReqwestFhirClient, TcpHl7Client, ReqwestTokenFetcher>;

/// For each event touching EMR-bound fields, invokes the EMR Adapter and
/// feeds the result through the Verification Engine, persisting the
/// resulting `verification_state` (§4.9, §4.10). When no EMR adapter is
/// configured (no FHIR base URL / OAuth credentials), every event is just
/// logged — the Sync Orchestrator already persisted the merged replica by
/// the time this handler runs.
///
/// A fetch or verification failure is logged, not propagated: returning
/// `Err` here would leave the dispatcher's offset uncommitted and redeliver
/// the event forever while the EMR backend stays down or misconfigured.
struct EmrVerifyingEventHandler {
    adapter: Option<Arc<ConfiguredEmrAdapter>>,
    verifier: Arc<VerificationEngine<InMemoryPersistence>>,
    persistence: Arc<InMemoryPersistence>,
    token_request: Option<TokenRequestConfig>,
    default_system: EmrSystem,
}

impl EmrVerifyingEventHandler {
    async fn verify_task(&self, replica: &clinical_core::task::TaskReplica, now_ns: u64) {
        let (Some(adapter), Some(token_request)) = (&self.adapter, &self.token_request) else {
            return;
        };

        let outcome = match adapter
            .fetch_task(self.default_system, replica.id.as_str(), token_request, now_ns)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(task_id = %replica.id, error = %err, "emr_fetch_failed, leaving verification pending");
                return;
            }
        };

        let next_version = replica.emr_payload.as_ref().map(|p| p.version + 1).unwrap_or(1);
        let envelope = envelope_from_task(self.default_system, &outcome.resource, next_version, now_ns);
        let remote_status = outcome.resource.status.clone();

        match self
            .verifier
            .verify(replica, &envelope, Some(&remote_status), None, now_ns)
            .await
        {
            Ok((result, updated)) => {
                if let Err(err) = self.persistence.save_batch(&[updated]).await {
                    tracing::error!(task_id = %replica.id, error = %err, "failed to persist verification result");
                } else {
                    tracing::info!(task_id = %replica.id, is_valid = result.is_valid, "emr_verification wired");
                }
            }
            Err(err) => {
                tracing::warn!(task_id = %replica.id, error = %err, "emr_verification_failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl TaskEventHandler for EmrVerifyingEventHandler {
    async fn handle(&self, event: &TopicEvent, now_ns: u64) -> Result<(), String> {
        match event {
            TopicEvent::TaskCreated(r) => {
                tracing::info!(task_id = %r.id, "task.created");
                if r.patient_reference.is_some() {
                    self.verify_task(r, now_ns).await;
                }
            }
            TopicEvent::TaskUpdated(r) => {
                tracing::info!(task_id = %r.id, "task.updated");
                if r.patient_reference.is_some() {
                    self.verify_task(r, now_ns).await;
                }
            }
            TopicEvent::TaskDeleted(id) => tracing::info!(task_id = %id, "task.deleted"),
            TopicEvent::SyncRequest { node_id, .. } => {
                tracing::info!(node_id = %node_id, "sync.request")
            }
        }
        Ok(())
    }
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ClinicalConfig::load_from_file(path)?,
        None => ClinicalConfig::load_from_env("CLINICAL")?,
    };
    config.validate()?;

    let node_id = NodeId::new(cli.node_id);
    tracing::info!(node_id = %node_id, "clinical-app starting");

    // --- Persistence (C4) ---
    let keys = Arc::new(StaticKeyProvider::new(
        config.persistence.encryption_key_id.clone(),
        [0u8; 32],
    ));
    let persistence = Arc::new(InMemoryPersistence::new(
        keys,
        config.persistence.encryption_key_id.clone(),
        config.persistence.max_bytes,
    ));
    let outbox = Arc::new(InMemoryOutbox::new());

    // --- Sync Orchestrator (C5), backed by a loopback stand-in for the
    // external backend ---
    let orchestrator = SyncOrchestrator::new(
        node_id.clone(),
        config.sync.clone(),
        persistence.clone(),
        Arc::new(LoopbackBackend),
        outbox,
        persistence.clone(),
        Arc::new(TracingMetricsSink),
        config.merge.clock_merge_policy,
    );

    // --- EMR Adapter (C6-C9), built only if a FHIR base URL and OAuth
    // credentials are both configured; a default EMR system is chosen since
    // `TaskReplica` carries no per-task system association prior to its
    // first fetch (§3: system association only exists post-fetch, on
    // `emr_payload.system`) ---
    let (adapter, token_request, default_system) = if let (Some(token_url), Some(client_id), Some(client_secret)) = (
        config.emr.oauth_token_url.clone(),
        config.emr.oauth_client_id.clone(),
        config.emr.oauth_client_secret.clone(),
    ) {
        let mut base_urls = HashMap::new();
        if let Some(url) = &config.emr.epic_fhir_base_url {
            base_urls.insert(EmrSystem::Epic, url.clone());
        }
        if let Some(url) = &config.emr.cerner_fhir_base_url {
            base_urls.insert(EmrSystem::Cerner, url.clone());
        }
        let default_system = if config.emr.epic_fhir_base_url.is_some() {
            EmrSystem::Epic
        } else {
            EmrSystem::Cerner
        };

        let http_client = reqwest::Client::new();
        let fhir = ReqwestFhirClient::new(http_client.clone(), base_urls);
        let hl7 = TcpHl7Client {
            host: config.emr.hl7_host.clone().unwrap_or_else(|| "localhost".into()),
            port: config.emr.hl7_port.unwrap_or(2575),
            request_timeout: Duration::from_millis(config.emr.request_timeout_ms),
        };
        let token_fetcher = ReqwestTokenFetcher::new(http_client);
        let tokens = TokenManager::new(token_fetcher, TokenConfig::default());
        let breaker = CircuitBreaker::new(
            config.emr.circuit_failure_threshold,
            config.emr.circuit_reset_timeout_ms * 1_000_000,
        );
        let adapter = EmrAdapter::new(
            fhir,
            hl7,
            tokens,
            breaker,
            Duration::from_millis(config.emr.request_timeout_ms),
        );
        let token_request = TokenRequestConfig {
            key: TokenKey {
                endpoint: token_url.clone(),
                client_id: client_id.clone(),
                scope: config.emr.oauth_scope.clone().unwrap_or_default(),
                audience: None,
                resource: None,
            },
            token_url,
            client_secret,
            refresh_token: None,
        };
        tracing::info!("emr adapter constructed");
        (Some(Arc::new(adapter)), Some(token_request), default_system)
    } else {
        tracing::info!("no oauth credentials configured, skipping emr adapter construction");
        (None, None, EmrSystem::Epic)
    };

    let verifier = Arc::new(VerificationEngine::new(persistence.clone(), "emr-verifying-handler"));

    // --- Event Dispatcher (C10) ---
    let bus = Arc::new(InMemoryEventBus::new(8));
    let handler = EmrVerifyingEventHandler {
        adapter,
        verifier,
        persistence: persistence.clone(),
        token_request,
        default_system,
    };
    let dispatcher = EventDispatcher::new(
        bus,
        handler,
        config.sync.inbound_queue_capacity,
        config.sync.inbound_queue_capacity,
        config.sync.outbound_token_bucket_per_s,
        now_ns(),
    );
    dispatcher.subscribe("clinical-app").await?;

    // --- One sync-and-verify tick ---
    let cancel = CancellationFlag::new();
    let local = HashMap::new();
    match orchestrator.start_sync(&local, true, &cancel, now_ns()).await {
        Ok(metrics) => tracing::info!(?metrics, "tick complete"),
        Err(err) => tracing::error!(error = %err, "tick failed"),
    }
    dispatcher.run_once(config.sync.batch_size, now_ns()).await?;

    if !cli.once {
        tracing::warn!("daemon mode not implemented in this wiring binary; exiting after one tick");
    }

    Ok(())
}

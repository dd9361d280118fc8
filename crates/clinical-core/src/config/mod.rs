//! Layered configuration for the clinical sync engine (§6 "Config surface").
//!
//! `ClinicalConfig` holds every tunable named in the spec's config surface,
//! grouped into nested structs mirroring the `sync.*`/`merge.*`/`emr.*`/
//! `token.*`/`persistence.*` namespacing. [`loader`] implements the layered
//! file+env+override merge, following the teacher's `ConfigSource` /
//! `ConfigLoader` / `ConfigMerger` triad.

mod loader;

pub use loader::{ConfigLoader, ConfigMerger, ConfigPriority, ConfigSource, ConfigValidate};

use crate::clock::ClockMergePolicy;
use crate::errors::ClinicalError;
use serde::{Deserialize, Serialize};

/// `sync.*` — Sync Orchestrator tunables (§4.5, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_s: u64,
    pub min_interval_s: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub per_operation_timeout_ms: u64,
    pub per_merge_timeout_ms: u64,
    pub inbound_queue_capacity: usize,
    pub outbound_token_bucket_per_s: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_s: 300,
            min_interval_s: 60,
            batch_size: 100,
            max_attempts: 5,
            retry_base_ms: 1_000,
            retry_cap_ms: 30_000,
            per_operation_timeout_ms: 30_000,
            per_merge_timeout_ms: 500,
            inbound_queue_capacity: 2048,
            outbound_token_bucket_per_s: 1000,
        }
    }
}

/// `merge.*` — Conflict Resolver and vector clock tunables (§4.1, §4.3, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub chunk_size: usize,
    pub timeout_ms: u64,
    pub vector_clock_prune_threshold: usize,
    pub clock_merge_policy: ClockMergePolicy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            timeout_ms: 500,
            vector_clock_prune_threshold: 1000,
            clock_merge_policy: ClockMergePolicy::default(),
        }
    }
}

/// `emr.*` — EMR Adapter, Circuit Breaker, and Verification Engine tunables
/// (§4.7, §4.8, §4.9, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmrConfig {
    pub request_timeout_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_reset_timeout_ms: u64,
    pub circuit_half_open_probes: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub retry_max_attempts: u32,
    pub verification_freshness_s: u64,
    pub hl7_host: Option<String>,
    pub hl7_port: Option<u16>,
    pub epic_fhir_base_url: Option<String>,
    pub cerner_fhir_base_url: Option<String>,
    /// OAuth2 token endpoint for the EMR Adapter's FHIR client (§4.6).
    /// `None` disables EMR-bound verification entirely, regardless of
    /// whether a FHIR base URL is configured.
    pub oauth_token_url: Option<String>,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub oauth_scope: Option<String>,
}

impl Default for EmrConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_ms: 30_000,
            circuit_half_open_probes: 1,
            retry_base_ms: 100,
            retry_cap_ms: 5_000,
            retry_max_attempts: 3,
            verification_freshness_s: 900,
            hl7_host: None,
            hl7_port: None,
            epic_fhir_base_url: None,
            cerner_fhir_base_url: None,
            oauth_token_url: None,
            oauth_client_id: None,
            oauth_client_secret: None,
            oauth_scope: None,
        }
    }
}

/// `token.*` — OAuth2 Token Manager tunables (§4.6, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub refresh_margin_s: u64,
    pub retry_base_ms: u64,
    pub retry_multiplier: u32,
    pub retry_max_attempts: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_margin_s: 300,
            retry_base_ms: 1_000,
            retry_multiplier: 2,
            retry_max_attempts: 3,
        }
    }
}

/// `persistence.*` — Local Persistence tunables (§4.4, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_bytes: u64,
    pub load_timeout_ms: u64,
    pub migration_timeout_ms: u64,
    pub encryption_key_id: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1 << 30,
            load_timeout_ms: 30_000,
            migration_timeout_ms: 300_000,
            encryption_key_id: "default".to_string(),
        }
    }
}

/// The full, merged configuration surface for one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicalConfig {
    pub sync: SyncConfig,
    pub merge: MergeConfig,
    pub emr: EmrConfig,
    pub token: TokenConfig,
    pub persistence: PersistenceConfig,
}

impl ConfigValidate for ClinicalConfig {
    /// Reject internally inconsistent configuration (§6): `sync.min_interval_s`
    /// must be at least 60s and must not exceed `sync.interval_s`, and
    /// `emr.circuit_half_open_probes` must be nonzero for the half-open
    /// circuit state to ever close.
    fn validate_self(&self) -> Result<(), ClinicalError> {
        if self.sync.min_interval_s < 60 {
            return Err(ClinicalError::config(format!(
                "sync.min_interval_s must be >= 60s, got {}",
                self.sync.min_interval_s
            )));
        }
        if self.sync.min_interval_s > self.sync.interval_s {
            return Err(ClinicalError::config(format!(
                "sync.min_interval_s ({}) must not exceed sync.interval_s ({})",
                self.sync.min_interval_s, self.sync.interval_s
            )));
        }
        if self.sync.max_attempts == 0 {
            return Err(ClinicalError::config("sync.max_attempts must be >= 1"));
        }
        if self.emr.circuit_half_open_probes == 0 {
            return Err(ClinicalError::config("emr.circuit_half_open_probes must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = ClinicalConfig::default();
        assert_eq!(cfg.sync.interval_s, 300);
        assert_eq!(cfg.sync.min_interval_s, 60);
        assert_eq!(cfg.sync.batch_size, 100);
        assert_eq!(cfg.merge.timeout_ms, 500);
        assert_eq!(cfg.merge.vector_clock_prune_threshold, 1000);
        assert_eq!(cfg.emr.circuit_failure_threshold, 5);
        assert_eq!(cfg.emr.circuit_reset_timeout_ms, 30_000);
        assert_eq!(cfg.token.refresh_margin_s, 300);
        assert_eq!(cfg.persistence.max_bytes, 1 << 30);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = ClinicalConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: ClinicalConfig = toml::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn default_config_validates() {
        assert!(ClinicalConfig::default().validate_self().is_ok());
    }

    #[test]
    fn rejects_min_interval_below_60s() {
        let mut cfg = ClinicalConfig::default();
        cfg.sync.min_interval_s = 30;
        assert!(cfg.validate_self().is_err());
    }

    #[test]
    fn rejects_min_interval_above_base_interval() {
        let mut cfg = ClinicalConfig::default();
        cfg.sync.interval_s = 60;
        cfg.sync.min_interval_s = 120;
        assert!(cfg.validate_self().is_err());
    }

    #[test]
    fn rejects_zero_half_open_probes() {
        let mut cfg = ClinicalConfig::default();
        cfg.emr.circuit_half_open_probes = 0;
        assert!(cfg.validate_self().is_err());
    }
}

//! Layered config loading: file, environment, explicit overrides, merged by
//! priority. Mirrors the teacher's `ConfigSource`/`ConfigLoader`/
//! `ConfigMerger` triad.

use crate::errors::ClinicalError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Relative precedence of a config source; higher wins on conflicting keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigPriority {
    Low = 1,
    Medium = 2,
    High = 3,
}

/// Where a layer of configuration came from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A TOML file on disk.
    File { path: PathBuf, priority: ConfigPriority },
    /// Environment variables, conventionally prefixed (e.g. `CLINICAL_`).
    Environment,
    /// Explicit command-line or programmatic overrides.
    CommandLine,
    /// The type's `Default` implementation.
    Defaults,
}

impl ConfigSource {
    pub fn priority(&self) -> ConfigPriority {
        match self {
            ConfigSource::File { priority, .. } => *priority,
            ConfigSource::Environment => ConfigPriority::Medium,
            ConfigSource::CommandLine => ConfigPriority::High,
            ConfigSource::Defaults => ConfigPriority::Low,
        }
    }
}

/// Per-type validation hook, kept separate from [`ConfigLoader`] so each
/// config type opts into the bounds it actually has; types with no
/// cross-field constraints just take the default `Ok(())`.
pub trait ConfigValidate {
    fn validate_self(&self) -> Result<(), ClinicalError> {
        Ok(())
    }
}

/// Loads and merges a configuration type from the supported sources.
pub trait ConfigLoader<T> {
    /// Deserialize `T` from a TOML file at `path`.
    fn load_from_file(path: &Path) -> Result<T, ClinicalError>;

    /// Overlay environment variables prefixed with `prefix` onto `self`,
    /// where each nested field is addressed by `PREFIX_SECTION_FIELD`
    /// (upper snake case).
    fn load_from_env(prefix: &str) -> Result<T, ClinicalError>;

    /// Merge `other` onto `self`, with `other` winning on every field it sets.
    fn merge_with(self, other: T) -> T;

    /// Reject internally inconsistent configuration (e.g. a min interval
    /// greater than the base interval).
    fn validate(&self) -> Result<(), ClinicalError>;
}

impl<T> ConfigLoader<T> for T
where
    T: DeserializeOwned + Serialize + Default + Clone + ConfigValidate,
{
    fn load_from_file(path: &Path) -> Result<T, ClinicalError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ClinicalError::config(format!("reading config file {}: {e}", path.display()))
        })?;
        toml::from_str(&text).map_err(ClinicalError::from)
    }

    fn load_from_env(prefix: &str) -> Result<T, ClinicalError> {
        // Round-trip through the type's own TOML representation so nested
        // fields can be overlaid without hand-written per-field plumbing:
        // start from defaults, then patch any matching env var onto the
        // equivalent dotted TOML path.
        let base = T::default();
        let mut doc: toml::Value = toml::Value::try_from(&base)
            .map_err(|e| ClinicalError::config(format!("serializing defaults: {e}")))?;

        for (key, value) in std::env::vars() {
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            let path: Vec<String> = rest
                .trim_start_matches('_')
                .to_lowercase()
                .split('_')
                .map(str::to_string)
                .collect();
            if path.len() != 2 {
                continue;
            }
            set_toml_path(&mut doc, &path, &value);
        }

        doc.try_into().map_err(|e: toml::de::Error| ClinicalError::from(e))
    }

    fn merge_with(self, other: T) -> T {
        other
    }

    fn validate(&self) -> Result<(), ClinicalError> {
        self.validate_self()
    }
}

fn set_toml_path(doc: &mut toml::Value, path: &[String], raw_value: &str) {
    // Navigate to the section table, then set the scalar leaf, inferring
    // its type from what's already there (bool/int/string).
    let Some(section) = doc
        .as_table_mut()
        .and_then(|root| root.get_mut(&path[0]))
        .and_then(|v| v.as_table_mut())
    else {
        return;
    };
    let leaf = path[1].as_str();
    let coerced = match section.get(leaf) {
        Some(toml::Value::Integer(_)) => raw_value
            .parse::<i64>()
            .map(toml::Value::Integer)
            .unwrap_or_else(|_| toml::Value::String(raw_value.to_string())),
        Some(toml::Value::Boolean(_)) => raw_value
            .parse::<bool>()
            .map(toml::Value::Boolean)
            .unwrap_or_else(|_| toml::Value::String(raw_value.to_string())),
        _ => toml::Value::String(raw_value.to_string()),
    };
    section.insert(leaf.to_string(), coerced);
}

/// Builder that accumulates config layers in any order and merges them by
/// ascending [`ConfigPriority`] when [`ConfigMerger::merge`] is called.
pub struct ConfigMerger<T> {
    layers: Vec<(ConfigPriority, T)>,
}

impl<T> Default for ConfigMerger<T> {
    fn default() -> Self {
        Self { layers: Vec::new() }
    }
}

impl<T> ConfigMerger<T>
where
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, source: ConfigSource, value: T) -> Self {
        self.layers.push((source.priority(), value));
        self
    }

    /// Merge layers lowest-priority first so higher-priority layers win.
    pub fn merge(mut self, base: T) -> T {
        self.layers.sort_by_key(|(priority, _)| *priority);
        let mut result = base;
        for (_, layer) in self.layers.drain(..) {
            result = layer;
        }
        result
    }
}

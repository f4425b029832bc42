use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::provider::Provider;

/// The TOML file structure for chati.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub engine: Option<EngineConfig>,
    pub breaker: Option<BreakerSection>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSection>,
    /// Per-role write-scope overrides.
    #[serde(default)]
    pub scopes: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    pub poll_interval_ms: Option<u64>,
    pub default_timeout_secs: Option<u64>,
    pub grace_period_secs: Option<u64>,
    pub output_buffer_chunks: Option<usize>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BreakerSection {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderSection {
    pub command: Option<String>,
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub project_root: PathBuf,
    pub poll_interval: Duration,
    pub default_timeout: Duration,
    pub grace_period: Duration,
    pub output_buffer_chunks: usize,
    pub default_provider: Provider,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub max_attempts: u32,
    pub provider_commands: HashMap<Provider, String>,
    pub scope_overrides: HashMap<String, Vec<String>>,
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub project_root: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
    pub default_timeout_secs: Option<u64>,
    pub grace_period_secs: Option<u64>,
    pub output_buffer_chunks: Option<usize>,
    pub default_provider: Option<String>,
    pub failure_threshold: Option<u32>,
    pub reset_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    /// Keyed by provider name as written in the file.
    pub provider_commands: HashMap<String, String>,
    pub scope_overrides: HashMap<String, Vec<String>>,
}

use super::schema::{AppConfig, ConfigFile, PartialConfig};
use crate::isolation::WriteScopeTable;
use crate::orchestration::circuit_breaker::BreakerConfig;
use crate::orchestration::spawner::SpawnerConfig;
use crate::orchestration::types::DEFAULT_OUTPUT_CHUNKS;
use crate::provider::{DEFAULT_PROVIDER, Provider};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

impl ConfigFile {
    /// Flatten the file's sections into a mergeable layer.
    pub fn to_partial(self) -> PartialConfig {
        let engine = self.engine;
        let breaker = self.breaker;
        PartialConfig {
            project_root: None,
            poll_interval_ms: engine.as_ref().and_then(|e| e.poll_interval_ms),
            default_timeout_secs: engine.as_ref().and_then(|e| e.default_timeout_secs),
            grace_period_secs: engine.as_ref().and_then(|e| e.grace_period_secs),
            output_buffer_chunks: engine.as_ref().and_then(|e| e.output_buffer_chunks),
            default_provider: engine.and_then(|e| e.default_provider),
            failure_threshold: breaker.as_ref().and_then(|b| b.failure_threshold),
            reset_timeout_secs: breaker.as_ref().and_then(|b| b.reset_timeout_secs),
            max_attempts: breaker.and_then(|b| b.max_attempts),
            provider_commands: self
                .providers
                .into_iter()
                .filter_map(|(name, section)| section.command.map(|c| (name, c)))
                .collect(),
            scope_overrides: self.scopes,
        }
    }
}

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For provider commands and scope overrides: per-key merge, self wins per key.
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            project_root: self.project_root.or(fallback.project_root),
            poll_interval_ms: self.poll_interval_ms.or(fallback.poll_interval_ms),
            default_timeout_secs: self.default_timeout_secs.or(fallback.default_timeout_secs),
            grace_period_secs: self.grace_period_secs.or(fallback.grace_period_secs),
            output_buffer_chunks: self.output_buffer_chunks.or(fallback.output_buffer_chunks),
            default_provider: self.default_provider.or(fallback.default_provider),
            failure_threshold: self.failure_threshold.or(fallback.failure_threshold),
            reset_timeout_secs: self.reset_timeout_secs.or(fallback.reset_timeout_secs),
            max_attempts: self.max_attempts.or(fallback.max_attempts),
            provider_commands: merge_maps(self.provider_commands, fallback.provider_commands),
            scope_overrides: merge_maps(self.scope_overrides, fallback.scope_overrides),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        let default_provider = self
            .default_provider
            .as_deref()
            .map_or(DEFAULT_PROVIDER, |name| Provider::resolve(name, DEFAULT_PROVIDER));

        let mut provider_commands = HashMap::new();
        for (name, command) in self.provider_commands {
            match Provider::lookup(&name) {
                Some(provider) => {
                    provider_commands.insert(provider, command);
                }
                None => tracing::warn!(provider = %name, "Ignoring command override for unknown provider"),
            }
        }

        AppConfig {
            project_root: self.project_root.unwrap_or_else(|| PathBuf::from(".")),
            poll_interval: Duration::from_millis(self.poll_interval_ms.unwrap_or(2000).max(1)),
            default_timeout: Duration::from_secs(self.default_timeout_secs.unwrap_or(30 * 60)),
            grace_period: Duration::from_secs(self.grace_period_secs.unwrap_or(5)),
            output_buffer_chunks: self.output_buffer_chunks.unwrap_or(DEFAULT_OUTPUT_CHUNKS),
            default_provider,
            failure_threshold: self.failure_threshold.unwrap_or(3).max(1),
            reset_timeout: Duration::from_secs(self.reset_timeout_secs.unwrap_or(60)),
            max_attempts: self.max_attempts.unwrap_or(3).max(1),
            provider_commands,
            scope_overrides: self.scope_overrides,
        }
    }
}

impl AppConfig {
    pub fn spawner_config(&self) -> SpawnerConfig {
        SpawnerConfig {
            project_root: self.project_root.clone(),
            default_provider: self.default_provider,
            default_timeout: self.default_timeout,
            grace_period: self.grace_period,
            output_buffer_chunks: self.output_buffer_chunks,
            commands: self.provider_commands.clone(),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: self.reset_timeout,
        }
    }

    /// Default scope table with this config's per-role overrides applied.
    pub fn write_scopes(&self) -> WriteScopeTable {
        WriteScopeTable::with_overrides(&self.scope_overrides)
    }
}

fn merge_maps<V>(primary: HashMap<String, V>, fallback: HashMap<String, V>) -> HashMap<String, V> {
    let mut merged = fallback;
    merged.extend(primary);
    merged
}

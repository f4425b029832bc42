pub mod merge;
pub mod schema;

pub use schema::*;

use crate::cli::{Cli, Commands};
use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Project-level config file name.
pub const CONFIG_FILE_NAME: &str = "chati.toml";

/// Load configuration by merging global, project, and CLI sources.
/// Precedence: CLI > project config > global config > defaults.
///
/// Missing config files are handled gracefully (defaults apply). An explicit
/// `--config` path that cannot be read or parsed is an error.
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let args = cli.command.project_args();

    // Layer 1: Global config (~/.config/chati/chati.toml or platform equivalent)
    let global = load_global_config();

    // Layer 2: Project config (explicit --config, else <project>/chati.toml)
    let project_root = args.project.clone().unwrap_or_else(|| PathBuf::from("."));
    let project = match &args.config {
        Some(path) => load_toml_file(path)?.to_partial(),
        None => load_optional(&project_root.join(CONFIG_FILE_NAME)),
    };

    // Layer 3: CLI args
    let cli_partial = cli_to_partial(cli);

    let config = cli_partial
        .with_fallback(project)
        .with_fallback(global)
        .finalize();

    Ok(config)
}

/// Load global config from the platform-specific config directory.
/// Returns empty PartialConfig if file not found.
fn load_global_config() -> PartialConfig {
    match global_config_path() {
        Some(p) => load_optional(&p),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

/// Load a config layer that may legitimately be absent. Parse errors are
/// logged and the layer is skipped.
fn load_optional(path: &Path) -> PartialConfig {
    match load_toml_file(path) {
        Ok(file) => file.to_partial(),
        Err(ConfigError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            PartialConfig::default()
        }
        Err(e) => {
            tracing::warn!("Skipping config layer: {}", e);
            PartialConfig::default()
        }
    }
}

/// Read and parse one TOML config file.
pub fn load_toml_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let file = toml::from_str::<ConfigFile>(&contents).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(file)
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/chati/chati.toml
/// macOS: ~/Library/Application Support/chati/chati.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "chati")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    let base = PartialConfig {
        project_root: cli.command.project_args().project.clone(),
        ..Default::default()
    };
    match &cli.command {
        Commands::Run {
            poll_ms, timeout, ..
        } => PartialConfig {
            poll_interval_ms: *poll_ms,
            default_timeout_secs: *timeout,
            ..base
        },
        Commands::Check { .. } | Commands::Scopes { .. } => base,
    }
}

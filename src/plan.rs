//! Group plan files.
//!
//! A plan lists the workers of one parallel step and the role that receives
//! the consolidated handoff:
//!
//! ```toml
//! next_role = "phases"
//!
//! [[worker]]
//! role = "architect"
//! task_id = "T1"
//! provider = "claude"
//! prompt_file = "prompts/architect.md"
//! timeout_secs = 900
//! context = { phase = "planning" }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::orchestration::types::LaunchRequest;

#[derive(Debug, Clone, Deserialize)]
pub struct PlanFile {
    pub next_role: Option<String>,
    #[serde(default, rename = "worker")]
    pub workers: Vec<WorkerSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSpec {
    pub role: String,
    pub task_id: String,
    #[serde(default)]
    pub provider: String,
    pub model: Option<String>,
    pub prompt: Option<String>,
    /// Relative paths resolve against the plan file's directory.
    pub prompt_file: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub write_scope: Option<Vec<String>>,
    pub context: Option<toml::Value>,
}

/// A loaded plan with prompts resolved.
#[derive(Debug, Clone)]
pub struct Plan {
    pub next_role: Option<String>,
    pub requests: Vec<LaunchRequest>,
}

impl Plan {
    /// Load and resolve a plan file. `project_root` becomes every worker's
    /// working directory.
    pub fn load(path: &Path, project_root: &Path) -> Result<Plan, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let file: PlanFile = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        file.resolve(base, project_root)
    }
}

impl PlanFile {
    pub fn resolve(self, base: &Path, project_root: &Path) -> Result<Plan, ConfigError> {
        if self.workers.is_empty() {
            return Err(ConfigError::InvalidPlan("plan has no [[worker]] entries".into()));
        }

        let requests = self
            .workers
            .into_iter()
            .map(|w| w.into_request(base, project_root))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(workers = requests.len(), "Plan resolved");
        Ok(Plan {
            next_role: self.next_role,
            requests,
        })
    }
}

impl WorkerSpec {
    fn into_request(self, base: &Path, project_root: &Path) -> Result<LaunchRequest, ConfigError> {
        let prompt = match (self.prompt, &self.prompt_file) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidPlan(format!(
                    "worker {} sets both prompt and prompt_file",
                    self.role
                )));
            }
            (Some(prompt), None) => prompt,
            (None, Some(file)) => std::fs::read_to_string(base.join(file))?,
            (None, None) => String::new(),
        };

        let mut request = LaunchRequest::new(self.role, self.task_id)
            .with_provider(self.provider)
            .with_prompt(prompt)
            .with_working_dir(project_root);
        if let Some(model) = self.model {
            request = request.with_model(model);
        }
        if let Some(secs) = self.timeout_secs {
            request = request.with_timeout(Duration::from_secs(secs));
        }
        if let Some(scope) = self.write_scope {
            request = request.with_write_scope(scope);
        }
        if let Some(context) = self.context {
            let json = serde_json::to_value(context)
                .map_err(|e| ConfigError::InvalidPlan(format!("context is not JSON-compatible: {e}")))?;
            request = request.with_context(json);
        }
        Ok(request)
    }
}

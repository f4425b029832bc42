//! External CLI providers that can run a worker.
//!
//! Each provider is a non-interactive CLI that reads its prompt from stdin.
//! Names are resolved through a fixed lookup table; anything unknown falls
//! back to a default provider with a warning instead of failing the request.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Gemini,
    Codex,
    Copilot,
    /// Runs the prompt as a POSIX shell script. Used for dry runs and tests.
    Shell,
}

/// Fallback when neither the request nor the config names a known provider.
pub const DEFAULT_PROVIDER: Provider = Provider::Claude;

const PROVIDER_TABLE: &[(&str, Provider)] = &[
    ("claude", Provider::Claude),
    ("anthropic", Provider::Claude),
    ("gemini", Provider::Gemini),
    ("google", Provider::Gemini),
    ("codex", Provider::Codex),
    ("openai", Provider::Codex),
    ("copilot", Provider::Copilot),
    ("github-copilot", Provider::Copilot),
    ("shell", Provider::Shell),
    ("sh", Provider::Shell),
];

impl Provider {
    /// Look a provider up by name or alias (case-insensitive).
    pub fn lookup(name: &str) -> Option<Provider> {
        let needle = name.trim().to_ascii_lowercase();
        PROVIDER_TABLE
            .iter()
            .find(|(alias, _)| *alias == needle)
            .map(|(_, provider)| *provider)
    }

    /// Resolve `name`, falling back to `fallback` for empty or unknown names.
    pub fn resolve(name: &str, fallback: Provider) -> Provider {
        if name.trim().is_empty() {
            return fallback;
        }
        match Provider::lookup(name) {
            Some(provider) => provider,
            None => {
                tracing::warn!(
                    provider = name,
                    fallback = fallback.name(),
                    "Unknown provider; using fallback"
                );
                fallback
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Gemini => "gemini",
            Provider::Codex => "codex",
            Provider::Copilot => "copilot",
            Provider::Shell => "shell",
        }
    }

    /// Binary invoked when the config does not override it.
    pub fn default_command(self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Gemini => "gemini",
            Provider::Codex => "codex",
            Provider::Copilot => "copilot",
            Provider::Shell => "sh",
        }
    }

    /// Arguments for a non-interactive, prompt-on-stdin invocation.
    pub fn args(self, model: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match self {
            Provider::Claude => {
                args.extend(["--print", "--output-format", "text"].map(String::from));
                if let Some(m) = model {
                    args.extend(["--model".to_string(), m.to_string()]);
                }
            }
            Provider::Gemini => {
                args.push("--yolo".into());
                if let Some(m) = model {
                    args.extend(["--model".to_string(), m.to_string()]);
                }
            }
            Provider::Codex => {
                args.push("exec".into());
                if let Some(m) = model {
                    args.extend(["--model".to_string(), m.to_string()]);
                }
                // `-` tells codex to read the prompt from stdin.
                args.push("-".into());
            }
            Provider::Copilot => {
                args.push("--allow-all-tools".into());
                if let Some(m) = model {
                    args.extend(["--model".to_string(), m.to_string()]);
                }
            }
            Provider::Shell => {
                args.push("-s".into());
            }
        }
        args
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

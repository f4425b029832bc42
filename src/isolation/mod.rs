//! Write-scope isolation between concurrently running workers.
//!
//! Every role owns a set of path prefixes (relative to the project root) it
//! may write. Reads are unrestricted. Before a parallel group is launched the
//! batch is checked pairwise: two workers whose scopes overlap must never run
//! at the same time, so any overlap aborts the whole batch.
//!
//! The orchestrator does not sandbox the filesystem. The resolved scope is
//! advertised to each worker through environment variables (see
//! [`build_isolation_env`]) and workers report their own violations on stderr
//! with [`VIOLATION_MARKER`], which [`violation::ViolationDetector`] picks up.

pub mod defaults;
pub mod violation;

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::orchestration::types::LaunchRequest;

/// Environment variable carrying the delimiter-joined write scope.
pub const ENV_WRITE_SCOPE: &str = "CHATI_WRITE_SCOPE";
/// Environment variable carrying the read scope.
pub const ENV_READ_SCOPE: &str = "CHATI_READ_SCOPE";
/// Token a worker prints on stderr when it refused (or performed) an out-of-scope write.
pub const VIOLATION_MARKER: &str = "CHATI_WRITE_SCOPE_VIOLATION";
/// Delimiter used when serializing a write scope into a single variable.
pub const SCOPE_DELIMITER: &str = ",";
/// Read scope advertised to every worker.
pub const READ_ALL: &str = "*";

/// Two requests in one batch whose write scopes overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeConflict {
    pub role_a: String,
    pub role_b: String,
    /// The overlapping prefix (the more specific of the two).
    pub path: String,
}

/// Outcome of [`WriteScopeTable::validate`].
#[derive(Debug, Clone, Serialize)]
pub struct ScopeValidation {
    pub valid: bool,
    pub conflicts: Vec<ScopeConflict>,
}

/// Environment variables injected into a worker for self-enforcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationEnv {
    pub write_scope: String,
    pub read_scope: String,
}

impl IsolationEnv {
    /// The `(name, value)` pairs in the order they are set on the child.
    pub fn vars(&self) -> [(&'static str, String); 2] {
        [
            (ENV_WRITE_SCOPE, self.write_scope.clone()),
            (ENV_READ_SCOPE, self.read_scope.clone()),
        ]
    }
}

/// Immutable role -> write-prefix mapping, shared read-only across a run.
#[derive(Debug, Clone)]
pub struct WriteScopeTable {
    scopes: HashMap<String, Vec<String>>,
}

impl Default for WriteScopeTable {
    fn default() -> Self {
        Self::new(defaults::default_write_scopes())
    }
}

impl WriteScopeTable {
    pub fn new(scopes: HashMap<String, Vec<String>>) -> Self {
        Self { scopes }
    }

    /// Default table with per-role overrides layered on top. An override
    /// replaces the default prefixes for that role entirely.
    pub fn with_overrides(overrides: &HashMap<String, Vec<String>>) -> Self {
        let mut scopes = defaults::default_write_scopes();
        for (role, prefixes) in overrides {
            scopes.insert(role.clone(), prefixes.clone());
        }
        Self { scopes }
    }

    /// Configured prefixes for `role`. Unknown roles get an empty scope.
    pub fn get(&self, role: &str) -> &[String] {
        self.scopes.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sorted view of the whole table, for display.
    pub fn entries(&self) -> BTreeMap<&str, &[String]> {
        self.scopes
            .iter()
            .map(|(role, prefixes)| (role.as_str(), prefixes.as_slice()))
            .collect()
    }

    /// Effective scope of a request: its override if present, else the table's.
    pub fn resolve(&self, request: &LaunchRequest) -> Vec<String> {
        match &request.write_scope {
            Some(scope) => scope.clone(),
            None => self.get(&request.role).to_vec(),
        }
    }

    /// Check every unordered pair of requests for overlapping write scopes.
    pub fn validate(&self, requests: &[LaunchRequest]) -> ScopeValidation {
        let resolved: Vec<Vec<String>> = requests.iter().map(|r| self.resolve(r)).collect();
        let mut conflicts = Vec::new();

        for i in 0..requests.len() {
            for j in (i + 1)..requests.len() {
                for a in &resolved[i] {
                    for b in &resolved[j] {
                        if let Some(path) = overlap(a, b) {
                            conflicts.push(ScopeConflict {
                                role_a: requests[i].role.clone(),
                                role_b: requests[j].role.clone(),
                                path: path.to_string(),
                            });
                        }
                    }
                }
            }
        }

        ScopeValidation {
            valid: conflicts.is_empty(),
            conflicts,
        }
    }

    /// Whether `role` may write `path`.
    pub fn is_path_allowed(&self, role: &str, path: &str) -> bool {
        is_within_scope(self.get(role), path)
    }

    /// Environment advertising `role`'s configured scope.
    pub fn isolation_env(&self, role: &str) -> IsolationEnv {
        build_isolation_env(self.get(role))
    }
}

/// Whether `path` equals, or is nested under, one of `scope`'s prefixes.
///
/// Paths containing `..` are never allowed.
pub fn is_within_scope(scope: &[String], path: &str) -> bool {
    let target = ScopePath::parse(path);
    if target.parts.iter().any(|p| p == "..") {
        return false;
    }
    scope.iter().any(|prefix| ScopePath::parse(prefix).contains(&target))
}

/// Serialize a write scope for injection into the worker environment.
pub fn build_isolation_env(scope: &[String]) -> IsolationEnv {
    IsolationEnv {
        write_scope: scope.join(SCOPE_DELIMITER),
        read_scope: READ_ALL.to_string(),
    }
}

/// Returns the overlapping prefix if `a` and `b` share any directory.
fn overlap<'a>(a: &'a str, b: &'a str) -> Option<&'a str> {
    let pa = ScopePath::parse(a);
    let pb = ScopePath::parse(b);
    if pa.contains(&pb) {
        Some(b)
    } else if pb.contains(&pa) {
        Some(a)
    } else {
        None
    }
}

/// A path split into normalized components.
#[derive(Debug, PartialEq, Eq)]
struct ScopePath {
    absolute: bool,
    parts: Vec<String>,
}

impl ScopePath {
    fn parse(raw: &str) -> Self {
        let normalized = raw.replace('\\', "/");
        let absolute = normalized.starts_with('/');
        let parts = normalized
            .split('/')
            .filter(|p| !p.is_empty() && *p != ".")
            .map(str::to_string)
            .collect();
        Self { absolute, parts }
    }

    /// Component-wise prefix test: `src` contains `src/lib.rs` but not `src2`.
    fn contains(&self, other: &ScopePath) -> bool {
        self.absolute == other.absolute
            && self.parts.len() <= other.parts.len()
            && self.parts.iter().zip(&other.parts).all(|(a, b)| a == b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, &[&str])]) -> WriteScopeTable {
        WriteScopeTable::new(
            entries
                .iter()
                .map(|(role, prefixes)| {
                    (
                        role.to_string(),
                        prefixes.iter().map(|p| p.to_string()).collect(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn unknown_role_has_empty_scope() {
        let t = table(&[("dev", &["src/"])]);
        assert!(t.get("nobody").is_empty());
        assert!(!t.is_path_allowed("nobody", "src/main.rs"));
    }

    #[test]
    fn prefix_match_respects_directory_boundaries() {
        let t = table(&[("dev", &["src/"])]);
        assert!(t.is_path_allowed("dev", "src"));
        assert!(t.is_path_allowed("dev", "src/lib.rs"));
        assert!(t.is_path_allowed("dev", "./src/deep/mod.rs"));
        assert!(!t.is_path_allowed("dev", "src2/lib.rs"));
        assert!(!t.is_path_allowed("dev", "docs/src/readme.md"));
    }

    #[test]
    fn windows_separators_are_normalized() {
        let t = table(&[("dev", &["src/"])]);
        assert!(t.is_path_allowed("dev", "src\\orchestration\\mod.rs"));
    }

    #[test]
    fn dotdot_paths_are_rejected() {
        let t = table(&[("dev", &["src/"])]);
        assert!(!t.is_path_allowed("dev", "src/../Cargo.toml"));
    }

    #[test]
    fn sibling_prefixes_do_not_overlap() {
        assert_eq!(overlap("src/", "src2/"), None);
        assert_eq!(overlap("src/api/", "src/"), Some("src/api/"));
        assert_eq!(overlap("test/", "./test"), Some("./test"));
    }

    #[test]
    fn isolation_env_joins_prefixes() {
        let env = build_isolation_env(&["src/".to_string(), "test/".to_string()]);
        assert_eq!(env.write_scope, "src/,test/");
        assert_eq!(env.read_scope, "*");
        assert_eq!(env.vars()[0].0, "CHATI_WRITE_SCOPE");
    }
}

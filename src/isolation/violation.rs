use regex::RegexSet;

use super::VIOLATION_MARKER;

/// Scans worker stderr for self-reported write-scope violations.
pub struct ViolationDetector {
    patterns: RegexSet,
}

impl Default for ViolationDetector {
    fn default() -> Self {
        // The marker is a fixed ASCII token, so escaping cannot fail to compile.
        Self::new(&[regex::escape(VIOLATION_MARKER)]).unwrap_or_else(|_| Self {
            patterns: RegexSet::empty(),
        })
    }
}

impl ViolationDetector {
    /// Build a detector from additional marker patterns.
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: RegexSet::new(patterns)?,
        })
    }

    /// Return every stderr line that carries a violation marker, trimmed.
    pub fn scan(&self, stderr: &str) -> Vec<String> {
        stderr
            .lines()
            .filter(|line| self.patterns.is_match(line))
            .map(|line| line.trim().to_string())
            .collect()
    }
}

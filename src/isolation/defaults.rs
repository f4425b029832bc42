use std::collections::HashMap;

/// Returns the built-in role -> write-prefix table.
///
/// Planning roles each own one artifact directory, so any of them can run
/// side by side. `dev` and `qa-implementation` both own the test trees and
/// must never share a parallel group.
pub fn default_write_scopes() -> HashMap<String, Vec<String>> {
    let table: &[(&str, &[&str])] = &[
        ("greenfield-wu", &[".chati/artifacts/0-WU/"]),
        ("brownfield-wu", &[".chati/artifacts/0-WU/"]),
        ("brief", &[".chati/artifacts/1-Brief/"]),
        ("detail", &[".chati/artifacts/2-PRD/"]),
        ("architect", &[".chati/artifacts/3-Architecture/"]),
        ("ux", &[".chati/artifacts/4-UX/"]),
        ("phases", &[".chati/artifacts/5-Phases/"]),
        ("tasks", &[".chati/artifacts/6-Tasks/"]),
        ("qa-planning", &[".chati/artifacts/7-QA-Planning/"]),
        ("dev", &["src/", "lib/", "test/", "tests/"]),
        (
            "qa-implementation",
            &["test/", "tests/", ".chati/artifacts/8-Validation/"],
        ),
        ("devops", &[".github/", "deploy/", ".chati/artifacts/9-Deploy/"]),
    ];

    table
        .iter()
        .map(|(role, prefixes)| {
            (
                role.to_string(),
                prefixes.iter().map(|p| p.to_string()).collect(),
            )
        })
        .collect()
}

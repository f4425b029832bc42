use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chati::error::LaunchError;
use chati::isolation::WriteScopeTable;
use chati::orchestration::spawner::{Spawner, SpawnerConfig, terminate};
use chati::orchestration::types::{
    LaunchRequest, SPAWN_FAILED_EXIT_CODE, TIMEOUT_EXIT_CODE, TerminalHandle, TerminalStatus,
};
use chati::provider::Provider;
use tempfile::TempDir;

// ─── Helper ───────────────────────────────────────────────────────────

fn setup_project() -> TempDir {
    tempfile::tempdir().expect("failed to create temp dir")
}

fn test_spawner(project: &std::path::Path) -> Spawner {
    let config = SpawnerConfig {
        project_root: project.to_path_buf(),
        default_provider: Provider::Shell,
        grace_period: Duration::from_millis(300),
        ..Default::default()
    };
    Spawner::new(config, Arc::new(WriteScopeTable::default()))
}

fn shell(role: &str, script: &str) -> LaunchRequest {
    LaunchRequest::new(role, "T1")
        .with_provider("shell")
        .with_prompt(script)
}

async fn finished(handle: &TerminalHandle) {
    tokio::time::timeout(Duration::from_secs(10), handle.wait_for_exit())
        .await
        .expect("worker should exit");
}

// ============================================================
// Launch and exit capture
// ============================================================

#[tokio::test]
async fn test_launch_captures_output_and_exit_code() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let handle = spawner
        .launch(&shell("dev", "echo hello\necho oops >&2\nexit 0"))
        .await
        .unwrap();
    assert!(handle.pid().is_some());
    finished(&handle).await;

    assert_eq!(handle.status(), TerminalStatus::Exited);
    assert_eq!(handle.exit_code(), Some(0));
    assert_eq!(handle.stdout_text(), "hello\n");
    assert_eq!(handle.stderr_text(), "oops\n");
    assert!(!handle.is_failed());
}

#[tokio::test]
async fn test_nonzero_exit_is_failure() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let handle = spawner.launch(&shell("dev", "exit 3")).await.unwrap();
    finished(&handle).await;

    assert_eq!(handle.exit_code(), Some(3));
    assert!(handle.is_failed());
}

#[tokio::test]
async fn test_worker_sees_isolation_environment() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let handle = spawner
        .launch(
            &shell(
                "architect",
                "echo \"$CHATI_AGENT|$CHATI_TASK_ID|$CHATI_PARALLEL|$CHATI_WRITE_SCOPE|$CHATI_READ_SCOPE|$CHATI_CONTEXT\"",
            )
            .with_context(serde_json::json!({"phase": "planning"})),
        )
        .await
        .unwrap();
    finished(&handle).await;

    assert_eq!(
        handle.stdout_text().trim(),
        "architect|T1|true|.chati/artifacts/3-Architecture/|*|{\"phase\":\"planning\"}"
    );
}

#[tokio::test]
async fn test_worker_runs_in_project_root() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let handle = spawner.launch(&shell("dev", "pwd")).await.unwrap();
    finished(&handle).await;

    let reported = std::fs::canonicalize(handle.stdout_text().trim()).unwrap();
    assert_eq!(reported, std::fs::canonicalize(project.path()).unwrap());
}

#[tokio::test]
async fn test_missing_role_is_rejected_before_spawning() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let err = spawner.launch(&shell("", "true")).await.unwrap_err();
    assert!(matches!(err, LaunchError::MissingField { field: "role" }));
}

#[tokio::test]
async fn test_spawn_failure_yields_handle_with_minus_one() {
    let project = setup_project();
    let config = SpawnerConfig {
        project_root: project.path().to_path_buf(),
        default_provider: Provider::Shell,
        commands: HashMap::from([(Provider::Shell, "/nonexistent/chati-worker".to_string())]),
        ..Default::default()
    };
    let spawner = Spawner::new(config, Arc::new(WriteScopeTable::default()));

    let handle = spawner.launch(&shell("dev", "true")).await.unwrap();

    assert_eq!(handle.status(), TerminalStatus::Exited);
    assert_eq!(handle.exit_code(), Some(SPAWN_FAILED_EXIT_CODE));
    assert!(handle.stderr_text().contains("failed to spawn"));
    finished(&handle).await;
}

// ============================================================
// Groups and write-scope isolation
// ============================================================

#[tokio::test]
async fn test_disjoint_group_launches_every_request() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let requests = vec![
        shell("architect", "echo a"),
        shell("ux", "echo b"),
        shell("devops", "echo c"),
    ];
    let group = spawner.launch_group(&requests).await.unwrap();

    assert!(group.id.starts_with("group-"));
    assert_eq!(group.handles.len(), 3);
    for handle in &group.handles {
        finished(handle).await;
        assert_eq!(handle.exit_code(), Some(0));
    }
    let roles: Vec<&str> = group.handles.iter().map(|h| h.role.as_str()).collect();
    assert_eq!(roles, vec!["architect", "ux", "devops"]);
}

#[tokio::test]
async fn test_conflicting_group_launches_nothing() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let requests = vec![
        shell("architect", "touch architect-ran"),
        shell("dev", "touch dev-ran"),
        shell("qa-implementation", "touch qa-ran"),
    ];
    let err = spawner.launch_group(&requests).await.unwrap_err();

    let message = err.to_string();
    assert!(message.contains("dev"));
    assert!(message.contains("qa-implementation"));
    assert!(message.contains("test/"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!project.path().join("architect-ran").exists());
    assert!(!project.path().join("dev-ran").exists());
    assert!(!project.path().join("qa-ran").exists());
}

#[tokio::test]
async fn test_request_scope_override_avoids_conflict() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let requests = vec![
        shell("dev", "true").with_write_scope(vec!["src/".into()]),
        shell("qa-implementation", "true"),
    ];
    let group = spawner.launch_group(&requests).await.unwrap();
    assert_eq!(group.handles.len(), 2);
}

// ============================================================
// Timeout and termination
// ============================================================

#[tokio::test]
async fn test_timeout_kills_worker_with_minus_two() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let handle = spawner
        .launch(&shell("dev", "sleep 30").with_timeout(Duration::from_millis(200)))
        .await
        .unwrap();
    finished(&handle).await;

    assert_eq!(handle.status(), TerminalStatus::Exited);
    assert_eq!(handle.exit_code(), Some(TIMEOUT_EXIT_CODE));
    assert!(handle.stderr_text().contains("timed out"));
}

#[tokio::test]
async fn test_large_prompt_does_not_block_launch() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    // The worker sleeps before reading past the first line, so a prompt
    // larger than the pipe buffer stays unread until the timeout fires.
    let mut prompt = String::from("sleep 8\n# ");
    prompt.push_str(&"x".repeat(256 * 1024));
    prompt.push('\n');
    let request = shell("dev", &prompt).with_timeout(Duration::from_millis(500));

    let handle = tokio::time::timeout(Duration::from_secs(3), spawner.launch(&request))
        .await
        .expect("launch should return before the prompt is consumed")
        .unwrap();
    assert!(handle.pid().is_some());

    finished(&handle).await;
    assert_eq!(handle.exit_code(), Some(TIMEOUT_EXIT_CODE));
    assert!(handle.stderr_text().contains("timed out"));
}

#[tokio::test]
async fn test_terminate_is_graceful_and_idempotent() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let handle = spawner.launch(&shell("dev", "sleep 30")).await.unwrap();
    let first = terminate(&handle).await;
    assert!(first.killed);
    assert_eq!(handle.status(), TerminalStatus::Killed);
    assert_eq!(first.exit_code, Some(128 + 15));

    let second = terminate(&handle).await;
    assert!(!second.killed);
    assert_eq!(second.exit_code, first.exit_code);
}

#[tokio::test]
async fn test_terminate_escalates_when_sigterm_is_ignored() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let handle = spawner
        .launch(&shell("dev", "trap '' TERM\nsleep 30"))
        .await
        .unwrap();
    // Let the shell install its trap before signalling.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), terminate(&handle))
        .await
        .expect("forced kill should complete");
    assert!(outcome.killed);
    assert_eq!(outcome.exit_code, Some(128 + 9));
}

#[tokio::test]
async fn test_terminate_after_natural_exit_reports_not_killed() {
    let project = setup_project();
    let spawner = test_spawner(project.path());

    let handle = spawner.launch(&shell("dev", "exit 0")).await.unwrap();
    finished(&handle).await;

    let outcome = terminate(&handle).await;
    assert!(!outcome.killed);
    assert_eq!(outcome.exit_code, Some(0));
}

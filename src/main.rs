use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use chati::cli::{Cli, Commands};
use chati::config;
use chati::orchestration::circuit_breaker::CircuitBreaker;
use chati::orchestration::collector::build_consolidated_handoff;
use chati::orchestration::group_runner::GroupRunner;
use chati::orchestration::spawner::Spawner;
use chati::plan::Plan;

/// Fallback handoff target when neither the CLI nor the plan names one.
const DEFAULT_NEXT_ROLE: &str = "next";

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr so stdout carries only the handoff JSON.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli)?;
    tracing::info!(
        project = %config.project_root.display(),
        provider = %config.default_provider,
        poll_ms = config.poll_interval.as_millis() as u64,
        "Config loaded"
    );

    match cli.command {
        Commands::Run {
            plan, next_role, ..
        } => {
            let plan = Plan::load(&plan, &config.project_root)
                .with_context(|| format!("Failed to load plan {}", plan.display()))?;
            let next_role = next_role
                .or(plan.next_role.clone())
                .unwrap_or_else(|| DEFAULT_NEXT_ROLE.to_string());

            let spawner = Spawner::new(config.spawner_config(), Arc::new(config.write_scopes()));
            let runner = GroupRunner::new(
                spawner,
                config.poll_interval,
                CircuitBreaker::new(config.breaker_config()),
                config.max_attempts,
            );

            let shutdown = runner.shutdown_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received; shutting down workers");
                    shutdown.cancel();
                }
            });

            let report = runner.run_with_retries(&plan.requests, &next_role).await?;
            let handoff = match &report.outcome {
                Some(outcome) => outcome.handoff.clone(),
                None => build_consolidated_handoff(None, &next_role),
            };
            println!("{}", serde_json::to_string_pretty(&handoff)?);

            tracing::info!(
                attempts = report.attempts,
                valid = report.valid,
                breaker = ?report.breaker.state,
                "Run finished"
            );
            if let Some(outcome) = &report.outcome {
                for error in outcome.validation.errors.iter().chain(&outcome.validation.missing) {
                    eprintln!("error: {error}");
                }
            }

            Ok(if report.valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Check { plan, .. } => {
            let plan = Plan::load(&plan, &config.project_root)
                .with_context(|| format!("Failed to load plan {}", plan.display()))?;
            let validation = config.write_scopes().validate(&plan.requests);
            if validation.valid {
                println!("No write scope conflicts across {} workers", plan.requests.len());
                return Ok(ExitCode::SUCCESS);
            }
            for conflict in &validation.conflicts {
                println!(
                    "conflict: {} <-> {} on {}",
                    conflict.role_a, conflict.role_b, conflict.path
                );
            }
            Ok(ExitCode::FAILURE)
        }
        Commands::Scopes { role, .. } => {
            let scopes = config.write_scopes();
            match role {
                Some(role) => {
                    let prefixes = scopes.get(&role);
                    if prefixes.is_empty() {
                        println!("{role}: (no write access)");
                    } else {
                        println!("{role}: {}", prefixes.join(", "));
                    }
                }
                None => {
                    for (role, prefixes) in scopes.entries() {
                        println!("{role}: {}", prefixes.join(", "));
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use switchyard::broker::{ProxyEvents, TargetStatus};
use switchyard::{BrokerProxyService, ProxyConfig, Target};

/// Multi-target job broker proxy for self-hosted CI runners.
#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about)]
struct Args {
    /// Directory containing one credential subdirectory per target
    /// (each with .runner, .credentials and .credentials_rsaparams).
    #[arg(long, env = "SWITCHYARD_RUNNER_DIR")]
    runner_dir: Option<PathBuf>,

    /// Port for the worker-facing server.
    #[arg(long, env = "SWITCHYARD_PORT")]
    port: Option<u16>,
}

/// Logs lifecycle events at the binary level.
struct LogEvents;

impl ProxyEvents for LogEvents {
    fn status_update(&self, statuses: &[TargetStatus]) {
        for status in statuses {
            tracing::debug!(
                target_id = %status.target_id,
                session_active = status.session_active,
                jobs = status.jobs_assigned,
                "Target status"
            );
        }
    }

    fn job_received(&self, target_id: &str, job_id: &str) {
        tracing::info!(target_id = %target_id, job = %job_id, "Job received");
    }

    fn error(&self, target_id: &str, message: &str) {
        tracing::error!(target_id = %target_id, "{}", message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = ProxyConfig::from_env();
    if let Some(dir) = args.runner_dir {
        config.runner_dir = dir;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let targets = discover_targets(&config.runner_dir)?;
    if targets.is_empty() {
        tracing::warn!(
            "No registered targets under {}; workers will idle",
            config.runner_dir.display()
        );
    }

    let service = BrokerProxyService::new(config)?;
    service.set_events(Arc::new(LogEvents));
    for target in targets {
        service.add_target(target);
    }

    service.start().await.context("failed to start broker proxy")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    service.stop().await;
    Ok(())
}

/// Scan the runner directory for target credential subdirectories.
fn discover_targets(runner_dir: &Path) -> anyhow::Result<Vec<Target>> {
    let mut targets = Vec::new();

    let entries = match std::fs::read_dir(runner_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(targets),
        Err(e) => {
            return Err(e).context(format!("cannot read {}", runner_dir.display()));
        }
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() || !path.join(".runner").exists() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        match Target::load(&name, &name, &path) {
            Ok(target) => {
                tracing::info!(target_id = %name, "Loaded target credentials");
                targets.push(target);
            }
            Err(e) => {
                tracing::error!(target_id = %name, "Skipping target with bad credentials: {}", e);
            }
        }
    }

    targets.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(targets)
}

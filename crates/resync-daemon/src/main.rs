//! resync-daemon: keeps project directories in sync with peers.
//!
//! Watches each configured project root, broadcasts local changes to every
//! connected peer and applies theirs.

use anyhow::{Context, Result};
use clap::Parser;
use resync_core::RepositoryProvider;
use resync_daemon::config::{CliArgs, DaemonConfig};
use resync_daemon::{FsRepository, SyncService};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config = DaemonConfig::from_args(args, &cwd)?;

    let filter = if config.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("debug,resync_daemon=debug"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,resync_daemon=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting resync-daemon");
    info!("Channel identity: {}", config.identity);

    let repository = Arc::new(FsRepository::new()?);
    info!("Repository id: {}", repository.repository_id());
    let service = SyncService::new(repository, config.credentials(), config.request_ttl());

    if let Some(listen) = &config.listen {
        let addr = service.listen(listen).await?;
        info!("Accepting peers on ws://{}", addr);
    }

    for project in &config.projects {
        match service.add_project(&project.id, &project.root).await {
            Ok(true) => {}
            Ok(false) => error!("Project {} is already registered", project.id),
            Err(e) => error!("Failed to add project {}: {}", project.id, e),
        }
    }
    if service.repository().project_ids().is_empty() {
        info!("No projects configured; only relaying announcements");
    }

    for peer in &config.peers {
        service.connect(peer);
    }

    let mut stats_interval = tokio::time::interval(STATS_INTERVAL);
    stats_interval.tick().await;

    info!("Daemon running. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = stats_interval.tick() => {
                debug!(
                    "{} connection(s), stats: {:?}",
                    service.connector().connection_count(),
                    service.stats()
                );
            }
        }
    }

    drop(service);
    Ok(())
}

//! Command implementations for the topics daemon.
//!
//! Handles:
//! - start: load config, open storage, tick the epoch/reconcile loop
//! - one-shot commands against a `TopicsWorker`
//! - admin: storage statistics and compaction

use std::fs;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use topics_engine::TopicsWorker;
use topics_storage::{Storage, TopicsTable};
use topics_types::{EpochId, Settings, Topic};

use crate::cli::{AdminCommands, Cli, Commands};

/// Load configuration and apply CLI overrides (highest precedence).
pub fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings =
        Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(log_level) = &cli.log_level {
        settings.log_level = log_level.clone();
    }
    if let Some(db_path) = &cli.db_path {
        settings.db_path = db_path.clone();
    }
    match &cli.command {
        Commands::Start {
            tick_interval_secs,
            installed_apps,
        } => {
            if let Some(secs) = tick_interval_secs {
                settings.daemon.tick_interval_secs = *secs;
            }
            if let Some(path) = installed_apps {
                settings.daemon.installed_apps_path = Some(path.clone());
            }
        }
        Commands::Reconcile {
            installed_apps: Some(path),
        } => {
            settings.daemon.installed_apps_path = Some(path.clone());
        }
        _ => {}
    }

    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

fn init_logging(settings: &Settings) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Open storage and build a worker with a loaded cache.
pub fn open_worker(settings: &Settings) -> Result<TopicsWorker> {
    let db_path = settings.expanded_db_path();
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let worker = TopicsWorker::open(settings).context("Failed to open topics worker")?;
    worker.load_cache().context("Failed to load topic cache")?;
    Ok(worker)
}

/// Entry point for the binary: configure, then run one command.
pub async fn dispatch(cli: Cli) -> Result<()> {
    let settings = load_settings(&cli)?;
    init_logging(&settings)?;

    match cli.command {
        Commands::Start { .. } => start_daemon(settings).await,
        Commands::Admin { command } => {
            println!("{}", handle_admin(&settings, command)?);
            Ok(())
        }
        command => {
            let worker = open_worker(&settings)?;
            println!("{}", run_command(&worker, &settings, &command)?);
            Ok(())
        }
    }
}

fn format_topics(topics: &[Topic]) -> String {
    if topics.is_empty() {
        return "No topics".to_string();
    }
    topics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn topic_arg(
    settings: &Settings,
    topic_id: i32,
    taxonomy_version: Option<i64>,
    model_version: Option<i64>,
) -> Topic {
    Topic::new(
        topic_id,
        taxonomy_version.unwrap_or(settings.classifier.taxonomy_version),
        model_version.unwrap_or(settings.classifier.model_version),
    )
}

/// Run a one-shot command and return its printable output.
pub fn run_command(worker: &TopicsWorker, settings: &Settings, command: &Commands) -> Result<String> {
    let output = match command {
        Commands::ComputeEpoch => {
            let stats = worker.compute_epoch().context("Epoch computation failed")?;
            serde_json::to_string_pretty(&stats)?
        }
        Commands::RecordUsage { app, sdk } => {
            worker
                .record_usage(app, sdk)
                .context("Failed to record usage")?;
            format!(
                "Recorded usage for {} in epoch {}",
                caller_label(app, sdk),
                worker.current_epoch()?
            )
        }
        Commands::GetTopics { app, sdk } => {
            format_topics(&worker.get_topics(app, sdk).context("Failed to get topics")?)
        }
        Commands::KnownTopics => format_topics(&worker.get_known_topics_with_consent()?),
        Commands::BlockedTopics => format_topics(&worker.get_topics_with_revoked_consent()?),
        Commands::Block {
            topic,
            taxonomy_version,
            model_version,
        } => {
            let topic = topic_arg(settings, *topic, *taxonomy_version, *model_version);
            worker
                .revoke_consent_for_topic(&topic)
                .context("Failed to block topic")?;
            format!("Blocked topic {}", topic)
        }
        Commands::Unblock {
            topic,
            taxonomy_version,
            model_version,
        } => {
            let topic = topic_arg(settings, *topic, *taxonomy_version, *model_version);
            worker
                .restore_consent_for_topic(&topic)
                .context("Failed to unblock topic")?;
            format!("Unblocked topic {}", topic)
        }
        Commands::Reconcile { .. } => {
            if settings.daemon.installed_apps_path.is_none() {
                anyhow::bail!("Reconcile needs an installed apps list (--installed-apps)");
            }
            worker
                .reconcile_application_update()
                .context("Reconciliation failed")?;
            "Reconciled installed apps".to_string()
        }
        Commands::Install { app } => {
            let assigned = worker
                .handle_app_installation(app)
                .context("Failed to handle installation")?;
            format!("Assigned topics for {} epoch(s) to {}", assigned, app)
        }
        Commands::Uninstall { app } => {
            worker
                .handle_app_uninstallation(app)
                .context("Failed to handle uninstallation")?;
            format!("Removed topics data of {}", app)
        }
        Commands::Clear { exclude } => {
            let excluded = exclude
                .iter()
                .map(|name| {
                    TopicsTable::from_str(name).with_context(|| format!("Unknown table: {}", name))
                })
                .collect::<Result<Vec<_>>>()?;
            worker
                .clear_all_topics_data(&excluded)
                .context("Failed to clear topics data")?;
            format!("Cleared topics data ({} table(s) kept)", excluded.len())
        }
        Commands::Status => serde_json::to_string_pretty(&worker.status()?)?,
        Commands::Start { .. } | Commands::Admin { .. } => {
            anyhow::bail!("{:?} does not run as a one-shot command", command)
        }
    };
    Ok(output)
}

fn caller_label(app: &str, sdk: &str) -> String {
    if sdk.is_empty() {
        app.to_string()
    } else {
        format!("{} ({})", app, sdk)
    }
}

/// Handle admin commands directly against storage.
pub fn handle_admin(settings: &Settings, command: AdminCommands) -> Result<String> {
    let db_path = settings.expanded_db_path();
    let storage = Storage::open(&db_path).context("Failed to open storage")?;

    match command {
        AdminCommands::Stats => {
            let stats = storage.get_stats().context("Failed to read stats")?;
            let mut lines = vec![format!("Database: {}", db_path.display())];
            for (cf, rows) in &stats.row_counts {
                lines.push(format!("  {:<28} {}", cf, rows));
            }
            lines.push(format!("Disk usage: {} bytes", stats.disk_usage_bytes));
            Ok(lines.join("\n"))
        }
        AdminCommands::Compact { cf } => {
            match &cf {
                Some(cf) => storage.compact_cf(cf).context("Compaction failed")?,
                None => storage.compact().context("Compaction failed")?,
            }
            Ok(format!(
                "Compacted {}",
                cf.as_deref().unwrap_or("all column families")
            ))
        }
    }
}

/// One loop iteration: compute when the epoch moved, then reconcile.
///
/// Returns the epoch that is now computed.
pub fn run_tick(
    worker: &TopicsWorker,
    last_computed: Option<EpochId>,
    reconcile: bool,
) -> Result<EpochId> {
    let current = worker.current_epoch()?;
    if last_computed != Some(current) {
        let stats = worker.compute_epoch().context("Epoch computation failed")?;
        info!(
            epoch = current,
            returned = stats.returned_topics_count,
            "Computed epoch"
        );
    }
    if reconcile {
        worker
            .reconcile_application_update()
            .context("Reconciliation failed")?;
    }
    Ok(current)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Run the daemon loop.
///
/// 1. Open storage and load the cache
/// 2. Every tick, compute the finished epoch once and reconcile installs
/// 3. Flush and exit on SIGINT/SIGTERM
pub async fn start_daemon(settings: Settings) -> Result<()> {
    info!("Topics daemon starting...");
    info!("Configuration:");
    info!("  Database path: {}", settings.db_path);
    info!("  Epoch period: {} ms", settings.engine.epoch_period_ms);
    info!("  Tick interval: {} s", settings.daemon.tick_interval_secs);
    info!("  Log level: {}", settings.log_level);

    let reconcile = settings.daemon.installed_apps_path.is_some();
    if !reconcile {
        warn!("No installed apps list configured, install reconciliation disabled");
    }

    let worker = Arc::new(open_worker(&settings)?);
    let mut interval =
        tokio::time::interval(Duration::from_secs(settings.daemon.tick_interval_secs));
    let mut last_computed = None;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                let tick_worker = worker.clone();
                let previous = last_computed;
                let result = tokio::task::spawn_blocking(move || {
                    run_tick(&tick_worker, previous, reconcile)
                })
                .await;
                match result {
                    Ok(Ok(epoch)) => last_computed = Some(epoch),
                    Ok(Err(e)) => warn!("Tick failed: {:#}", e),
                    Err(e) => warn!("Tick task failed: {}", e),
                }
            }
        }
    }

    worker.storage().flush().context("Failed to flush storage")?;
    info!("Topics daemon stopped");
    Ok(())
}

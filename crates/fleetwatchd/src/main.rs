//! fleetwatchd - fleet agent update daemon
//!
//! Validates the previous self-update, then keeps the agent current
//! according to its effective update policy. Server commands arrive as
//! newline-delimited JSON on stdin; progress goes out on stdout. Logs go to
//! stderr.

use anyhow::{Context, Result};
use clap::Parser;
use fleetwatch_common::AGENT_VERSION;
use fleetwatchd::config::Config;
use fleetwatchd::dispatcher::CommandDispatcher;
use fleetwatchd::disk::SystemDiskSpace;
use fleetwatchd::exclusion::FailedVersionLedger;
use fleetwatchd::health::DataDirProbe;
use fleetwatchd::installer::BinaryInstaller;
use fleetwatchd::manager::{ManagerOptions, UpdateManager};
use fleetwatchd::marker::MarkerStore;
use fleetwatchd::policy_store::PolicyStore;
use fleetwatchd::progress::{LogObserver, ProgressHub};
use fleetwatchd::restart::{request_service_restart, RestartExit};
use fleetwatchd::server_client::ServerClient;
use fleetwatchd::source::{UnconfiguredSource, VersionQuery, VersionSource};
use fleetwatchd::telemetry::{TelemetryReporter, TelemetrySink};
use fleetwatchd::transport::{serve_lines, LineSink};
use fleetwatchd::validator::PostUpdateValidation;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetwatchd")]
#[command(about = "Fleet agent update daemon", long_about = None)]
#[command(version = AGENT_VERSION)]
struct Cli {
    /// Config file (default: /etc/fleetwatch/agent.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override agent.data_dir
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "fleetwatchd=trace"
    #[arg(long)]
    log_level: Option<String>,

    /// Run post-update validation and exit
    #[arg(long)]
    validate_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("[BOOT] fleetwatchd v{} starting...", AGENT_VERSION);

    let config_path = cli.config.clone();
    let mut config = Config::load(config_path.as_deref());
    if let Some(dir) = &cli.data_dir {
        config.agent.data_dir = dir.clone();
    }

    let autoupdate_dir = config.autoupdate_dir();
    std::fs::create_dir_all(&autoupdate_dir)
        .with_context(|| format!("Failed to create {}", autoupdate_dir.display()))?;

    let agent_id = config.load_or_create_agent_id()?;
    info!(
        "[BOOT] Agent {} on {} {}/{}",
        agent_id, config.agent.channel, config.agent.platform, config.agent.arch
    );

    let policy = Arc::new(PolicyStore::new(config.override_mode(), config.local_policy()));

    let client = match &config.agent.server_url {
        Some(url) if !url.trim().is_empty() => Some(Arc::new(
            ServerClient::new(
                url,
                config.agent.api_token.clone(),
                config.update.request_timeout(),
                autoupdate_dir.join("downloads"),
            )
            .context("Failed to build fleet server client")?,
        )),
        _ => {
            warn!("[BOOT] No server_url configured, update checks will fail");
            None
        }
    };
    let source: Arc<dyn VersionSource> = match &client {
        Some(client) => client.clone(),
        None => Arc::new(UnconfiguredSource),
    };
    let telemetry_sink = client
        .clone()
        .map(|client| client as Arc<dyn TelemetrySink>);

    let progress = Arc::new(ProgressHub::new(config.update.progress_buffer));
    progress.register(Arc::new(LogObserver));

    let manager = Arc::new(UpdateManager::new(ManagerOptions {
        current_version: AGENT_VERSION.to_string(),
        query: VersionQuery {
            agent_id: agent_id.clone(),
            channel: config.agent.channel.clone(),
            platform: config.agent.platform.clone(),
            arch: config.agent.arch.clone(),
        },
        policy: policy.clone(),
        source,
        installer: Arc::new(BinaryInstaller::new(
            config.binary_path()?,
            autoupdate_dir.join("backups"),
            AGENT_VERSION,
        )),
        markers: MarkerStore::new(&autoupdate_dir),
        ledger: Arc::new(FailedVersionLedger::open(
            &autoupdate_dir,
            config.update.cooldown(),
        )),
        health: Arc::new(DataDirProbe::new(config.agent.data_dir.clone())),
        disk: Arc::new(SystemDiskSpace::new(autoupdate_dir.clone())),
        min_disk_space_mb: config.update.min_disk_space_mb,
        telemetry: TelemetryReporter::new(agent_id, telemetry_sink),
        progress: progress.clone(),
    }));

    if cli.validate_only {
        let result = manager.validate_post_update().await?;
        info!("Post-update validation: {:?}", result);
        let ok = matches!(
            result,
            PostUpdateValidation::NotUpdated | PostUpdateValidation::Succeeded { .. }
        );
        std::process::exit(if ok { 0 } else { 1 });
    }

    let shutdown = CancellationToken::new();
    let forwarder = progress.spawn_forwarder(Arc::new(LineSink::stdout()), shutdown.clone());

    let dispatcher = CommandDispatcher::new(manager.clone(), policy.clone());
    let transport_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_lines(tokio::io::stdin(), dispatcher, transport_shutdown).await {
            error!("Server channel failed: {}", e);
        }
    });

    spawn_sighup_handler(policy.clone(), config_path);

    let update_loop = tokio::spawn(
        manager
            .clone()
            .run(Some(policy.subscribe()), shutdown.clone()),
    );

    info!("[READY] fleetwatchd operational");

    let mut restart_rx = manager.restart_requests();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    let restart = tokio::select! {
        changed = restart_rx.changed() => changed.is_ok(),
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
            false
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            false
        }
    };

    shutdown.cancel();

    if !restart && !manager.wait_for_install_to_settle(config.update.shutdown_grace()).await {
        warn!("Install still running after shutdown grace period");
    }
    let _ = update_loop.await;
    let _ = forwarder.await;

    // An install may have completed during the grace period.
    let pending = restart_rx.borrow().clone();
    if let Some(request) = pending {
        info!(
            "Restarting to switch from {} to {}",
            request.from_version, request.to_version
        );
        let exit = request_service_restart(&config.agent.service_name).await;
        if exit != RestartExit::Clean {
            warn!("Exiting with status {} so the supervisor restarts us", exit.code());
        }
        std::process::exit(exit.code());
    }

    info!("Shutting down gracefully");
    Ok(())
}

/// Reload the local policy section of the config on SIGHUP.
fn spawn_sighup_handler(policy: Arc<PolicyStore>, config_path: Option<PathBuf>) {
    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGHUP handler: {}", e);
                return;
            }
        };

        info!("SIGHUP handler registered - listening for reload signals");

        while sighup.recv().await.is_some() {
            info!("SIGHUP received - reloading update policy");
            let config = Config::load(config_path.as_deref());
            policy.set_local(config.override_mode(), config.local_policy());
        }
    });
}

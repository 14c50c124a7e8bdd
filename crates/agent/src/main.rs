//! cage-monitor agent
//!
//! Watches one container with both the poll and the event pipeline, and
//! serves health and metrics over HTTP.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use monitor_lib::{
    control::{ContainerControl, FirewalldControl, IncusConfig, IncusControl},
    exec::{CommandRunner, SystemRunner},
    format::{format_snapshot, format_threat_alert},
    health::components,
    netmon::{JournalctlSource, NftInvocation, RuleCleaner},
    read_audit_log,
    tables::ThreatTables,
    AuditEntry, AuditLog, Daemon, HealthRegistry, MonitorCallbacks, NetMonitor,
    NetMonitorHandle, Responder, StructuredLogger,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "cage-monitor")]
#[command(author, version, about = "Security monitor for a single container", long_about = None)]
struct Cli {
    /// Config file (TOML, YAML or JSON)
    #[arg(long, short, env = "CAGE_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor the configured container (default)
    Run,

    /// Print an audit log as a human-readable report
    Audit {
        /// Path to the JSONL audit log
        path: PathBuf,

        /// Only print threats, skip the latest snapshot
        #[arg(long)]
        threats_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            tracing_subscriber::registry()
                .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
                .with(fmt::layer().json())
                .init();

            let config = config::AgentConfig::load(cli.config)?;
            run(config).await
        }
        Commands::Audit { path, threats_only } => print_audit(path, threats_only),
    }
}

fn print_audit(path: PathBuf, threats_only: bool) -> Result<()> {
    let entries = read_audit_log(&path)
        .with_context(|| format!("failed to read audit log {}", path.display()))?;

    let mut latest = None;
    for entry in entries {
        match entry {
            AuditEntry::Threat(threat) => print!("{}", format_threat_alert(&threat)),
            AuditEntry::Snapshot(snapshot) => latest = Some(snapshot),
            AuditEntry::Other(_) => {}
        }
    }

    if !threats_only {
        match latest {
            Some(snapshot) => println!("\n{}", format_snapshot(&snapshot)),
            None => println!("\nNo snapshots recorded"),
        }
    }
    Ok(())
}

async fn run(config: config::AgentConfig) -> Result<()> {
    let logger = StructuredLogger::new(config.container_name.clone());
    logger.log_startup("agent", AGENT_VERSION);

    let health = HealthRegistry::new();

    let audit_log = Arc::new(AuditLog::open(&config.audit_log_path).with_context(|| {
        format!("failed to open audit log {}", config.audit_log_path.display())
    })?);
    health.set_healthy(components::AUDIT_LOG).await;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let control: Arc<dyn ContainerControl> = Arc::new(IncusControl::with_runner(
        IncusConfig::default(),
        runner.clone(),
    ));
    let tables = Arc::new(ThreatTables::default());

    let callbacks = MonitorCallbacks::new()
        .on_threat(|threat| eprint!("{}", format_threat_alert(threat)))
        .on_action(|action, message| info!(action = %action, "{}", message))
        .on_error(|e| warn!(error = %e, "Monitor error"));

    let responder = Arc::new(
        Responder::new(config.responder_config(), control.clone())
            .with_audit_log(audit_log.clone())
            .with_firewall(Arc::new(FirewalldControl::with_runner(runner.clone())))
            .with_rule_cleaner(Arc::new(RuleCleaner::new(
                runner.clone(),
                NftInvocation::default(),
            )))
            .with_callbacks(callbacks),
    );
    health.set_healthy(components::RESPONDER).await;

    let mut daemon = Daemon::builder()
        .config(config.daemon_config())
        .control(control)
        .responder(responder.clone())
        .audit_log(audit_log)
        .tables(tables.clone())
        .health(health.clone())
        .build()?
        .start()
        .await?;
    info!(container_ip = ?daemon.container_ip(), "Poll pipeline running");

    let net_monitor = start_net_monitor(
        &config,
        daemon.container_ip(),
        runner,
        tables,
        responder,
        &health,
    )
    .await;

    let app_state = Arc::new(api::AppState::new(health.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health.set_ready(true).await;

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            "SIGINT received"
        }
        _ = daemon.stopped() => "poll pipeline exited",
    };
    info!(reason, "Shutting down");
    health.set_ready(false).await;

    if let Some(handle) = net_monitor {
        if let Err(e) = handle.stop().await {
            error!(error = %e, "Event pipeline did not stop cleanly");
        }
    }
    if let Err(e) = daemon.stop().await {
        error!(error = %e, "Poll pipeline did not stop cleanly");
    }
    api_handle.abort();

    logger.log_shutdown("agent", reason);
    Ok(())
}

/// Event pipeline is best effort: the poll pipeline keeps running without it
async fn start_net_monitor(
    config: &config::AgentConfig,
    container_ip: Option<std::net::IpAddr>,
    runner: Arc<dyn CommandRunner>,
    tables: Arc<ThreatTables>,
    responder: Arc<Responder>,
    health: &HealthRegistry,
) -> Option<NetMonitorHandle> {
    if !config.network_monitoring {
        return None;
    }
    let Some(ip) = container_ip else {
        warn!("Container IP unknown, network monitoring disabled");
        health
            .set_degraded(components::LOG_READER, "container IP unknown")
            .await;
        return None;
    };

    let monitor = NetMonitor::new(
        config.net_monitor_config(ip),
        runner,
        Arc::new(JournalctlSource::new()),
        responder,
    )
    .with_tables(tables)
    .with_health(health.clone());

    match monitor.start().await {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Network monitoring unavailable");
            health
                .set_degraded(components::LOG_READER, e.to_string())
                .await;
            None
        }
    }
}

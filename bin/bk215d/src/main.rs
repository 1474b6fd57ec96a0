//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the BK215 link daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bk215_common::config::AppConfig;
use bk215_common::logging::init_tracing;
use bk215_core::{
    DeviceLink, LinkConfig, LinkHandle, MemoryRegistry, Projection, StateRegistry,
};
use bk215_metrics::{new_registry, spawn_http_server, DaemonMetrics, LinkMetrics};
use bk215_protocol::{check_writable, WRITABLE_FIELDS};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

const SERVICE_NAME: &str = "bk215d";

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("BK215 link ", env!("CARGO_PKG_VERSION")),
    about = "BK215 local-link daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "HOST", help = "Override device.host from the configuration")]
    host: Option<String>,

    #[arg(long, help = "Refuse all writes regardless of configuration")]
    read_only: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Keep the device link running until interrupted")]
    Run,
    #[command(about = "Write one field and wait for the device acknowledgement")]
    Set {
        #[arg(help = "Field id (t363) or name (system_charge_limit)")]
        field: String,
        #[arg(allow_negative_numbers = true)]
        value: i64,
    },
    #[command(about = "List writable fields and their ranges")]
    Fields,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Fields) = &cli.command {
        print_writable_fields();
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/bk215.toml"));
    candidates.push(PathBuf::from("/etc/bk215/bk215.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_unvalidated(&candidates)?;
    let mut config = loaded.config;
    if let Some(host) = cli.host {
        config.device.host = host.trim().to_owned();
    }
    if cli.read_only {
        config.device.read_only = true;
    }
    config
        .validate()
        .with_context(|| format!("invalid configuration {}", loaded.source.display()))?;
    let load_duration = load_started.elapsed();

    init_tracing(SERVICE_NAME, &config.logging)?;
    info!(config_path = %loaded.source.display(), host = %config.device.host, "configuration loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, load_duration).await,
        Commands::Set { field, value } => set_field(config, &field, value).await,
        Commands::Fields => Ok(()),
    }
}

async fn run_daemon(config: AppConfig, load_duration: Duration) -> Result<()> {
    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
    );
    let link_metrics = LinkMetrics::new(metrics_registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(metrics_registry, config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let registry = LoggedRegistry::default();
    let handle = DeviceLink::new(LinkConfig::from(&config.device), Arc::new(registry.clone()))
        .with_metrics(link_metrics)
        .start();

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await?;

    let state = registry.inner.state();
    match serde_json::to_string(&state) {
        Ok(json) => info!(state = %json, "final device state"),
        Err(err) => warn!(error = %err, "failed to serialise final device state"),
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn set_field(config: AppConfig, key: &str, value: i64) -> Result<()> {
    let entry = check_writable(key, value)?;
    let link_config = LinkConfig::from(&config.device);
    let connect_budget = link_config.timeout + Duration::from_secs(1);
    let handle = DeviceLink::new(link_config, Arc::new(MemoryRegistry::new())).start();

    let outcome = async {
        wait_for_connection(&handle, connect_budget).await?;
        handle
            .set_field(entry.field, value)
            .await
            .with_context(|| format!("failed to write {} ({})", entry.name, entry.field))
    }
    .await;
    handle.shutdown().await?;
    outcome?;

    info!(field = entry.field, name = entry.name, value, "field written");
    println!("{} ({}) = {}", entry.name, entry.field, value);
    Ok(())
}

async fn wait_for_connection(handle: &LinkHandle, budget: Duration) -> Result<()> {
    let started = Instant::now();
    while !handle.is_connected() {
        if started.elapsed() > budget {
            return Err(anyhow!(
                "device {}:{} not reachable within {:?}",
                handle.config().host,
                handle.config().port,
                budget
            ));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

fn print_writable_fields() {
    println!("{:<8} {:<28} {:>6} {:>6}", "FIELD", "NAME", "MIN", "MAX");
    for entry in WRITABLE_FIELDS {
        println!(
            "{:<8} {:<28} {:>6} {:>6}",
            entry.field,
            entry.name,
            entry.range.start(),
            entry.range.end()
        );
    }
}

/// Memory registry that also logs what it receives.
#[derive(Clone, Default)]
struct LoggedRegistry {
    inner: MemoryRegistry,
}

#[async_trait]
impl StateRegistry for LoggedRegistry {
    async fn apply_snapshot(&self, projection: &Projection) -> Result<()> {
        for (field, value) in projection {
            info!(%field, value, "device value");
        }
        self.inner.apply_snapshot(projection).await
    }

    async fn set_connection(&self, connected: bool) -> Result<()> {
        info!(connected, "device connection changed");
        self.inner.set_connection(connected).await
    }

    async fn record_error(&self, message: &str) -> Result<()> {
        warn!(error = %message, "device link error");
        self.inner.record_error(message).await
    }

    async fn record_update(&self, at: DateTime<Utc>) -> Result<()> {
        self.inner.record_update(at).await
    }
}

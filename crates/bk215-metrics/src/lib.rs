//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address; differs from the requested one when port 0 was used.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "bk215d_starts_total",
            "Total number of times the BK215 daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 12)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "bk215d_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new("bk215d_build_info", "Build metadata for the running daemon"),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

/// Counters and gauges describing one device link.
#[derive(Clone, Debug)]
pub struct LinkMetrics {
    connects: IntCounter,
    disconnects: IntCounter,
    transport_errors: IntCounter,
    reconnects_scheduled: IntCounter,
    reconnect_delay: Gauge,
    connected: IntGauge,
    messages: IntCounterVec,
    commands: IntCounterVec,
    snapshots_applied: IntCounter,
}

impl LinkMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let connects = IntCounter::with_opts(Opts::new(
            "bk215_link_connects_total",
            "Successful TCP connections to the device",
        ))?;
        registry.register(Box::new(connects.clone()))?;

        let disconnects = IntCounter::with_opts(Opts::new(
            "bk215_link_disconnects_total",
            "Connection close events, including failed attempts",
        ))?;
        registry.register(Box::new(disconnects.clone()))?;

        let transport_errors = IntCounter::with_opts(Opts::new(
            "bk215_link_transport_errors_total",
            "Connect failures, socket errors and idle watchdog trips",
        ))?;
        registry.register(Box::new(transport_errors.clone()))?;

        let reconnects_scheduled = IntCounter::with_opts(Opts::new(
            "bk215_link_reconnects_scheduled_total",
            "Reconnect timers armed after a close",
        ))?;
        registry.register(Box::new(reconnects_scheduled.clone()))?;

        let reconnect_delay = Gauge::with_opts(Opts::new(
            "bk215_link_reconnect_delay_seconds",
            "Delay of the most recently scheduled reconnect",
        ))?;
        registry.register(Box::new(reconnect_delay.clone()))?;

        let connected = IntGauge::with_opts(Opts::new(
            "bk215_link_connected",
            "Indicator (0/1) whether the device socket is established",
        ))?;
        registry.register(Box::new(connected.clone()))?;

        let messages = IntCounterVec::new(
            Opts::new(
                "bk215_link_messages_total",
                "Inbound device messages by classification",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(messages.clone()))?;

        let commands = IntCounterVec::new(
            Opts::new(
                "bk215_link_commands_total",
                "Set commands by final outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(commands.clone()))?;

        let snapshots_applied = IntCounter::with_opts(Opts::new(
            "bk215_link_snapshots_applied_total",
            "Projections handed to the state registry",
        ))?;
        registry.register(Box::new(snapshots_applied.clone()))?;

        Ok(Self {
            connects,
            disconnects,
            transport_errors,
            reconnects_scheduled,
            reconnect_delay,
            connected,
            messages,
            commands,
            snapshots_applied,
        })
    }

    pub fn record_connected(&self) {
        self.connects.inc();
        self.connected.set(1);
    }

    pub fn record_closed(&self) {
        self.disconnects.inc();
        self.connected.set(0);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.inc();
    }

    pub fn record_reconnect_scheduled(&self, delay: Duration) {
        self.reconnects_scheduled.inc();
        self.reconnect_delay.set(delay.as_secs_f64());
    }

    pub fn record_message(&self, kind: &str) {
        self.messages.with_label_values(&[kind]).inc();
    }

    pub fn record_command(&self, outcome: &str) {
        self.commands.with_label_values(&[outcome]).inc();
    }

    pub fn record_snapshot_applied(&self) {
        self.snapshots_applied.inc();
    }
}

pub use prometheus;

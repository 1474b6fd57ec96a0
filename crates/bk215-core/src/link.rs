//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bk215_common::config::DeviceConfig;
use bk215_metrics::LinkMetrics;
use bk215_protocol::{DeviceMessage, MessageKind};
use bk215_session::{
    BackoffPolicy, ConnectionState, DeviceSession, ReconnectBackoff, SessionError, SessionEvent,
    SessionEvents, WatchdogSettings,
};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::correlator::{CommandCorrelator, CommandError, PendingCommand};
use crate::registry::StateRegistry;
use crate::report_cache::{Projection, ReportCache, ThrottleMode};

/// Device port used when none is configured.
pub const DEFAULT_PORT: u16 = 8000;
/// Connect and command acknowledgement budget used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Runtime settings of one device link, already validated and clamped.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    /// Connect budget and per-command acknowledgement deadline.
    pub timeout: Duration,
    /// Zero selects immediate projection.
    pub update_interval: Duration,
    pub read_only: bool,
    /// Log every inbound message as raw JSON.
    pub debug_raw: bool,
    pub watchdog: Option<WatchdogSettings>,
    pub backoff: BackoffPolicy,
}

impl LinkConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            update_interval: Duration::ZERO,
            read_only: false,
            debug_raw: false,
            watchdog: Some(WatchdogSettings::default()),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn throttle_mode(&self) -> ThrottleMode {
        ThrottleMode::from_interval(self.update_interval)
    }
}

impl From<&DeviceConfig> for LinkConfig {
    fn from(device: &DeviceConfig) -> Self {
        let watchdog = device.watchdog.enabled.then(|| WatchdogSettings {
            check_interval: device.watchdog.check_interval,
            floor: device.watchdog.floor,
            margin: device.watchdog.margin,
        });
        Self {
            host: device.host.trim().to_owned(),
            port: device.port(),
            timeout: device.timeout(),
            update_interval: device.update_interval,
            read_only: device.read_only,
            debug_raw: device.debug_raw,
            watchdog,
            backoff: BackoffPolicy::new(
                device.backoff.base,
                device.backoff.factor,
                device.backoff.cap,
            ),
        }
    }
}

/// Builder for a running link.
pub struct DeviceLink {
    config: LinkConfig,
    registry: Arc<dyn StateRegistry>,
    metrics: Option<LinkMetrics>,
}

impl DeviceLink {
    pub fn new(config: LinkConfig, registry: Arc<dyn StateRegistry>) -> Self {
        Self {
            config,
            registry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: LinkMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawn the event loop and start the first connection attempt.
    pub fn start(self) -> LinkHandle {
        let config = Arc::new(self.config);
        let (session, events) = DeviceSession::new(config.watchdog);
        let correlator = CommandCorrelator::new();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!(
            host = %config.host,
            port = config.port,
            timeout_ms = config.timeout.as_millis() as u64,
            update_interval_secs = config.update_interval.as_secs(),
            read_only = config.read_only,
            "device link starting"
        );

        let worker = LinkWorker {
            config: config.clone(),
            session: session.clone(),
            correlator: correlator.clone(),
            registry: self.registry,
            metrics: self.metrics.clone(),
            backoff: ReconnectBackoff::new(config.backoff),
            cache: ReportCache::new(config.throttle_mode()),
        };
        let task = tokio::spawn(worker.run(events, shutdown_rx));

        LinkHandle {
            config,
            session,
            correlator,
            metrics: self.metrics,
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Control surface of a running link.
#[derive(Debug)]
pub struct LinkHandle {
    config: Arc<LinkConfig>,
    session: DeviceSession,
    correlator: CommandCorrelator,
    metrics: Option<LinkMetrics>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.correlator.pending()
    }

    /// Write one field and wait for the device to acknowledge it.
    pub async fn set_field(
        &self,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<(), CommandError> {
        let outcome = self.try_set_field(field, value.into()).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_command(match &outcome {
                Ok(()) => "ok",
                Err(err) => err.outcome(),
            });
        }
        outcome
    }

    async fn try_set_field(&self, field: &str, value: Value) -> Result<(), CommandError> {
        if self.config.read_only {
            warn!(field, "write refused; link is read-only");
            return Err(CommandError::ReadOnly {
                field: field.to_owned(),
            });
        }
        if !self.session.is_connected() {
            return Err(CommandError::NotConnected);
        }
        info!(field, %value, "writing device field");
        self.correlator
            .issue(&self.session, field, value, self.config.timeout)
            .await
    }

    /// Stop the link: fail pending commands, close the socket and join the loop.
    pub async fn shutdown(mut self) -> Result<()> {
        self.session.destroy();
        self.correlator.fail_all("link shutting down");
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await?;
        info!(host = %self.config.host, "device link stopped");
        Ok(())
    }
}

struct LinkWorker {
    config: Arc<LinkConfig>,
    session: DeviceSession,
    correlator: CommandCorrelator,
    registry: Arc<dyn StateRegistry>,
    metrics: Option<LinkMetrics>,
    backoff: ReconnectBackoff,
    cache: ReportCache,
}

impl LinkWorker {
    async fn run(mut self, mut events: SessionEvents, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = self.cache.mode().interval().map(|period| {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        self.session
            .connect(&self.config.host, self.config.port, self.config.timeout);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("link shutdown signal received");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tick(&mut ticker) => {
                    if let Some(projection) = self.cache.flush() {
                        self.apply(projection).await;
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => self.on_connected().await,
            SessionEvent::Closed => self.on_closed().await,
            SessionEvent::Error(err) => self.on_error(err).await,
            SessionEvent::Message(message) => self.on_message(message).await,
        }
    }

    async fn on_connected(&mut self) {
        self.backoff.reset();
        if let Some(metrics) = &self.metrics {
            metrics.record_connected();
        }
        if let Err(err) = self.registry.set_connection(true).await {
            warn!(error = %err, "failed to publish connection state");
        }
    }

    async fn on_closed(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_closed();
        }
        if let Err(err) = self.registry.set_connection(false).await {
            warn!(error = %err, "failed to publish connection state");
        }
        self.correlator.fail_all("connection closed");

        let delay = self.backoff.next_delay();
        self.session.schedule_reconnect(
            &self.config.host,
            self.config.port,
            self.config.timeout,
            delay,
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_reconnect_scheduled(delay);
        }
    }

    async fn on_error(&mut self, err: SessionError) {
        warn!(host = %self.config.host, error = %err, "device transport error");
        if let Some(metrics) = &self.metrics {
            metrics.record_transport_error();
        }
        if let Err(publish_err) = self.registry.record_error(&err.to_string()).await {
            warn!(error = %publish_err, "failed to publish transport error");
        }
    }

    async fn on_message(&mut self, message: DeviceMessage) {
        if self.config.debug_raw {
            match serde_json::to_string(&message) {
                Ok(raw) => info!(%raw, "device message"),
                Err(err) => warn!(error = %err, "failed to render device message"),
            }
        }
        let kind = message.kind();
        if let Some(metrics) = &self.metrics {
            metrics.record_message(kind.as_str());
        }

        match kind {
            MessageKind::Acknowledgement if message.is_handshake_ack() => {
                debug!("handshake acknowledged");
            }
            MessageKind::Acknowledgement => {
                self.correlator.handle_ack(&message.data);
            }
            MessageKind::DataReport => {
                if let Some(projection) = self.cache.on_report(&message.data) {
                    self.apply(projection).await;
                }
                if let Err(err) = self.registry.record_update(Utc::now()).await {
                    warn!(error = %err, "failed to publish update time");
                }
            }
            MessageKind::Unknown => {
                debug!(code = message.code, "ignoring message with unknown code");
            }
        }
    }

    async fn apply(&self, projection: Projection) {
        if projection.is_empty() {
            return;
        }
        match self.registry.apply_snapshot(&projection).await {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_snapshot_applied();
                }
            }
            Err(err) => warn!(fields = projection.len(), error = %err, "failed to apply snapshot"),
        }
    }
}

async fn tick(ticker: &mut Option<time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

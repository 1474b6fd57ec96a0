//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Connection task, handshake and event stream for one device."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! One TCP connection at a time to a BK215 device.
//!
//! A [`DeviceSession`] is a cheap handle; the socket itself is owned by a
//! spawned connection task that frames inbound bytes, writes queued commands
//! and runs the idle watchdog. Every connection gets a fresh epoch and all
//! events are tagged with it, so events from a superseded or destroyed
//! connection never reach the consumer.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bk215_protocol::{DeviceMessage, FieldMap, FrameExtractor};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::watchdog::WatchdogSettings;
use crate::SessionError;

const READ_CHUNK: usize = 4096;

/// Lifecycle of the single connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket and no attempt in flight.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Socket established and handshake sent.
    Connected,
}

impl ConnectionState {
    /// Lowercase label used in logs and status reporting.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications delivered through [`SessionEvents`].
#[derive(Debug)]
pub enum SessionEvent {
    /// TCP connection established; the handshake follows immediately.
    Connected,
    /// The connection ended, for whatever reason.
    Closed,
    /// Transport failure; always followed by [`SessionEvent::Closed`].
    Error(SessionError),
    /// One complete message, in arrival order.
    Message(DeviceMessage),
}

#[derive(Debug)]
struct Envelope {
    epoch: u64,
    event: SessionEvent,
}

#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
    timeout: Duration,
}

impl Endpoint {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Inner {
    epoch: u64,
    state: ConnectionState,
    last_data_at: Option<Instant>,
    connection: Option<JoinHandle<()>>,
    reconnect: Option<(u64, JoinHandle<()>)>,
    reconnect_seq: u64,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl Inner {
    /// Abort everything tied to the current connection. Returns the aborted
    /// connection task so a successor can wait for the socket to be released.
    fn teardown(&mut self) -> Option<JoinHandle<()>> {
        if let Some((_, timer)) = self.reconnect.take() {
            timer.abort();
        }
        self.outbound = None;
        self.last_data_at = None;
        self.state = ConnectionState::Disconnected;
        self.connection.take().map(|task| {
            task.abort();
            task
        })
    }
}

struct Shared {
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<Envelope>,
    watchdog: Option<WatchdogSettings>,
}

impl Shared {
    fn emit(&self, epoch: u64, event: SessionEvent) {
        // The receiver may already be gone during shutdown.
        let _ = self.events.send(Envelope { epoch, event });
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.lock().epoch == epoch
    }

    fn mark_connected(&self, epoch: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.state = ConnectionState::Connected;
        inner.last_data_at = Some(Instant::now());
        true
    }

    fn touch(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch {
            inner.last_data_at = Some(Instant::now());
        }
    }

    fn stalled_for(
        &self,
        epoch: u64,
        settings: &WatchdogSettings,
        timeout: Duration,
    ) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.epoch != epoch || inner.state != ConnectionState::Connected {
            return None;
        }
        settings.stalled_for(inner.last_data_at?, Instant::now(), timeout)
    }

    fn close(&self, epoch: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            // The connection handle stays in place so the next connect can
            // wait for this task to release the socket.
            inner.state = ConnectionState::Disconnected;
            inner.outbound = None;
            inner.last_data_at = None;
        }
        self.emit(epoch, SessionEvent::Closed);
    }

    fn fail(&self, epoch: u64, error: SessionError) {
        if !self.is_current(epoch) {
            return;
        }
        self.emit(epoch, SessionEvent::Error(error));
        self.close(epoch);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.inner.get_mut().teardown();
    }
}

/// Handle to the device session. Clones share the same connection slot.
#[derive(Clone)]
pub struct DeviceSession {
    shared: Arc<Shared>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("DeviceSession")
            .field("epoch", &inner.epoch)
            .field("state", &inner.state)
            .finish()
    }
}

/// Receiving half of a session's event stream.
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<Envelope>,
    shared: Weak<Shared>,
}

impl SessionEvents {
    /// Next event of the current connection. Returns `None` once every
    /// session handle has been dropped.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            let envelope = self.rx.recv().await?;
            let shared = self.shared.upgrade()?;
            if shared.is_current(envelope.epoch) {
                return Some(envelope.event);
            }
            trace!(epoch = envelope.epoch, "dropping event from superseded connection");
        }
    }
}

impl DeviceSession {
    /// Create an idle session. `watchdog` of `None` disables idle detection.
    pub fn new(watchdog: Option<WatchdogSettings>) -> (Self, SessionEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                epoch: 0,
                state: ConnectionState::Disconnected,
                last_data_at: None,
                connection: None,
                reconnect: None,
                reconnect_seq: 0,
                outbound: None,
            }),
            events,
            watchdog,
        });
        let receiver = SessionEvents {
            rx,
            shared: Arc::downgrade(&shared),
        };
        (Self { shared }, receiver)
    }

    /// Tear down any existing connection and dial `host:port`.
    ///
    /// Never fails synchronously: the outcome arrives as
    /// [`SessionEvent::Connected`] or as an error followed by a close. Must be
    /// called from within a tokio runtime.
    pub fn connect(&self, host: &str, port: u16, timeout: Duration) {
        let endpoint = Endpoint {
            host: host.to_owned(),
            port,
            timeout,
        };
        let mut inner = self.shared.inner.lock();
        start_connection(&self.shared, &mut inner, endpoint);
    }

    /// Serialize `fields` as a set command and queue it on the socket.
    ///
    /// Returns `false` and drops the command when not connected.
    pub fn send_command(&self, fields: FieldMap) -> bool {
        let inner = self.shared.inner.lock();
        let outbound = match (&inner.state, &inner.outbound) {
            (ConnectionState::Connected, Some(outbound)) => outbound,
            _ => {
                debug!(state = %inner.state, "dropping command while not connected");
                return false;
            }
        };
        let frame = match DeviceMessage::command(fields).to_wire(false) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode command");
                return false;
            }
        };
        outbound.send(frame).is_ok()
    }

    /// Arm the reconnect timer, replacing any timer already pending.
    pub fn schedule_reconnect(&self, host: &str, port: u16, timeout: Duration, delay: Duration) {
        let mut inner = self.shared.inner.lock();
        if let Some((_, timer)) = inner.reconnect.take() {
            timer.abort();
        }
        inner.reconnect_seq += 1;
        let seq = inner.reconnect_seq;
        let weak = Arc::downgrade(&self.shared);
        let endpoint = Endpoint {
            host: host.to_owned(),
            port,
            timeout,
        };
        info!(host = %endpoint.host, port, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        let timer = tokio::spawn(async move {
            time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut inner = shared.inner.lock();
            match &inner.reconnect {
                Some((current, _)) if *current == seq => inner.reconnect = None,
                _ => return,
            }
            // Checked and dialled under one lock: destroy() either aborted this
            // timer or runs after the new epoch exists.
            start_connection(&shared, &mut inner, endpoint);
        });
        inner.reconnect = Some((seq, timer));
    }

    /// Cancel timers, close the socket and suppress every later event.
    /// Idempotent.
    pub fn destroy(&self) {
        let mut inner = self.shared.inner.lock();
        let _ = inner.teardown();
        inner.epoch += 1;
        debug!(epoch = inner.epoch, "device session destroyed");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// `true` while a socket is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Arrival time of the last inbound byte on the current connection.
    pub fn last_data_at(&self) -> Option<Instant> {
        self.shared.inner.lock().last_data_at
    }

    /// `true` while a reconnect timer is pending.
    pub fn reconnect_pending(&self) -> bool {
        self.shared.inner.lock().reconnect.is_some()
    }
}

/// Replace the current connection with a fresh attempt. Runs under the
/// session lock so the new epoch is visible to any later `destroy()`.
fn start_connection(shared: &Arc<Shared>, inner: &mut Inner, endpoint: Endpoint) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let previous = inner.teardown();
    inner.epoch += 1;
    let epoch = inner.epoch;
    inner.state = ConnectionState::Connecting;
    inner.outbound = Some(outbound_tx);
    debug!(host = %endpoint.host, port = endpoint.port, epoch, "connecting to device");
    inner.connection = Some(tokio::spawn(run_connection(
        Arc::downgrade(shared),
        epoch,
        endpoint,
        outbound_rx,
        previous,
    )));
}

async fn run_connection(
    shared: Weak<Shared>,
    epoch: u64,
    endpoint: Endpoint,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let addr = endpoint.addr();
    let dial = time::timeout(
        endpoint.timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await;
    let Some(session) = shared.upgrade() else {
        return;
    };
    let stream = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            warn!(%addr, error = %source, "device connect failed");
            session.fail(epoch, SessionError::Connect { addr, source });
            return;
        }
        Err(_) => {
            warn!(%addr, timeout_ms = endpoint.timeout.as_millis() as u64, "device connect timed out");
            session.fail(
                epoch,
                SessionError::ConnectTimeout {
                    addr,
                    timeout: endpoint.timeout,
                },
            );
            return;
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%addr, error = %err, "failed to set TCP_NODELAY");
    }
    if !session.mark_connected(epoch) {
        return;
    }
    info!(%addr, epoch, "device connected");
    session.emit(epoch, SessionEvent::Connected);

    let watchdog = session.watchdog;
    drop(session);

    let (mut reader, mut writer) = stream.into_split();
    let handshake = match DeviceMessage::handshake().to_wire(true) {
        Ok(frame) => frame,
        Err(err) => {
            if let Some(session) = shared.upgrade() {
                session.fail(epoch, err.into());
            }
            return;
        }
    };
    if let Err(err) = writer.write_all(&handshake).await {
        if let Some(session) = shared.upgrade() {
            session.fail(epoch, err.into());
        }
        return;
    }
    debug!(%addr, "handshake sent");

    let mut framer = FrameExtractor::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut ticker = watchdog.map(|settings| {
        let mut ticker = time::interval_at(
            Instant::now() + settings.check_interval,
            settings.check_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        (settings, ticker)
    });

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let Some(session) = shared.upgrade() else { return };
                match read {
                    Ok(0) => {
                        info!(%addr, "device closed the connection");
                        session.close(epoch);
                        return;
                    }
                    Ok(n) => {
                        session.touch(epoch);
                        for message in framer.push(&buf[..n]) {
                            session.emit(epoch, SessionEvent::Message(message));
                        }
                    }
                    Err(err) => {
                        warn!(%addr, error = %err, "device socket read failed");
                        session.fail(epoch, err.into());
                        return;
                    }
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Sender dropped by teardown.
                    return;
                };
                trace!(%addr, bytes = frame.len(), "writing command");
                if let Err(err) = writer.write_all(&frame).await {
                    warn!(%addr, error = %err, "device socket write failed");
                    if let Some(session) = shared.upgrade() {
                        session.fail(epoch, err.into());
                    }
                    return;
                }
            }
            _ = tick(&mut ticker) => {
                let Some(session) = shared.upgrade() else { return };
                let Some((settings, _)) = ticker.as_ref() else { continue };
                if let Some(idle) = session.stalled_for(epoch, settings, endpoint.timeout) {
                    warn!(%addr, idle_ms = idle.as_millis() as u64, "device idle; tearing down connection");
                    session.fail(epoch, SessionError::IdleTimeout { idle });
                    return;
                }
            }
        }
    }
}

async fn tick(ticker: &mut Option<(WatchdogSettings, time::Interval)>) {
    match ticker {
        Some((_, interval)) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

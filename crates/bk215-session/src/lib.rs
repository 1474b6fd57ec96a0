//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and device session management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Long-lived TCP session with a BK215 device.
#![warn(missing_docs)]

use std::time::Duration;

use bk215_protocol::ProtocolError;

pub mod backoff;
pub mod session;
pub mod watchdog;

/// Transport-level failures. Every one of them is followed by a close event.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// TCP connect was refused or failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// `host:port` that was dialled.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// TCP connect did not complete within the timeout budget.
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// `host:port` that was dialled.
        addr: String,
        /// Budget that elapsed.
        timeout: Duration,
    },
    /// Read or write failure on an established socket.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    /// No byte arrived within the idle bound.
    #[error("no data received for {idle:?}; connection considered stalled")]
    IdleTimeout {
        /// Time since the last received byte.
        idle: Duration,
    },
    /// Outbound message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub use backoff::{BackoffPolicy, ReconnectBackoff, MIN_DELAY};
pub use session::{ConnectionState, DeviceSession, SessionEvent, SessionEvents};
pub use watchdog::WatchdogSettings;

//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// Message codes fixed by the device firmware family.
pub struct MessageCode;

impl MessageCode {
    /// Status data report. Also sent by the client as the handshake request.
    pub const DATA_REPORT: i64 = 0x6052;
    /// Data report code used by some other firmware revisions.
    pub const DATA_REPORT_ALT: i64 = 0x6055;
    /// Client command wrapper for setting values.
    pub const COMMAND_SET: i64 = 0x6056;
    /// Acknowledgement for the handshake, also seen as a generic command ack.
    pub const ACK: i64 = 0;
    /// Command response acknowledgement.
    pub const RESPONSE_ACK: i64 = 0x6057;
    /// Code the client uses for the handshake request.
    pub const HANDSHAKE: i64 = Self::DATA_REPORT;
}

/// Per-field response code meaning the device accepted a command.
pub const RESPONSE_SUCCESS: i64 = 0;

/// Field value used by the device for "unavailable".
pub const UNAVAILABLE_VALUE: i64 = 0xFFFF;

/// Closed partition of message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Handshake or command acknowledgement.
    Acknowledgement,
    /// Unsolicited field readings.
    DataReport,
    /// Anything else; logged and dropped.
    Unknown,
}

impl MessageKind {
    /// Short label used for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Acknowledgement => "ack",
            MessageKind::DataReport => "data_report",
            MessageKind::Unknown => "unknown",
        }
    }
}

/// Classify a message code.
pub fn classify(code: i64) -> MessageKind {
    match code {
        MessageCode::ACK | MessageCode::RESPONSE_ACK => MessageKind::Acknowledgement,
        MessageCode::DATA_REPORT | MessageCode::DATA_REPORT_ALT => MessageKind::DataReport,
        _ => MessageKind::Unknown,
    }
}

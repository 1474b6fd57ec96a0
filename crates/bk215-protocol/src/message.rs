//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::codes::{classify, MessageCode, MessageKind};
use crate::Result;

/// Field id (e.g. `t363`) to raw wire value.
pub type FieldMap = BTreeMap<String, Value>;

const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Envelope exchanged with the device in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMessage {
    /// Message code identifying the message type.
    pub code: i64,
    /// Payload keyed by field id. Absent or `null` on the wire means empty.
    #[serde(default, deserialize_with = "nullable_fields")]
    pub data: FieldMap,
}

fn nullable_fields<'de, D>(deserializer: D) -> std::result::Result<FieldMap, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<FieldMap>::deserialize(deserializer)?.unwrap_or_default())
}

impl DeviceMessage {
    /// Build a message from a code and payload.
    pub fn new(code: i64, data: FieldMap) -> Self {
        Self { code, data }
    }

    /// Handshake request sent right after the TCP connection is established.
    pub fn handshake() -> Self {
        Self::new(MessageCode::HANDSHAKE, FieldMap::new())
    }

    /// Command setting one or more device fields.
    pub fn command(fields: FieldMap) -> Self {
        Self::new(MessageCode::COMMAND_SET, fields)
    }

    /// Classification of this message's code.
    pub fn kind(&self) -> MessageKind {
        classify(self.code)
    }

    /// Acknowledgement with an empty payload, i.e. the handshake ack.
    ///
    /// Code `0` doubles as a generic success ack; only the empty payload tells
    /// the two apart.
    pub fn is_handshake_ack(&self) -> bool {
        self.kind() == MessageKind::Acknowledgement && self.data.is_empty()
    }

    /// Serialise for the wire, optionally appending CRLF.
    pub fn to_wire(&self, terminate: bool) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        if terminate {
            bytes.extend_from_slice(LINE_TERMINATOR);
        }
        Ok(bytes)
    }
}

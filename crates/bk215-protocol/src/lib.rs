//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Wire-level building blocks for the BK215 local JSON protocol: the message
//! envelope, code classification and the delimiter-free stream framer.
#![warn(missing_docs)]

pub mod codes;
pub mod fields;
pub mod frame;
pub mod message;

/// Shared result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding messages for the wire.
///
/// Decoding never produces an error: malformed fragments are dropped by the
/// framer and counted instead.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Wrapper for JSON serialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use codes::{classify, MessageCode, MessageKind, RESPONSE_SUCCESS, UNAVAILABLE_VALUE};
pub use fields::{
    check_writable, lookup_writable, Field, WritableField, WriteCheckError, WRITABLE_FIELDS,
};
pub use frame::{extract_frames, Extraction, FrameExtractor, MAX_BUFFER_SIZE};
pub use message::{DeviceMessage, FieldMap};

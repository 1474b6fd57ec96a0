//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Framing for a byte stream of back-to-back JSON objects.
//!
//! The device does not delimit its messages: objects arrive concatenated, may
//! be split across reads and may be interleaved with noise. Framing is done by
//! brace counting, skipping braces that appear inside string literals.

use bytes::{Buf, BytesMut};
use tracing::{trace, warn};

use crate::message::DeviceMessage;

/// Upper bound for an unfinished object kept between reads.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// Result of one framing pass over a buffer.
#[derive(Debug)]
pub struct Extraction<'a> {
    /// Complete messages in stream order.
    pub messages: Vec<DeviceMessage>,
    /// Unfinished object to prime the next pass with. Always a suffix of the input.
    pub rest: &'a [u8],
    /// Balanced spans that failed to parse as a message.
    pub discarded: usize,
}

/// Extract every complete top-level object from `buf`.
///
/// Bytes before the first `{` and between objects are dropped. A span that is
/// balanced but not a valid message is counted in `discarded` and scanning
/// carries on after it.
pub fn extract_frames(buf: &[u8]) -> Extraction<'_> {
    let mut messages = Vec::new();
    let mut discarded = 0;

    let Some(first) = buf.iter().position(|byte| *byte == b'{') else {
        return Extraction {
            messages,
            rest: &[],
            discarded,
        };
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    let mut start = first;

    for (index, &byte) in buf.iter().enumerate().skip(first) {
        if in_string {
            if escape {
                escape = false;
            } else if byte == b'\\' {
                escape = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            // Quotes only open a string inside an object; a stray quote in
            // inter-object noise must not swallow the next object.
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = index;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let span = &buf[start..=index];
                    match serde_json::from_slice::<DeviceMessage>(span) {
                        Ok(message) => messages.push(message),
                        Err(err) => {
                            discarded += 1;
                            trace!(error = %err, len = span.len(), "dropping malformed frame");
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let rest: &[u8] = if depth > 0 { &buf[start..] } else { &[] };
    Extraction {
        messages,
        rest,
        discarded,
    }
}

/// Stateful framer owning the receive buffer of one connection.
#[derive(Debug)]
pub struct FrameExtractor {
    buffer: BytesMut,
    max_buffer: usize,
    discarded_total: u64,
}

impl FrameExtractor {
    /// Create a framer with the default overflow bound.
    pub fn new() -> Self {
        Self::with_max_buffer(MAX_BUFFER_SIZE)
    }

    /// Create a framer that drops unfinished objects larger than `max_buffer`.
    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_buffer,
            discarded_total: 0,
        }
    }

    /// Append a chunk and return the messages it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DeviceMessage> {
        self.buffer.extend_from_slice(chunk);

        let Extraction {
            messages,
            rest,
            discarded,
        } = extract_frames(&self.buffer);
        let rest_len = rest.len();
        self.discarded_total += discarded as u64;

        let consumed = self.buffer.len() - rest_len;
        self.buffer.advance(consumed);

        if self.buffer.len() > self.max_buffer {
            warn!(
                buffered = self.buffer.len(),
                limit = self.max_buffer,
                "unterminated frame exceeds buffer limit; discarding"
            );
            self.buffer.clear();
            self.discarded_total += 1;
        }

        messages
    }

    /// Bytes currently held for an unfinished object.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of fragments dropped since creation.
    pub fn discarded_total(&self) -> u64 {
        self.discarded_total
    }

    /// Forget any partial object.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::MessageCode;
    use serde_json::json;

    #[test]
    fn garbage_around_a_message_is_dropped_and_open_tail_kept() {
        let buf = br#"garbage{"code":1,"data":{}}moregarbage{""#;
        let extraction = extract_frames(buf);
        assert_eq!(extraction.messages.len(), 1);
        assert_eq!(extraction.messages[0].code, 1);
        assert_eq!(extraction.rest, br#"{""#);
        assert_eq!(extraction.discarded, 0);
    }

    #[test]
    fn braces_inside_strings_do_not_close_the_object() {
        let extraction = extract_frames(br#"{"code":2,"data":{"t1":"a}b"}}"#);
        assert_eq!(extraction.messages.len(), 1);
        assert_eq!(extraction.messages[0].data["t1"], json!("a}b"));
        assert!(extraction.rest.is_empty());
    }

    #[test]
    fn escaped_quotes_keep_string_state() {
        let extraction = extract_frames(br#"{"code":2,"data":{"t1":"x\"}{"}}{"code":3}"#);
        let codes: Vec<i64> = extraction.messages.iter().map(|m| m.code).collect();
        assert_eq!(codes, vec![2, 3]);
    }

    #[test]
    fn back_to_back_objects_without_separator() {
        let extraction =
            extract_frames(br#"{"code":24658,"data":{"t211":80}}{"code":0,"data":{}}"#);
        assert_eq!(extraction.messages.len(), 2);
        assert_eq!(extraction.messages[0].code, MessageCode::DATA_REPORT);
        assert!(extraction.messages[1].is_handshake_ack());
    }

    #[test]
    fn malformed_fragment_does_not_abort_later_objects() {
        let extraction = extract_frames(br#"{"code":}{not json}{"code":7,"data":{}}"#);
        assert_eq!(extraction.messages.len(), 1);
        assert_eq!(extraction.messages[0].code, 7);
        assert_eq!(extraction.discarded, 2);
    }

    #[test]
    fn buffer_without_open_brace_is_discarded() {
        let extraction = extract_frames(b"}}} noise \r\n");
        assert!(extraction.messages.is_empty());
        assert!(extraction.rest.is_empty());
    }

    #[test]
    fn stray_quote_between_objects_does_not_hide_the_next_one() {
        let extraction = extract_frames(br#"{"code":1}" junk {"code":2}"#);
        let codes: Vec<i64> = extraction.messages.iter().map(|m| m.code).collect();
        assert_eq!(codes, vec![1, 2]);
    }

    #[test]
    fn split_points_do_not_change_the_message_sequence() {
        let stream = concat!(
            r#"{"code":24658,"data":{"t211":55,"t592":60}}"#,
            r#"{"code":24663,"data":{"t363":0}}"#,
            r#"{"code":0,"data":{}}"#,
            r#"{"code":24661,"data":{"note":"{}\"}"}}"#,
        )
        .as_bytes();
        let expected = extract_frames(stream).messages;
        assert_eq!(expected.len(), 4);

        for chunk_size in 1..=stream.len() {
            let mut framer = FrameExtractor::new();
            let mut received = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                received.extend(framer.push(chunk));
            }
            assert_eq!(received, expected, "chunk size {chunk_size}");
            assert!(framer.buffered().is_empty());
        }
    }

    #[test]
    fn object_split_across_reads_is_completed() {
        let mut framer = FrameExtractor::new();
        assert!(framer.push(br#"xx{"code":24658,"da"#).is_empty());
        assert_eq!(framer.buffered(), br#"{"code":24658,"da"#);
        let messages = framer.push(br#"ta":{"t211":42}}"#);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data["t211"], json!(42));
    }

    #[test]
    fn oversized_unfinished_object_is_dropped() {
        let mut framer = FrameExtractor::with_max_buffer(16);
        assert!(framer.push(br#"{"code":1,"data":{"t1":"0123456789"#).is_empty());
        assert!(framer.buffered().is_empty());
        assert_eq!(framer.discarded_total(), 1);

        let messages = framer.push(br#"{"code":5}"#);
        assert_eq!(messages.len(), 1);
    }
}

//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Pending-command tracking and acknowledgement matching."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bk215_protocol::{FieldMap, RESPONSE_SUCCESS};
use bk215_session::DeviceSession;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Outcome of a failed set command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    /// No socket is established.
    #[error("device not connected")]
    NotConnected,
    /// The link is configured read-only.
    #[error("link is read-only; refusing to write {field}")]
    ReadOnly {
        /// Field the caller tried to write.
        field: String,
    },
    /// The device acknowledged with a non-success response code.
    #[error("device rejected {field}, rc={code}")]
    Rejected {
        /// Rejected field.
        field: String,
        /// Response code as sent by the device.
        code: Value,
    },
    /// No acknowledgement arrived before the deadline.
    #[error("command timeout for {field} after {timeout:?}")]
    Timeout {
        /// Field whose command expired.
        field: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// The connection went away while the command was pending.
    #[error("command for {field} failed: {reason}")]
    ConnectionClosed {
        /// Field whose command was pending.
        field: String,
        /// Why pending commands were failed.
        reason: String,
    },
    /// A newer command for the same field replaced this one.
    #[error("command for {field} superseded by a newer write")]
    Superseded {
        /// Field written twice.
        field: String,
    },
}

impl CommandError {
    /// Short label for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            CommandError::NotConnected => "not_connected",
            CommandError::ReadOnly { .. } => "read_only",
            CommandError::Rejected { .. } => "rejected",
            CommandError::Timeout { .. } => "timeout",
            CommandError::ConnectionClosed { .. } => "connection_closed",
            CommandError::Superseded { .. } => "superseded",
        }
    }
}

/// Write path used by the correlator. Returns `false` when the command was
/// dropped without reaching the socket.
pub trait CommandSink: Send + Sync {
    fn send_command(&self, fields: FieldMap) -> bool;
}

impl CommandSink for DeviceSession {
    fn send_command(&self, fields: FieldMap) -> bool {
        DeviceSession::send_command(self, fields)
    }
}

/// Read-only view of one pending entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub field: String,
    pub deadline: Instant,
}

type Completion = oneshot::Sender<Result<(), CommandError>>;

struct Pending {
    id: u64,
    deadline: Instant,
    completion: Completion,
}

#[derive(Default)]
struct State {
    next_id: u64,
    pending: HashMap<String, Pending>,
}

/// Pairs set commands with acknowledgements by field id.
///
/// At most one command per field is in flight. Every completion path
/// removes the entry before the issuing caller resumes, so a late
/// acknowledgement for a settled field is ignored.
#[derive(Clone, Default)]
pub struct CommandCorrelator {
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for CommandCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandCorrelator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Removes the caller's own entry when the `issue` future ends for any reason.
struct Registration<'a> {
    correlator: &'a CommandCorrelator,
    field: &'a str,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.correlator.remove_if_current(self.field, self.id);
    }
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `{field: value}` through `sink` and wait for its acknowledgement.
    pub async fn issue(
        &self,
        sink: &dyn CommandSink,
        field: &str,
        value: Value,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let (completion, outcome) = oneshot::channel();
        let id = self.register(field, completion, Instant::now() + timeout);
        let _registration = Registration {
            correlator: self,
            field,
            id,
        };

        let mut fields = FieldMap::new();
        fields.insert(field.to_owned(), value);
        if !sink.send_command(fields) {
            return Err(CommandError::NotConnected);
        }
        debug!(field, timeout_ms = timeout.as_millis() as u64, "command sent");

        match time::timeout(timeout, outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommandError::ConnectionClosed {
                field: field.to_owned(),
                reason: "command abandoned".into(),
            }),
            Err(_) => {
                warn!(field, timeout_ms = timeout.as_millis() as u64, "command timed out");
                Err(CommandError::Timeout {
                    field: field.to_owned(),
                    timeout,
                })
            }
        }
    }

    fn register(&self, field: &str, completion: Completion, deadline: Instant) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let previous = state.pending.insert(
            field.to_owned(),
            Pending {
                id,
                deadline,
                completion,
            },
        );
        drop(state);
        if let Some(previous) = previous {
            debug!(field, "replacing pending command");
            let _ = previous.completion.send(Err(CommandError::Superseded {
                field: field.to_owned(),
            }));
        }
        id
    }

    fn remove_if_current(&self, field: &str, id: u64) {
        let mut state = self.state.lock();
        if state.pending.get(field).is_some_and(|pending| pending.id == id) {
            state.pending.remove(field);
        }
    }

    /// Settle pending commands named in an acknowledgement's data.
    /// Returns how many were settled; unknown fields are ignored.
    pub fn handle_ack(&self, data: &FieldMap) -> usize {
        let settled: Vec<(String, Pending, &Value)> = {
            let mut state = self.state.lock();
            data.iter()
                .filter_map(|(field, code)| {
                    state
                        .pending
                        .remove(field)
                        .map(|pending| (field.clone(), pending, code))
                })
                .collect()
        };
        let count = settled.len();
        for (field, pending, code) in settled {
            let outcome = if is_success(code) {
                debug!(%field, "command acknowledged");
                Ok(())
            } else {
                warn!(%field, rc = %code, "device rejected command");
                Err(CommandError::Rejected {
                    field,
                    code: code.clone(),
                })
            };
            let _ = pending.completion.send(outcome);
        }
        if count == 0 {
            debug!(fields = data.len(), "acknowledgement matched no pending command");
        }
        count
    }

    /// Fail every pending command with `reason`. Returns how many were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, Pending)> = self.state.lock().pending.drain().collect();
        let count = drained.len();
        for (field, pending) in drained {
            let _ = pending.completion.send(Err(CommandError::ConnectionClosed {
                field,
                reason: reason.to_owned(),
            }));
        }
        if count > 0 {
            warn!(count, reason, "failed pending commands");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_pending(&self, field: &str) -> bool {
        self.state.lock().pending.contains_key(field)
    }

    /// Pending entries ordered by deadline.
    pub fn pending(&self) -> Vec<PendingCommand> {
        let mut entries: Vec<PendingCommand> = self
            .state
            .lock()
            .pending
            .iter()
            .map(|(field, pending)| PendingCommand {
                field: field.clone(),
                deadline: pending.deadline,
            })
            .collect();
        entries.sort_by_key(|entry| entry.deadline);
        entries
    }
}

/// Numeric comparison, so `0`, `0.0` and `"0"` all count as success.
fn is_success(code: &Value) -> bool {
    let rc = match code {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    rc == Some(RESPONSE_SUCCESS as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        connected: bool,
        sent: Mutex<Vec<FieldMap>>,
    }

    impl RecordingSink {
        fn connected() -> Arc<Self> {
            Arc::new(Self {
                connected: true,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl CommandSink for RecordingSink {
        fn send_command(&self, fields: FieldMap) -> bool {
            if self.connected {
                self.sent.lock().push(fields);
            }
            self.connected
        }
    }

    fn ack(field: &str, code: Value) -> FieldMap {
        let mut data = FieldMap::new();
        data.insert(field.into(), code);
        data
    }

    fn spawn_issue(
        correlator: &CommandCorrelator,
        sink: &Arc<RecordingSink>,
        field: &'static str,
    ) -> tokio::task::JoinHandle<Result<(), CommandError>> {
        let correlator = correlator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            correlator
                .issue(sink.as_ref(), field, json!(95), Duration::from_secs(2))
                .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn success_ack_resolves() {
        let correlator = CommandCorrelator::new();
        let sink = RecordingSink::connected();
        let task = spawn_issue(&correlator, &sink, "t363");
        tokio::task::yield_now().await;
        assert!(correlator.is_pending("t363"));
        assert_eq!(sink.sent.lock()[0], ack("t363", json!(95)));

        assert_eq!(correlator.handle_ack(&ack("t363", json!(0))), 1);
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_code_rejects_naming_the_field() {
        let correlator = CommandCorrelator::new();
        let sink = RecordingSink::connected();
        let task = spawn_issue(&correlator, &sink, "t363");
        tokio::task::yield_now().await;

        correlator.handle_ack(&ack("t363", json!(5)));
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            CommandError::Rejected {
                field: "t363".into(),
                code: json!(5)
            }
        );
        assert_eq!(err.to_string(), "device rejected t363, rc=5");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out_and_clears_entry() {
        let correlator = CommandCorrelator::new();
        let sink = RecordingSink::connected();
        let task = spawn_issue(&correlator, &sink, "t363");
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Timeout { ref field, .. } if field == "t363"));
        assert_eq!(correlator.pending_count(), 0);
        // Late ack is a no-op.
        assert_eq!(correlator.handle_ack(&ack("t363", json!(0))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_all_fails_every_pending_command() {
        let correlator = CommandCorrelator::new();
        let sink = RecordingSink::connected();
        let first = spawn_issue(&correlator, &sink, "t363");
        let second = spawn_issue(&correlator, &sink, "t590");
        tokio::task::yield_now().await;
        assert_eq!(correlator.pending_count(), 2);

        assert_eq!(correlator.fail_all("connection closed"), 2);
        for task in [first, second] {
            assert!(matches!(
                task.await.unwrap(),
                Err(CommandError::ConnectionClosed { ref reason, .. }) if reason == "connection closed"
            ));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_ack_can_settle_several_fields() {
        let correlator = CommandCorrelator::new();
        let sink = RecordingSink::connected();
        let first = spawn_issue(&correlator, &sink, "t363");
        let second = spawn_issue(&correlator, &sink, "t590");
        tokio::task::yield_now().await;

        let mut data = ack("t590", json!(0));
        data.insert("t363".into(), json!(0));
        data.insert("t999".into(), json!(0));
        assert_eq!(correlator.handle_ack(&data), 2);
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn second_write_supersedes_the_first() {
        let correlator = CommandCorrelator::new();
        let sink = RecordingSink::connected();
        let first = spawn_issue(&correlator, &sink, "t363");
        tokio::task::yield_now().await;
        let second = spawn_issue(&correlator, &sink, "t363");
        tokio::task::yield_now().await;

        assert!(matches!(
            first.await.unwrap(),
            Err(CommandError::Superseded { .. })
        ));
        assert_eq!(correlator.pending_count(), 1);
        correlator.handle_ack(&ack("t363", json!("0")));
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn float_zero_code_counts_as_success() {
        let correlator = CommandCorrelator::new();
        let sink = RecordingSink::connected();
        let first = spawn_issue(&correlator, &sink, "t363");
        let second = spawn_issue(&correlator, &sink, "t590");
        tokio::task::yield_now().await;

        let mut data = ack("t363", json!(0.0));
        data.insert("t590".into(), json!("0.0"));
        assert_eq!(correlator.handle_ack(&data), 2);
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn non_numeric_code_is_a_rejection() {
        let correlator = CommandCorrelator::new();
        let sink = RecordingSink::connected();
        let task = spawn_issue(&correlator, &sink, "t363");
        tokio::task::yield_now().await;

        correlator.handle_ack(&ack("t363", json!("E1")));
        assert!(matches!(
            task.await.unwrap(),
            Err(CommandError::Rejected { ref code, .. }) if *code == json!("E1")
        ));
    }

    #[tokio::test]
    async fn dropped_write_reports_not_connected() {
        let correlator = CommandCorrelator::new();
        let sink = RecordingSink::default();
        let result = correlator
            .issue(&sink, "t363", json!(95), Duration::from_secs(2))
            .await;
        assert_eq!(result, Err(CommandError::NotConnected));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_removes_its_entry() {
        let correlator = CommandCorrelator::new();
        let sink = RecordingSink::connected();
        let task = spawn_issue(&correlator, &sink, "t363");
        tokio::task::yield_now().await;
        assert!(correlator.is_pending("t363"));

        task.abort();
        let _ = task.await;
        assert_eq!(correlator.pending_count(), 0);
    }
}

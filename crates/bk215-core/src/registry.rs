//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Boundary towards the home-automation state registry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::trace;

use crate::report_cache::Projection;

/// Receiver of device state. Implementations must be idempotent and must
/// ignore fields they do not know; fields absent from a projection keep
/// their previous value.
#[async_trait]
pub trait StateRegistry: Send + Sync {
    /// Apply a field -> value projection.
    async fn apply_snapshot(&self, projection: &Projection) -> anyhow::Result<()>;

    /// Connection indicator changed.
    async fn set_connection(&self, _connected: bool) -> anyhow::Result<()> {
        Ok(())
    }

    /// A transport error occurred.
    async fn record_error(&self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// A data report arrived.
    async fn record_update(&self, _at: DateTime<Utc>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Contents of a [`MemoryRegistry`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryState {
    pub values: BTreeMap<String, f64>,
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
    pub snapshots_applied: u64,
}

/// In-process registry keeping the latest value per field.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    known_fields: Option<Arc<BTreeSet<String>>>,
    state: Arc<RwLock<RegistryState>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that only accepts the listed fields.
    pub fn with_known_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_fields: Some(Arc::new(fields.into_iter().map(Into::into).collect())),
            state: Arc::default(),
        }
    }

    pub fn state(&self) -> RegistryState {
        self.state.read().clone()
    }

    pub fn value(&self, field: &str) -> Option<f64> {
        self.state.read().values.get(field).copied()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }
}

#[async_trait]
impl StateRegistry for MemoryRegistry {
    async fn apply_snapshot(&self, projection: &Projection) -> anyhow::Result<()> {
        let mut state = self.state.write();
        for (field, value) in projection {
            let known = self
                .known_fields
                .as_ref()
                .map_or(true, |known| known.contains(field));
            if known {
                state.values.insert(field.clone(), *value);
            } else {
                trace!(%field, "ignoring unknown field");
            }
        }
        state.snapshots_applied += 1;
        Ok(())
    }

    async fn set_connection(&self, connected: bool) -> anyhow::Result<()> {
        let mut state = self.state.write();
        state.connected = connected;
        if connected {
            state.last_error = None;
        }
        Ok(())
    }

    async fn record_error(&self, message: &str) -> anyhow::Result<()> {
        self.state.write().last_error = Some(message.to_owned());
        Ok(())
    }

    async fn record_update(&self, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.state.write().last_update = Some(at);
        Ok(())
    }
}

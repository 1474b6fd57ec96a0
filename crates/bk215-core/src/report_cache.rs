//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Merged report snapshot and update throttling."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::time::Duration;

use bk215_protocol::{FieldMap, UNAVAILABLE_VALUE};
use serde_json::Value;

/// Numeric field values ready for the state registry.
pub type Projection = BTreeMap<String, f64>;

/// How merged reports reach the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleMode {
    /// Each report is projected as it arrives, restricted to its own fields.
    Immediate,
    /// The whole snapshot is projected once per interval when something changed.
    Interval(Duration),
}

impl ThrottleMode {
    /// `0` selects immediate mode.
    pub fn from_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            ThrottleMode::Immediate
        } else {
            ThrottleMode::Interval(interval)
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            ThrottleMode::Immediate => None,
            ThrottleMode::Interval(period) => Some(*period),
        }
    }
}

/// Last raw value of every field seen since start-up. Survives reconnects.
#[derive(Debug, Clone)]
pub struct ReportCache {
    mode: ThrottleMode,
    snapshot: FieldMap,
    dirty: bool,
}

impl ReportCache {
    pub fn new(mode: ThrottleMode) -> Self {
        Self {
            mode,
            snapshot: FieldMap::new(),
            dirty: false,
        }
    }

    pub fn mode(&self) -> ThrottleMode {
        self.mode
    }

    /// Overwrite-by-field merge. Raw values are stored; filtering happens in [`project`].
    pub fn merge(&mut self, report: &FieldMap) {
        if report.is_empty() {
            return;
        }
        for (field, value) in report {
            self.snapshot.insert(field.clone(), value.clone());
        }
        self.dirty = true;
    }

    /// Projection of the full snapshot if anything changed since the last flush.
    pub fn flush(&mut self) -> Option<Projection> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(project(&self.snapshot))
    }

    /// Merge a data report. In immediate mode returns the projection of just
    /// this report's fields; in interval mode returns `None` and waits for the tick.
    pub fn on_report(&mut self, report: &FieldMap) -> Option<Projection> {
        self.merge(report);
        match self.mode {
            ThrottleMode::Interval(_) => None,
            ThrottleMode::Immediate => {
                if !self.dirty {
                    return None;
                }
                self.dirty = false;
                Some(project(report))
            }
        }
    }

    pub fn snapshot(&self) -> &FieldMap {
        &self.snapshot
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Keep fields carrying a usable reading: finite, non-negative numbers or
/// numeric strings, never the unavailable sentinel.
pub fn project(data: &FieldMap) -> Projection {
    data.iter()
        .filter_map(|(field, value)| numeric_reading(value).map(|reading| (field.clone(), reading)))
        .collect()
}

fn numeric_reading(value: &Value) -> Option<f64> {
    let reading = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !reading.is_finite() || reading < 0.0 || reading == UNAVAILABLE_VALUE as f64 {
        return None;
    }
    Some(reading)
}

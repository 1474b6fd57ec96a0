//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Device field identifiers and the limits of user-writable fields.
//!
//! The session layer never consults this table; it is used by callers that
//! validate a value before handing it to the link.

use std::ops::RangeInclusive;

/// Known device field ids (`tXXX` keys).
pub struct Field;

#[allow(missing_docs)]
impl Field {
    pub const LOCAL_MODE: &'static str = "t598";
    pub const BATTERY_CHARGING_MODE: &'static str = "t700_1";
    pub const CAR_CHARGING_MODE: &'static str = "t701_1";
    pub const HOME_APPLIANCE_MODE: &'static str = "t702_1";
    pub const AC_ACTIVE_MODE: &'static str = "t728";

    pub const SYSTEM_DISCHARGE_LIMIT: &'static str = "t362";
    pub const SYSTEM_CHARGE_LIMIT: &'static str = "t363";
    pub const HOME_DISCHARGE_CUTOFF: &'static str = "t720";
    pub const CAR_DISCHARGE_CUTOFF: &'static str = "t721";
    pub const BATTERY_CHARGE_CUTOFF: &'static str = "t727";
    pub const SYSTEM_CHARGING_POWER: &'static str = "t590";
    pub const IDLE_SHUTDOWN_TIME: &'static str = "t596";
    pub const LOW_BATTERY_SHUTDOWN_TIME: &'static str = "t597";

    pub const BATTERY_LEVEL: &'static str = "t211";
    pub const HEAD_STORAGE: &'static str = "t592";
    pub const EXPANSION_1: &'static str = "t593";
    pub const EXPANSION_2: &'static str = "t594";
    pub const EXPANSION_3: &'static str = "t595";
    pub const EXPANSION_4: &'static str = "t1001";
    pub const EXPANSION_5: &'static str = "t1002";
    pub const EXPANSION_6: &'static str = "t1003";
    pub const EXPANSION_7: &'static str = "t1004";

    pub const HEAD_HW_DISCHARGE_LIMIT: &'static str = "t507";
    pub const HEAD_HW_CHARGE_LIMIT: &'static str = "t508";
}

/// A field the user may write, with its accepted range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritableField {
    /// Device field id.
    pub field: &'static str,
    /// Human-readable name used in CLI output and logs.
    pub name: &'static str,
    /// Inclusive range of accepted values.
    pub range: RangeInclusive<i64>,
}

const fn writable(field: &'static str, name: &'static str, min: i64, max: i64) -> WritableField {
    WritableField {
        field,
        name,
        range: min..=max,
    }
}

/// Every writable field. Mode switches accept `0` or `1`.
pub static WRITABLE_FIELDS: &[WritableField] = &[
    writable(Field::SYSTEM_DISCHARGE_LIMIT, "system_discharge_limit", 1, 20),
    writable(Field::SYSTEM_CHARGE_LIMIT, "system_charge_limit", 70, 100),
    writable(Field::HOME_DISCHARGE_CUTOFF, "home_discharge_cutoff", 5, 20),
    writable(Field::CAR_DISCHARGE_CUTOFF, "car_discharge_cutoff", 5, 40),
    writable(Field::BATTERY_CHARGE_CUTOFF, "battery_charge_cutoff", 80, 100),
    writable(Field::SYSTEM_CHARGING_POWER, "system_charging_power", 0, 3600),
    writable(Field::IDLE_SHUTDOWN_TIME, "idle_shutdown_time", 15, 1440),
    writable(Field::LOW_BATTERY_SHUTDOWN_TIME, "low_battery_shutdown_time", 5, 1440),
    writable(Field::LOCAL_MODE, "local_mode", 0, 1),
    writable(Field::BATTERY_CHARGING_MODE, "battery_charging_mode", 0, 1),
    writable(Field::CAR_CHARGING_MODE, "car_charging_mode", 0, 1),
    writable(Field::HOME_APPLIANCE_MODE, "home_appliance_mode", 0, 1),
    writable(Field::AC_ACTIVE_MODE, "ac_active_mode", 0, 1),
];

/// Reasons a value is refused before it reaches the device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteCheckError {
    /// Field id or name is not writable.
    #[error("{0} is not a writable field")]
    NotWritable(String),
    /// Value outside the accepted range.
    #[error("{name}: {value} out of range ({min}..{max})")]
    OutOfRange {
        /// Field name.
        name: &'static str,
        /// Rejected value.
        value: i64,
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },
}

/// Look up a writable field by id (`t363`) or name (`system_charge_limit`).
pub fn lookup_writable(key: &str) -> Option<&'static WritableField> {
    WRITABLE_FIELDS
        .iter()
        .find(|entry| entry.field == key || entry.name == key)
}

/// Validate a value for a writable field and return the entry it matched.
pub fn check_writable(key: &str, value: i64) -> Result<&'static WritableField, WriteCheckError> {
    let entry = lookup_writable(key).ok_or_else(|| WriteCheckError::NotWritable(key.to_owned()))?;
    if !entry.range.contains(&value) {
        return Err(WriteCheckError::OutOfRange {
            name: entry.name,
            value,
            min: *entry.range.start(),
            max: *entry.range.end(),
        });
    }
    Ok(entry)
}

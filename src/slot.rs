//! Minute and hour time buckets.
//!
//! A [`SlotKey`] is a linear count of whole minutes since the Unix epoch and an
//! [`HourKey`] a linear count of whole hours. Keys are only ever compared and
//! incremented as integers; calendar fields (year, month, day, ...) are derived
//! from them for display and never fed back into arithmetic, so month lengths,
//! leap years and year rollover cannot affect ordering.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of one slot in milliseconds.
pub const SLOT_MS: i64 = 60_000;
/// Length of one hour bucket in milliseconds.
pub const HOUR_MS: i64 = 3_600_000;
/// Number of slots aggregated by an hour bucket.
pub const SLOTS_PER_HOUR: i64 = 60;

/// A minute-granularity time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotKey(i64);

/// The hour bucket containing exactly 60 consecutive slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HourKey(i64);

/// The slot containing the instant `time_ms` (epoch milliseconds).
pub fn slot_of(time_ms: i64) -> SlotKey {
    SlotKey(time_ms.div_euclid(SLOT_MS))
}

/// The hour bucket a slot belongs to.
pub fn hour_of(slot: SlotKey) -> HourKey {
    HourKey(slot.0.div_euclid(SLOTS_PER_HOUR))
}

/// The slot immediately after `slot`.
pub fn next_slot(slot: SlotKey) -> SlotKey {
    SlotKey(slot.0.saturating_add(1))
}

/// Epoch milliseconds at which `slot` begins.
pub fn slot_start_time(slot: SlotKey) -> i64 {
    slot.0.saturating_mul(SLOT_MS)
}

impl SlotKey {
    pub const fn from_epoch_minutes(minutes: i64) -> Self {
        Self(minutes)
    }

    pub const fn epoch_minutes(self) -> i64 {
        self.0
    }

    pub fn hour(self) -> HourKey {
        hour_of(self)
    }

    pub fn next(self) -> Self {
        next_slot(self)
    }

    /// The slot `minutes` after this one (negative values move backwards).
    pub fn offset(self, minutes: i64) -> Self {
        Self(self.0.saturating_add(minutes))
    }

    pub fn start_ms(self) -> i64 {
        slot_start_time(self)
    }

    /// Exclusive end of the slot, i.e. the start of the next one.
    pub fn end_ms(self) -> i64 {
        slot_start_time(self.next())
    }

    /// UTC `YYYYMMDDHHmm` rendering, for logs only.
    pub fn calendar_label(self) -> String {
        calendar_label(self.start_ms(), "%Y%m%d%H%M", self.0)
    }
}

impl HourKey {
    pub const fn from_epoch_hours(hours: i64) -> Self {
        Self(hours)
    }

    pub const fn epoch_hours(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn first_slot(self) -> SlotKey {
        SlotKey(self.0.saturating_mul(SLOTS_PER_HOUR))
    }

    pub fn start_ms(self) -> i64 {
        self.0.saturating_mul(HOUR_MS)
    }

    pub fn end_ms(self) -> i64 {
        self.next().start_ms()
    }

    /// UTC `YYYYMMDDHH` rendering, for logs only.
    pub fn calendar_label(self) -> String {
        calendar_label(self.start_ms(), "%Y%m%d%H", self.0)
    }
}

fn calendar_label(start_ms: i64, format: &str, raw: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(start_ms) {
        Some(dt) => dt.format(format).to_string(),
        None => raw.to_string(),
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (m{})", self.calendar_label(), self.0)
    }
}

impl fmt::Display for HourKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (h{})", self.calendar_label(), self.0)
    }
}

use crate::slot::{HourKey, SlotKey};

/// Prefix shared by every key slotgate writes.
pub const COUNTER_PREFIX: &str = "rate_limit/";

/// Per-slot usage counter: rate_limit/<queue>/minute/<epoch-minute>
pub fn minute_counter_key(queue: &str, slot: SlotKey) -> String {
    // Zero-pad so keys of one queue sort in time order. Pre-epoch slots keep
    // a leading sign: distinct keys, but they do not sort with the rest.
    format!("rate_limit/{}/minute/{:012}", queue, slot.epoch_minutes())
}

/// Per-hour usage counter: rate_limit/<queue>/hour/<epoch-hour>
pub fn hour_counter_key(queue: &str, hour: HourKey) -> String {
    format!("rate_limit/{}/hour/{:010}", queue, hour.epoch_hours())
}

/// Allocation cursor holding the earliest slot that may still have room: rate_limit/<queue>/cursor
pub fn cursor_key(queue: &str) -> String {
    format!("rate_limit/{}/cursor", queue)
}

//! Future slot reservation.
//!
//! When a job cannot run in the current slot it is given a reservation in the
//! earliest future slot whose minute *and* hour counters both have room. The
//! search starts at the queue's persisted cursor, the earliest slot that may
//! still have room, so concurrent allocators skip slots already known to be
//! full. Each candidate is checked and reserved in one `compare_reserve` call;
//! two allocators racing for the last unit of a slot cannot both win it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::counter_store::{CounterLimit, CounterStore, CounterStoreError, with_deadline};
use crate::keys::{cursor_key, hour_counter_key, minute_counter_key};
use crate::metrics::Metrics;
use crate::settings::QueueConfig;
use crate::slot::{HOUR_MS, SLOT_MS, SlotKey, slot_of};

/// Result of a slot search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub slot: SlotKey,
    /// `false` when the scan horizon was exhausted and `slot` is only a best-effort
    /// answer with no capacity held for it.
    pub reserved: bool,
    /// Number of candidate slots tried.
    pub scanned: u32,
}

/// Time-to-live that keeps a key readable until `until_ms`, never below one second.
pub(crate) fn ttl_until(now_ms: i64, until_ms: i64) -> Duration {
    Duration::from_millis(until_ms.saturating_sub(now_ms).max(1_000) as u64)
}

pub struct SlotAllocator {
    store: Arc<dyn CounterStore>,
    store_timeout: Duration,
    metrics: Option<Metrics>,
}

impl SlotAllocator {
    pub fn new(store: Arc<dyn CounterStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Reserve one unit in the earliest future slot with room in both dimensions.
    ///
    /// The result is always strictly later than `slot_of(now_ms)` and never more
    /// than `scan_horizon_minutes` past it. If nothing in that window is free the
    /// furthest slot looked at is returned with `reserved == false`; that is a soft
    /// degradation, not an error.
    pub async fn allocate(
        &self,
        queue: &str,
        limits: &QueueConfig,
        now_ms: i64,
    ) -> Result<Allocation, CounterStoreError> {
        let current = slot_of(now_ms);
        let floor = current.next();
        let cursor_key = cursor_key(queue);

        let stored = with_deadline(self.store_timeout, self.store.get(&cursor_key)).await?;
        let start = match stored {
            Some(raw) if raw > current.epoch_minutes() => SlotKey::from_epoch_minutes(raw),
            stale => {
                debug!(queue, stale_cursor = ?stale, healed = %floor, "cursor behind current slot, resetting");
                self.advance_cursor(&cursor_key, floor, now_ms).await?;
                floor
            }
        };

        // Last slot the search may return, fixed relative to now
        let horizon_last = current.offset(i64::from(limits.scan_horizon_minutes.max(1)));
        let mut candidate = start;
        let mut last_tried = start.min(horizon_last);
        let mut scanned = 0u32;
        while candidate <= horizon_last {
            scanned += 1;
            last_tried = candidate;
            let hour = candidate.hour();
            let reservation = [
                CounterLimit {
                    key: minute_counter_key(queue, candidate),
                    limit: limits.minute_limit,
                    ttl: ttl_until(now_ms, candidate.start_ms() + 2 * SLOT_MS),
                },
                CounterLimit {
                    key: hour_counter_key(queue, hour),
                    limit: limits.hour_limit,
                    ttl: ttl_until(now_ms, hour.start_ms() + 2 * HOUR_MS),
                },
            ];
            let outcome =
                with_deadline(self.store_timeout, self.store.compare_reserve(&reservation))
                    .await?;
            let &[minute_count, hour_count] = outcome.values.as_slice() else {
                return Err(CounterStoreError::InvalidRequest(format!(
                    "expected 2 values from compare_reserve, got {}",
                    outcome.values.len()
                )));
            };

            let hour_full = hour_count >= limits.hour_limit;
            if outcome.reserved {
                // Leave the cursor on this slot unless the reservation just filled it
                let next_cursor = if hour_full {
                    hour.next().first_slot()
                } else if minute_count >= limits.minute_limit {
                    candidate.next()
                } else {
                    candidate
                };
                if next_cursor > start {
                    self.advance_cursor(&cursor_key, next_cursor, now_ms).await?;
                }
                debug!(
                    queue,
                    slot = %candidate,
                    minute_count,
                    hour_count,
                    scanned,
                    "reserved future slot"
                );
                return Ok(Allocation {
                    slot: candidate,
                    reserved: true,
                    scanned,
                });
            }

            candidate = if hour_full {
                hour.next().first_slot()
            } else {
                candidate.next()
            };
        }

        // Everything tried is full; the cursor moves up to, but not past, the horizon
        self.advance_cursor(&cursor_key, candidate.min(horizon_last), now_ms)
            .await?;
        warn!(
            queue,
            furthest = %last_tried,
            horizon_last = %horizon_last,
            scanned,
            horizon_minutes = limits.scan_horizon_minutes,
            "no capacity within scan horizon, scheduling at furthest scanned slot"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_allocation_exhausted(queue);
        }
        Ok(Allocation {
            slot: last_tried,
            reserved: false,
            scanned,
        })
    }

    async fn advance_cursor(
        &self,
        cursor_key: &str,
        to: SlotKey,
        now_ms: i64,
    ) -> Result<SlotKey, CounterStoreError> {
        let ttl = ttl_until(now_ms, to.start_ms() + HOUR_MS);
        let value = with_deadline(
            self.store_timeout,
            self.store.set_max(cursor_key, to.epoch_minutes(), ttl),
        )
        .await?;
        Ok(SlotKey::from_epoch_minutes(value))
    }
}

//! Admission control: may a job run in the current slot, or must it wait?
//!
//! The engine holds no counter state. Each decision increments the queue's
//! current minute and hour counters in one atomic store call and compares the
//! post-increment values against the queue's ceilings. Over-limit jobs are
//! handed a future slot by the [`SlotAllocator`].
//!
//! Accounting is at-least-once and overshoot tolerant:
//! - increments made by a rejected attempt are not compensated, so a busy slot
//!   may show a count above its ceiling even though only `minute_limit` jobs ran;
//! - racing workers at the ceiling may each see a count one above the limit and
//!   all defer, but never all admit;
//! - re-checking the same job twice counts it twice. Callers must not retry
//!   `try_admit` expecting idempotence.
//!
//! Store failures fail open, except a fenced store: a process that lost its
//! handle on the shared counters gets an error instead of unlimited admissions.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::allocator::{SlotAllocator, ttl_until};
use crate::counter_store::{CounterStore, CounterStoreError, CounterUpdate, with_deadline};
use crate::keys::{hour_counter_key, minute_counter_key};
use crate::metrics::{Metrics, decision};
use crate::settings::QueueTable;
use crate::slot::{HOUR_MS, SLOT_MS, SlotKey, slot_of};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(#[from] CounterStoreError),
}

impl AdmissionError {
    pub fn is_fatal(&self) -> bool {
        match self {
            AdmissionError::StoreUnavailable(e) => e.is_fatal(),
        }
    }
}

/// Why a job was allowed to run now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitReason {
    /// Counted against the current slot and within both ceilings.
    Counted,
    /// Arrived in the slot it reserved earlier; already counted there.
    Reserved,
    /// The counter store could not be reached; admitted without counting.
    FailOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        reason: AdmitReason,
    },
    Deferred {
        slot: SlotKey,
        /// Whether a unit of `slot` is held for this job. Only a held slot may be
        /// presented back as a reservation.
        reserved: bool,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

pub struct AdmissionEngine {
    store: Arc<dyn CounterStore>,
    queues: Arc<QueueTable>,
    allocator: SlotAllocator,
    store_timeout: Duration,
    metrics: Option<Metrics>,
}

impl AdmissionEngine {
    pub fn new(store: Arc<dyn CounterStore>, queues: Arc<QueueTable>, store_timeout: Duration) -> Self {
        Self {
            allocator: SlotAllocator::new(Arc::clone(&store), store_timeout),
            store,
            queues,
            store_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.allocator = self.allocator.with_metrics(Some(metrics.clone()));
        self.metrics = Some(metrics);
        self
    }

    pub fn queues(&self) -> &QueueTable {
        &self.queues
    }

    pub fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }

    /// Decide whether a job on `queue` may run at `now_ms`.
    ///
    /// `reserved` is the slot a previous deferral reserved for this job, if any.
    /// Store failures fail open: the job is admitted and a warning is logged.
    /// Only a fatal store error is returned.
    pub async fn try_admit(
        &self,
        queue: &str,
        now_ms: i64,
        reserved: Option<SlotKey>,
    ) -> Result<Admission, AdmissionError> {
        self.try_admit_with(queue, now_ms, reserved, true).await
    }

    /// Like [`try_admit`](Self::try_admit). With `may_reserve == false` an
    /// over-limit job is deferred to the next slot without reserving capacity,
    /// for jobs that will not be re-dispatched anyway.
    pub async fn try_admit_with(
        &self,
        queue: &str,
        now_ms: i64,
        reserved: Option<SlotKey>,
        may_reserve: bool,
    ) -> Result<Admission, AdmissionError> {
        let admission = match self.decide(queue, now_ms, reserved, may_reserve).await {
            Ok(admission) => admission,
            Err(e) if e.is_fatal() => {
                error!(queue, error = %e, "counter store lost, refusing to admit");
                return Err(e);
            }
            Err(e) => {
                warn!(queue, error = %e, "counter store unavailable, admitting without rate limit");
                Admission::Admitted {
                    reason: AdmitReason::FailOpen,
                }
            }
        };
        if let Some(metrics) = &self.metrics {
            let label = match admission {
                Admission::Admitted {
                    reason: AdmitReason::Counted,
                } => decision::ADMITTED,
                Admission::Admitted {
                    reason: AdmitReason::Reserved,
                } => decision::RESERVED,
                Admission::Admitted {
                    reason: AdmitReason::FailOpen,
                } => decision::FAIL_OPEN,
                Admission::Deferred { .. } => decision::DEFERRED,
            };
            metrics.record_admission(queue, label);
        }
        Ok(admission)
    }

    /// Like [`try_admit`](Self::try_admit) but surfaces every store failure instead of failing open.
    pub async fn check(
        &self,
        queue: &str,
        now_ms: i64,
        reserved: Option<SlotKey>,
    ) -> Result<Admission, AdmissionError> {
        self.decide(queue, now_ms, reserved, true).await
    }

    async fn decide(
        &self,
        queue: &str,
        now_ms: i64,
        reserved: Option<SlotKey>,
        may_reserve: bool,
    ) -> Result<Admission, AdmissionError> {
        let current = slot_of(now_ms);

        if let Some(reserved) = reserved {
            if reserved == current {
                debug!(queue, slot = %current, "admitting against reservation");
                return Ok(Admission::Admitted {
                    reason: AdmitReason::Reserved,
                });
            }
            if reserved > current {
                // Woke before its slot; keep waiting without taking another unit
                return Ok(Admission::Deferred {
                    slot: reserved,
                    reserved: true,
                });
            }
            debug!(queue, reserved = %reserved, current = %current, "reservation expired, checking again");
        }

        let limits = self.queues.limits_for(queue);
        let hour = current.hour();
        let updates = [
            CounterUpdate {
                key: minute_counter_key(queue, current),
                amount: 1,
                ttl: ttl_until(now_ms, current.end_ms() + SLOT_MS),
            },
            CounterUpdate {
                key: hour_counter_key(queue, hour),
                amount: 1,
                ttl: ttl_until(now_ms, hour.end_ms() + HOUR_MS),
            },
        ];
        let values =
            with_deadline(self.store_timeout, self.store.increment_with_expiry(&updates)).await?;
        let &[minute_count, hour_count] = values.as_slice() else {
            return Err(CounterStoreError::InvalidRequest(format!(
                "expected 2 values from increment_with_expiry, got {}",
                values.len()
            ))
            .into());
        };

        if minute_count <= limits.minute_limit && hour_count <= limits.hour_limit {
            debug!(queue, slot = %current, minute_count, hour_count, "admitted");
            return Ok(Admission::Admitted {
                reason: AdmitReason::Counted,
            });
        }

        if !may_reserve {
            debug!(queue, slot = %current, minute_count, hour_count, "over limit, no reservation taken");
            return Ok(Admission::Deferred {
                slot: current.next(),
                reserved: false,
            });
        }

        let allocation = self.allocator.allocate(queue, limits, now_ms).await?;
        debug!(
            queue,
            slot = %current,
            minute_count,
            hour_count,
            deferred_to = %allocation.slot,
            reserved = allocation.reserved,
            "over limit, deferred"
        );
        Ok(Admission::Deferred {
            slot: allocation.slot,
            reserved: allocation.reserved,
        })
    }
}

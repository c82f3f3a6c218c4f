//! Shared atomic counter store.
//!
//! All cross-worker coordination goes through a [`CounterStore`]: workers keep
//! no counter state of their own, so every admission decision is made against
//! the store's current values. Implementations must apply each multi-key
//! operation all-or-nothing; no caller may observe a partially applied call.
//!
//! - `memory`: in-process store with an outage switch, for tests and single-process use
//! - `slate`: SlateDB-backed store on a local directory or object storage

mod memory;
mod slate;

pub use memory::MemoryCounterStore;
pub use slate::SlateCounterStore;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::{CodecError, CounterValue};

/// Add `amount` to `key`, giving the key `ttl` if this call creates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdate {
    pub key: String,
    pub amount: i64,
    pub ttl: Duration,
}

/// Reserve one unit of `key` provided its current value is below `limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterLimit {
    pub key: String,
    pub limit: i64,
    pub ttl: Duration,
}

/// Result of [`CounterStore::compare_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveOutcome {
    /// Whether every counter was incremented.
    pub reserved: bool,
    /// Post-increment values when reserved, otherwise the unchanged current values.
    /// Same order as the request.
    pub values: Vec<i64>,
}

#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store call exceeded {0:?}")]
    Timeout(Duration),
    /// This handle can never write again, typically because another process
    /// opened the same SlateDB path and fenced it out.
    #[error("counter store handle is closed: {0}")]
    Fenced(String),
    #[error(transparent)]
    Slate(slatedb::Error),
    #[error("invalid store location {path}: {reason}")]
    InvalidLocation { path: String, reason: String },
    #[error("corrupt counter value: {0}")]
    Codec(#[from] CodecError),
    #[error("invalid counter request: {0}")]
    InvalidRequest(String),
}

impl CounterStoreError {
    /// Errors that retrying or failing open cannot outlive: the process has lost
    /// its share of the counters and must stop admitting work.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CounterStoreError::Fenced(_))
    }
}

impl From<slatedb::Error> for CounterStoreError {
    fn from(e: slatedb::Error) -> Self {
        match e.kind() {
            slatedb::ErrorKind::Closed(_) => CounterStoreError::Fenced(e.to_string()),
            _ => CounterStoreError::Slate(e),
        }
    }
}

/// Atomic multi-key counter operations with per-key expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment every key, returning post-increment values in request order.
    /// TTLs apply only to keys this call creates; existing expiries are kept.
    async fn increment_with_expiry(
        &self,
        updates: &[CounterUpdate],
    ) -> Result<Vec<i64>, CounterStoreError>;

    /// Increment every key by one if and only if each is currently below its limit.
    async fn compare_reserve(
        &self,
        limits: &[CounterLimit],
    ) -> Result<ReserveOutcome, CounterStoreError>;

    /// Current value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError>;

    /// Unconditionally overwrite `key` with a fresh TTL.
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CounterStoreError>;

    /// Raise `key` to `max(current, value)`, refreshing the TTL only when it moves.
    /// Returns the resulting value.
    async fn set_max(&self, key: &str, value: i64, ttl: Duration)
    -> Result<i64, CounterStoreError>;
}

/// Run a store call, failing with [`CounterStoreError::Timeout`] once `limit` elapses.
pub async fn with_deadline<T, F>(limit: Duration, call: F) -> Result<T, CounterStoreError>
where
    F: Future<Output = Result<T, CounterStoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CounterStoreError::Timeout(limit)),
    }
}

/// Live values of the keys one operation touches. Absent or expired keys are missing.
pub(crate) type Snapshot = HashMap<String, CounterValue>;

pub(crate) fn expiry_at(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
}

pub(crate) fn check_distinct<'a>(
    keys: impl IntoIterator<Item = &'a str>,
) -> Result<(), CounterStoreError> {
    let mut seen = HashSet::new();
    for key in keys {
        if !seen.insert(key) {
            return Err(CounterStoreError::InvalidRequest(format!(
                "duplicate key {}",
                key
            )));
        }
    }
    if seen.is_empty() {
        return Err(CounterStoreError::InvalidRequest("no keys".to_string()));
    }
    Ok(())
}

pub(crate) fn apply_increments(
    snapshot: &mut Snapshot,
    now_ms: i64,
    updates: &[CounterUpdate],
) -> Vec<i64> {
    updates
        .iter()
        .map(|update| {
            let value = snapshot
                .entry(update.key.clone())
                .and_modify(|v| v.count = v.count.saturating_add(update.amount))
                .or_insert_with(|| {
                    CounterValue::new(update.amount, Some(expiry_at(now_ms, update.ttl)))
                });
            value.count
        })
        .collect()
}

pub(crate) fn apply_reserve(
    snapshot: &mut Snapshot,
    now_ms: i64,
    limits: &[CounterLimit],
) -> ReserveOutcome {
    let current: Vec<i64> = limits
        .iter()
        .map(|l| snapshot.get(&l.key).map_or(0, |v| v.count))
        .collect();
    let has_room = limits.iter().zip(&current).all(|(l, count)| *count < l.limit);
    if !has_room {
        return ReserveOutcome {
            reserved: false,
            values: current,
        };
    }
    let updates: Vec<CounterUpdate> = limits
        .iter()
        .map(|l| CounterUpdate {
            key: l.key.clone(),
            amount: 1,
            ttl: l.ttl,
        })
        .collect();
    ReserveOutcome {
        reserved: true,
        values: apply_increments(snapshot, now_ms, &updates),
    }
}

/// Returns the resulting value and whether the key changed.
pub(crate) fn apply_set_max(
    snapshot: &mut Snapshot,
    now_ms: i64,
    key: &str,
    value: i64,
    ttl: Duration,
) -> (i64, bool) {
    match snapshot.get(key) {
        Some(existing) if existing.count >= value => (existing.count, false),
        _ => {
            snapshot.insert(
                key.to_string(),
                CounterValue::new(value, Some(expiry_at(now_ms, ttl))),
            );
            (value, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(key: &str, amount: i64) -> CounterUpdate {
        CounterUpdate {
            key: key.to_string(),
            amount,
            ttl: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_increment_keeps_existing_expiry() {
        let mut snapshot = Snapshot::new();
        apply_increments(&mut snapshot, 1_000, &[update("a", 1)]);
        let values = apply_increments(&mut snapshot, 30_000, &[update("a", 2)]);
        assert_eq!(values, vec![3]);
        assert_eq!(snapshot["a"].expires_at_ms, Some(61_000));
    }

    #[test]
    fn test_reserve_requires_room_in_every_key() {
        let mut snapshot = Snapshot::new();
        snapshot.insert("a".to_string(), CounterValue::new(2, None));
        let limits = [
            CounterLimit {
                key: "a".to_string(),
                limit: 2,
                ttl: Duration::from_secs(60),
            },
            CounterLimit {
                key: "b".to_string(),
                limit: 10,
                ttl: Duration::from_secs(60),
            },
        ];
        let outcome = apply_reserve(&mut snapshot, 0, &limits);
        assert!(!outcome.reserved);
        assert_eq!(outcome.values, vec![2, 0]);
        assert!(!snapshot.contains_key("b"));
    }

    #[test]
    fn test_set_max_never_lowers() {
        let mut snapshot = Snapshot::new();
        assert_eq!(
            apply_set_max(&mut snapshot, 0, "c", 10, Duration::from_secs(1)),
            (10, true)
        );
        assert_eq!(
            apply_set_max(&mut snapshot, 0, "c", 5, Duration::from_secs(1)),
            (10, false)
        );
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        assert!(check_distinct(["a", "a"]).is_err());
        assert!(check_distinct(Vec::<&str>::new()).is_err());
        assert!(check_distinct(["a", "b"]).is_ok());
    }
}

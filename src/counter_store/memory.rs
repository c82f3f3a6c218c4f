use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::codec::CounterValue;
use crate::counter_store::{
    CounterLimit, CounterStore, CounterStoreError, CounterUpdate, ReserveOutcome, Snapshot,
    apply_increments, apply_reserve, apply_set_max, check_distinct, expiry_at,
};

/// Entries beyond this count trigger a sweep of expired keys on write.
const SWEEP_THRESHOLD: usize = 4096;

/// In-process counter store. Every operation runs under one lock, which makes
/// multi-key calls atomic for all tasks sharing the instance.
///
/// The outage switch, fence and artificial latency let tests exercise fail-open,
/// fatal store loss and timeout handling without a real network store.
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, CounterValue>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    fenced: AtomicBool,
    latency: std::sync::Mutex<Option<Duration>>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
            fenced: AtomicBool::new(false),
            latency: std::sync::Mutex::new(None),
        }
    }

    pub fn new_arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Permanently close this handle, as when another writer takes over the store.
    pub fn fence(&self) {
        self.fenced.store(true, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it touches the data.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Absolute expiry of a live key, for inspecting TTL behavior.
    pub async fn expires_at_ms(&self, key: &str) -> Option<i64> {
        let now_ms = self.clock.now_ms();
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|v| v.is_live(now_ms))
            .and_then(|v| v.expires_at_ms)
    }

    /// Number of live keys.
    pub async fn live_keys(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let entries = self.entries.lock().await;
        entries.values().filter(|v| v.is_live(now_ms)).count()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    async fn before_call(&self) -> Result<(), CounterStoreError> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.fenced.load(Ordering::SeqCst) {
            return Err(CounterStoreError::Fenced(
                "memory store handle fenced".to_string(),
            ));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(CounterStoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Run `op` against a snapshot of `keys` and write the snapshot back.
    async fn with_snapshot<T>(
        &self,
        keys: &[&str],
        op: impl FnOnce(&mut Snapshot, i64) -> T,
    ) -> Result<T, CounterStoreError> {
        self.before_call().await?;
        let now_ms = self.clock.now_ms();
        let mut entries = self.entries.lock().await;
        let mut snapshot: Snapshot = keys
            .iter()
            .filter_map(|k| {
                entries
                    .get(*k)
                    .filter(|v| v.is_live(now_ms))
                    .map(|v| (k.to_string(), *v))
            })
            .collect();
        let result = op(&mut snapshot, now_ms);
        for key in keys {
            match snapshot.remove(*key) {
                Some(value) => entries.insert(key.to_string(), value),
                None => entries.remove(*key),
            };
        }
        if entries.len() > SWEEP_THRESHOLD {
            entries.retain(|_, v| v.is_live(now_ms));
        }
        Ok(result)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_with_expiry(
        &self,
        updates: &[CounterUpdate],
    ) -> Result<Vec<i64>, CounterStoreError> {
        let keys: Vec<&str> = updates.iter().map(|u| u.key.as_str()).collect();
        check_distinct(keys.iter().copied())?;
        self.with_snapshot(&keys, |snapshot, now_ms| {
            apply_increments(snapshot, now_ms, updates)
        })
        .await
    }

    async fn compare_reserve(
        &self,
        limits: &[CounterLimit],
    ) -> Result<ReserveOutcome, CounterStoreError> {
        let keys: Vec<&str> = limits.iter().map(|l| l.key.as_str()).collect();
        check_distinct(keys.iter().copied())?;
        self.with_snapshot(&keys, |snapshot, now_ms| {
            apply_reserve(snapshot, now_ms, limits)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError> {
        self.with_snapshot(&[key], |snapshot, _| snapshot.get(key).map(|v| v.count))
            .await
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CounterStoreError> {
        self.with_snapshot(&[key], |snapshot, now_ms| {
            snapshot.insert(
                key.to_string(),
                CounterValue::new(value, Some(expiry_at(now_ms, ttl))),
            );
        })
        .await
    }

    async fn set_max(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<i64, CounterStoreError> {
        self.with_snapshot(&[key], |snapshot, now_ms| {
            apply_set_max(snapshot, now_ms, key, value, ttl).0
        })
        .await
    }
}

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slatedb::object_store::ObjectStore;
use slatedb::{Db, DbIterator, WriteBatch};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::codec::{CounterValue, decode_counter_value, encode_counter_value};
use crate::counter_store::{
    CounterLimit, CounterStore, CounterStoreError, CounterUpdate, ReserveOutcome, Snapshot,
    apply_increments, apply_reserve, apply_set_max, check_distinct, expiry_at,
};
use crate::settings::{Backend, StoreConfig};

/// Counter store persisted in SlateDB.
///
/// SlateDB admits a single writer per database path, so all callers of one
/// path share this instance. Read-modify-write sequences are serialized through
/// `write_gate` and land as one `WriteBatch`, which SlateDB applies atomically.
pub struct SlateCounterStore {
    db: Arc<Db>,
    write_gate: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl SlateCounterStore {
    pub async fn open(cfg: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, CounterStoreError> {
        let (object_store, db_path) = object_store_for(cfg)?;
        let mut db_builder = slatedb::DbBuilder::new(db_path.as_str(), object_store);
        if let Some(flush_ms) = cfg.flush_interval_ms {
            let mut settings = slatedb::config::Settings::default();
            settings.flush_interval = Some(Duration::from_millis(flush_ms));
            db_builder = db_builder.with_settings(settings);
        }
        let db = db_builder.build().await?;
        debug!(path = %db_path, "opened slatedb counter store");
        Ok(Self {
            db: Arc::new(db),
            write_gate: Mutex::new(()),
            clock,
        })
    }

    pub async fn close(&self) -> Result<(), CounterStoreError> {
        self.db.close().await?;
        Ok(())
    }

    /// Delete expired counters under `prefix`. Returns how many were removed.
    pub async fn purge_expired(&self, prefix: &str) -> Result<u64, CounterStoreError> {
        let _gate = self.write_gate.lock().await;
        let now_ms = self.clock.now_ms();
        let start: Vec<u8> = prefix.as_bytes().to_vec();
        let mut end: Vec<u8> = prefix.as_bytes().to_vec();
        end.push(0xFF);

        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(start..=end).await?;
        let mut batch = WriteBatch::new();
        let mut purged = 0u64;
        while let Some(kv) = iter.next().await? {
            // Undecodable values are left for an operator to inspect
            let Ok(value) = decode_counter_value(&kv.value) else {
                continue;
            };
            if !value.is_live(now_ms) {
                batch.delete(&kv.key);
                purged += 1;
            }
        }
        if purged > 0 {
            self.db.write(batch).await?;
        }
        debug!(prefix, purged, "purged expired counters");
        Ok(purged)
    }

    async fn load(&self, keys: &[&str], now_ms: i64) -> Result<Snapshot, CounterStoreError> {
        let mut snapshot = Snapshot::new();
        for key in keys {
            if let Some(raw) = self.db.get(key.as_bytes()).await? {
                let value = decode_counter_value(&raw)?;
                if value.is_live(now_ms) {
                    snapshot.insert(key.to_string(), value);
                }
            }
        }
        Ok(snapshot)
    }

    async fn persist(&self, keys: &[&str], snapshot: &Snapshot) -> Result<(), CounterStoreError> {
        let mut batch = WriteBatch::new();
        for key in keys {
            match snapshot.get(*key) {
                Some(value) => batch.put(key.as_bytes(), encode_counter_value(value)),
                None => batch.delete(key.as_bytes()),
            }
        }
        self.db.write(batch).await?;
        Ok(())
    }
}

/// Object store and database path for a SlateDB-backed `cfg`.
fn object_store_for(cfg: &StoreConfig) -> Result<(Arc<dyn ObjectStore>, String), CounterStoreError> {
    let invalid = |reason: String| CounterStoreError::InvalidLocation {
        path: cfg.path.clone(),
        reason,
    };
    match cfg.backend {
        Backend::Fs => {
            let root = Path::new(&cfg.path);
            fs::create_dir_all(root).map_err(|e| invalid(format!("cannot create directory: {}", e)))?;
            // The local object store resolves keys against an absolute prefix
            let canonical = root
                .canonicalize()
                .map_err(|e| invalid(format!("cannot canonicalize: {}", e)))?
                .to_string_lossy()
                .into_owned();
            let local = slatedb::object_store::local::LocalFileSystem::new_with_prefix(&canonical)
                .map_err(|e| invalid(e.to_string()))?;
            Ok((Arc::new(local), canonical))
        }
        Backend::S3 | Backend::Gcs | Backend::Url => {
            let store = Db::resolve_object_store(&cfg.path)?;
            Ok((store, cfg.path.clone()))
        }
        Backend::Memory => Err(invalid(
            "the memory backend is served by MemoryCounterStore, not SlateDB".to_string(),
        )),
    }
}

#[async_trait]
impl CounterStore for SlateCounterStore {
    async fn increment_with_expiry(
        &self,
        updates: &[CounterUpdate],
    ) -> Result<Vec<i64>, CounterStoreError> {
        let keys: Vec<&str> = updates.iter().map(|u| u.key.as_str()).collect();
        check_distinct(keys.iter().copied())?;

        let _gate = self.write_gate.lock().await;
        let now_ms = self.clock.now_ms();
        let mut snapshot = self.load(&keys, now_ms).await?;
        let values = apply_increments(&mut snapshot, now_ms, updates);
        self.persist(&keys, &snapshot).await?;
        Ok(values)
    }

    async fn compare_reserve(
        &self,
        limits: &[CounterLimit],
    ) -> Result<ReserveOutcome, CounterStoreError> {
        let keys: Vec<&str> = limits.iter().map(|l| l.key.as_str()).collect();
        check_distinct(keys.iter().copied())?;

        let _gate = self.write_gate.lock().await;
        let now_ms = self.clock.now_ms();
        let mut snapshot = self.load(&keys, now_ms).await?;
        let outcome = apply_reserve(&mut snapshot, now_ms, limits);
        if outcome.reserved {
            self.persist(&keys, &snapshot).await?;
        }
        Ok(outcome)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError> {
        let now_ms = self.clock.now_ms();
        let snapshot = self.load(&[key], now_ms).await?;
        Ok(snapshot.get(key).map(|v| v.count))
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CounterStoreError> {
        let _gate = self.write_gate.lock().await;
        let now_ms = self.clock.now_ms();
        let value = CounterValue::new(value, Some(expiry_at(now_ms, ttl)));
        self.db
            .put(key.as_bytes(), encode_counter_value(&value))
            .await?;
        Ok(())
    }

    async fn set_max(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<i64, CounterStoreError> {
        let _gate = self.write_gate.lock().await;
        let now_ms = self.clock.now_ms();
        let mut snapshot = self.load(&[key], now_ms).await?;
        let (result, changed) = apply_set_max(&mut snapshot, now_ms, key, value, ttl);
        if changed {
            self.persist(&[key], &snapshot).await?;
        }
        Ok(result)
    }
}

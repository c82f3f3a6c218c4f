use std::sync::Arc;

use crate::admission::AdmissionEngine;
use crate::clock::Clock;
use crate::counter_store::{CounterStore, CounterStoreError, MemoryCounterStore, SlateCounterStore};
use crate::metrics::Metrics;
use crate::settings::{AppConfig, Backend, StoreConfig};

/// An opened counter store. The SlateDB handle is kept so callers can close it.
pub struct OpenedStore {
    pub store: Arc<dyn CounterStore>,
    pub slate: Option<Arc<SlateCounterStore>>,
}

impl OpenedStore {
    pub async fn close(&self) -> Result<(), CounterStoreError> {
        match &self.slate {
            Some(slate) => slate.close().await,
            None => Ok(()),
        }
    }
}

/// Open the counter store described by `cfg`. The `memory` backend uses the
/// in-process store; every other backend is persisted through SlateDB.
pub async fn open_counter_store(
    cfg: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> Result<OpenedStore, CounterStoreError> {
    match cfg.backend {
        Backend::Memory => Ok(OpenedStore {
            store: MemoryCounterStore::new_arc(clock),
            slate: None,
        }),
        _ => {
            let slate = Arc::new(SlateCounterStore::open(cfg, clock).await?);
            Ok(OpenedStore {
                store: slate.clone(),
                slate: Some(slate),
            })
        }
    }
}

/// Build an admission engine over `store` using the queues and timeout from `cfg`.
pub fn build_engine(
    cfg: &AppConfig,
    store: Arc<dyn CounterStore>,
    metrics: Option<Metrics>,
) -> AdmissionEngine {
    let engine = AdmissionEngine::new(store, Arc::new(cfg.queue_table()), cfg.store.timeout());
    match metrics {
        Some(metrics) => engine.with_metrics(metrics),
        None => engine,
    }
}

//! Prometheus metrics for admission decisions.
//!
//! Every component takes an `Option<Metrics>`; when `None` nothing is recorded.
//!
//! ```ignore
//! let metrics = slotgate::metrics::init()?;
//! let engine = AdmissionEngine::new(store, queues, timeout).with_metrics(metrics.clone());
//! println!("{}", metrics.render());
//! ```

use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
    core::Collector,
};
use tracing::warn;

/// Histogram buckets for defer delays (in seconds), from a few seconds up to the scan horizon
const DEFER_DELAY_BUCKETS: &[f64] = &[
    1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0,
];

/// Label values for `slotgate_admissions_total{decision}`.
pub mod decision {
    pub const ADMITTED: &str = "admitted";
    pub const RESERVED: &str = "reserved";
    pub const FAIL_OPEN: &str = "fail_open";
    pub const DEFERRED: &str = "deferred";
}

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    admissions: CounterVec,
    allocation_exhausted: CounterVec,
    jobs_failed: CounterVec,
    defer_delay: HistogramVec,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admission(&self, queue: &str, decision: &str) {
        self.admissions.with_label_values(&[queue, decision]).inc();
    }

    pub fn record_allocation_exhausted(&self, queue: &str) {
        self.allocation_exhausted.with_label_values(&[queue]).inc();
    }

    pub fn record_job_failed(&self, queue: &str, reason: &str) {
        self.jobs_failed.with_label_values(&[queue, reason]).inc();
    }

    pub fn record_defer_delay(&self, queue: &str, delay_secs: f64) {
        self.defer_delay
            .with_label_values(&[queue])
            .observe(delay_secs);
    }

    /// Current admission count for one label pair, mostly useful in tests.
    pub fn admissions(&self, queue: &str, decision: &str) -> u64 {
        self.admissions.with_label_values(&[queue, decision]).get() as u64
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Create a fresh registry with all slotgate instruments registered.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let admissions = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "slotgate_admissions_total",
                "Admission decisions by queue and outcome",
            ),
            &["queue", "decision"],
        )?,
    );

    let allocation_exhausted = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "slotgate_allocation_exhausted_total",
                "Allocations that found no free slot within the scan horizon",
            ),
            &["queue"],
        )?,
    );

    let jobs_failed = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "slotgate_jobs_failed_total",
                "Jobs handed to the failure reporter",
            ),
            &["queue", "reason"],
        )?,
    );

    let defer_delay = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "slotgate_defer_delay_seconds",
                "Delay applied to deferred jobs before their next admission attempt",
            )
            .buckets(DEFER_DELAY_BUCKETS.to_vec()),
            &["queue"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        admissions,
        allocation_exhausted,
        jobs_failed,
        defer_delay,
    })
}

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Limits applied to any queue without its own `[[queues]]` entry
    #[serde(default)]
    pub defaults: QueueConfig,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    /// Filesystem path or object store URL, depending on `backend`
    #[serde(default = "default_store_path")]
    pub path: String,
    /// SlateDB memtable flush interval; SlateDB's default when unset
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
    /// Upper bound on a single counter store round-trip
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            flush_interval_ms: None,
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fs,
    S3,
    Gcs,
    Memory,
    Url,
}

fn default_backend() -> Backend {
    Backend::Fs
}

fn default_store_path() -> String {
    "/tmp/slotgate".to_string()
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

/// Ceilings and deferral policy for one queue.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_minute_limit")]
    pub minute_limit: i64,
    /// `0` defers every job
    #[serde(default = "default_hour_limit")]
    pub hour_limit: i64,
    /// Upper bound of the random delay added past a slot's start
    #[serde(default = "default_jitter_max_seconds")]
    pub jitter_max_seconds: u64,
    /// Deferrals allowed before a job is reported as failed
    #[serde(default = "default_max_defer_cycles")]
    pub max_defer_cycles: u32,
    /// How far ahead the allocator looks for a free slot
    #[serde(default = "default_scan_horizon_minutes")]
    pub scan_horizon_minutes: u32,
    /// Re-dispatch tries before a deferred job is reported as failed
    #[serde(default = "default_resubmit_attempts")]
    pub resubmit_attempts: u32,
    /// A job still waiting this long after acceptance is not deferred again
    #[serde(default = "default_retry_until_secs")]
    pub retry_until_secs: u64,
    /// Longest a single handler run may take
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
}

fn default_queue_name() -> String {
    "default".to_string()
}

fn default_minute_limit() -> i64 {
    60
}

fn default_hour_limit() -> i64 {
    3_600
}

fn default_jitter_max_seconds() -> u64 {
    5
}

fn default_max_defer_cycles() -> u32 {
    5
}

fn default_scan_horizon_minutes() -> u32 {
    240
}

fn default_resubmit_attempts() -> u32 {
    3
}

fn default_retry_until_secs() -> u64 {
    3_600
}

fn default_handler_timeout_secs() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            minute_limit: default_minute_limit(),
            hour_limit: default_hour_limit(),
            jitter_max_seconds: default_jitter_max_seconds(),
            max_defer_cycles: default_max_defer_cycles(),
            scan_horizon_minutes: default_scan_horizon_minutes(),
            resubmit_attempts: default_resubmit_attempts(),
            retry_until_secs: default_retry_until_secs(),
            handler_timeout_secs: default_handler_timeout_secs(),
        }
    }
}

impl QueueConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_limits(mut self, minute_limit: i64, hour_limit: i64) -> Self {
        self.minute_limit = minute_limit;
        self.hour_limit = hour_limit;
        self
    }

    pub fn retry_until(&self) -> Duration {
        Duration::from_secs(self.retry_until_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            bail!("queue name {:?} must be non-empty and contain no '/'", self.name);
        }
        if self.minute_limit < 1 {
            bail!("queue {}: minute_limit must be at least 1", self.name);
        }
        if self.hour_limit < 0 {
            bail!("queue {}: hour_limit must not be negative", self.name);
        }
        // Jitter must keep a woken job inside the slot it reserved
        if self.jitter_max_seconds >= 60 {
            bail!("queue {}: jitter_max_seconds must be below 60", self.name);
        }
        if self.scan_horizon_minutes < 1 {
            bail!("queue {}: scan_horizon_minutes must be at least 1", self.name);
        }
        if self.retry_until_secs == 0 || self.handler_timeout_secs == 0 {
            bail!(
                "queue {}: retry_until_secs and handler_timeout_secs must be positive",
                self.name
            );
        }
        Ok(())
    }
}

/// Lookup of per-queue limits with a fallback for unconfigured queues.
#[derive(Debug, Clone)]
pub struct QueueTable {
    defaults: QueueConfig,
    queues: HashMap<String, QueueConfig>,
}

impl QueueTable {
    pub fn new(defaults: QueueConfig, queues: impl IntoIterator<Item = QueueConfig>) -> Self {
        Self {
            defaults,
            queues: queues.into_iter().map(|q| (q.name.clone(), q)).collect(),
        }
    }

    /// A table where every queue, named or not, uses `config`.
    pub fn uniform(config: QueueConfig) -> Self {
        Self::new(config.clone(), [config])
    }

    pub fn limits_for(&self, queue: &str) -> &QueueConfig {
        self.queues.get(queue).unwrap_or(&self.defaults)
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let cfg = match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                toml::from_str::<Self>(&data)?
            }
            None => Self::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.defaults.validate()?;
        for queue in &self.queues {
            queue.validate()?;
        }
        if self.store.timeout_ms == 0 {
            bail!("store.timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn queue_table(&self) -> QueueTable {
        QueueTable::new(self.defaults.clone(), self.queues.iter().cloned())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            store: StoreConfig::default(),
            defaults: QueueConfig::default(),
            queues: vec![
                QueueConfig::named("send_email"),
                QueueConfig::named("send_email_mass"),
            ],
        }
    }
}

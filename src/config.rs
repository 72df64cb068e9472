use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the impressoor pipeline.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Event batching configuration.
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Metric delivery configuration.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Featurization registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Registration retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Identifies this impressoor instance in delivered rows.
    #[serde(default)]
    pub meta_client_name: String,

    /// Identifies the deployment environment (e.g., prod, stage).
    #[serde(default)]
    pub meta_network_name: String,
}

/// Event batching configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Events per batch before a flush. Clamped to 1..=100. Default: 10.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Baseline flush cadence. Default: 2s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Maximum age of the oldest buffered event before a forced flush.
    /// Default: 2.5x the flush interval.
    #[serde(default, with = "humantime_serde::option")]
    pub max_wait_time: Option<Duration>,
}

/// Metric delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// HTTP endpoint to send metric rows to.
    #[serde(default)]
    pub endpoint: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum duration for one delivery request. Default: 30s.
    #[serde(default = "default_delivery_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum rows per HTTP request. Default: 512.
    #[serde(default = "default_delivery_batch_size")]
    pub batch_size: usize,

    /// Maximum wait before sending a partial request. Default: 5s.
    #[serde(default = "default_delivery_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Maximum rows to queue before refusing batches. Default: 8192.
    #[serde(default = "default_delivery_max_queue_size")]
    pub max_queue_size: usize,

    /// Number of concurrent senders. Default: 1.
    #[serde(default = "default_delivery_workers")]
    pub workers: usize,
}

/// Featurization registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Registry HTTP endpoint.
    #[serde(default)]
    pub endpoint: String,

    /// Organization identifier stamped on registration hits.
    #[serde(default)]
    pub org_id: String,

    /// Datastream identifier stamped on registration hits.
    #[serde(default)]
    pub datastream_id: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_registry_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Registration retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// First retry interval. Default: 5s.
    #[serde(default = "default_retry_base", with = "humantime_serde")]
    pub base: Duration,

    /// Retry interval ceiling. Default: 5m.
    #[serde(default = "default_retry_cap", with = "humantime_serde")]
    pub cap: Duration,

    /// How often to scan the hit queue for due retries. Default: 1s.
    #[serde(default = "default_retry_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_batch_size() -> usize {
    10
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_delivery_batch_size() -> usize {
    512
}

fn default_delivery_batch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_delivery_max_queue_size() -> usize {
    8192
}

fn default_delivery_workers() -> usize {
    1
}

fn default_registry_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_base() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_cap() -> Duration {
    Duration::from_secs(300)
}

fn default_retry_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            batching: BatchingConfig::default(),
            delivery: DeliveryConfig::default(),
            registry: RegistryConfig::default(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
            meta_client_name: String::new(),
            meta_network_name: String::new(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval: default_flush_interval(),
            max_wait_time: None,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            timeout: default_delivery_timeout(),
            batch_size: default_delivery_batch_size(),
            batch_timeout: default_delivery_batch_timeout(),
            max_queue_size: default_delivery_max_queue_size(),
            workers: default_delivery_workers(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            org_id: String::new(),
            datastream_id: String::new(),
            timeout: default_registry_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: default_retry_base(),
            cap: default_retry_cap(),
            poll_interval: default_retry_poll_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.delivery.endpoint.is_empty() {
            bail!("delivery.endpoint is required");
        }

        if self.meta_client_name.is_empty() {
            bail!("meta_client_name is required");
        }

        if self.meta_network_name.is_empty() {
            bail!("meta_network_name is required");
        }

        if !(1..=100).contains(&self.batching.max_batch_size) {
            bail!("batching.max_batch_size must be between 1 and 100");
        }

        if self.batching.flush_interval.is_zero() {
            bail!("batching.flush_interval must be positive");
        }

        if let Some(wait) = self.batching.max_wait_time {
            if wait < self.batching.flush_interval {
                bail!("batching.max_wait_time must be at least the flush interval");
            }
        }

        if self.delivery.max_queue_size == 0 {
            bail!("delivery.max_queue_size must be positive");
        }
        if self.delivery.batch_size == 0 {
            bail!("delivery.batch_size must be positive");
        }
        if self.delivery.workers == 0 {
            bail!("delivery.workers must be positive");
        }

        match self.delivery.compression.as_str() {
            "none" | "gzip" => {}
            other => bail!("invalid compression type: {other}"),
        }

        if !self.registry.endpoint.is_empty() {
            if self.registry.org_id.is_empty() {
                bail!("registry.org_id is required when registry.endpoint is set");
            }
            if self.registry.datastream_id.is_empty() {
                bail!("registry.datastream_id is required when registry.endpoint is set");
            }
        }

        if self.retry.base.is_zero() {
            bail!("retry.base must be positive");
        }
        if self.retry.cap < self.retry.base {
            bail!("retry.cap must be at least retry.base");
        }
        if self.retry.poll_interval.is_zero() {
            bail!("retry.poll_interval must be positive");
        }

        Ok(())
    }

    /// Effective maximum wait before a forced flush.
    ///
    /// Defaults to 2.5x the flush interval when not set explicitly.
    pub fn max_wait_time(&self) -> Duration {
        self.batching
            .max_wait_time
            .unwrap_or_else(|| self.batching.flush_interval.mul_f64(2.5))
    }
}

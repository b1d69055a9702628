use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::cache::ring::DEFAULT_CAPACITY;

/// Top-level configuration for the netquality ingestion service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Per-node sample cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Batch persistence.
    #[serde(default)]
    pub writer: WriterConfig,

    /// Durable sink selection. Exactly one must be enabled.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Per-node ring buffer cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Samples retained per node. Default: 60.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Interval of the background aggregation sweep. Default: 1m.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Persist completed minute aggregates through the batch writer. Default: false.
    #[serde(default)]
    pub persist_aggregates: bool,
}

/// Batch writer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Records the ingestion queue holds before rejecting writes. Default: 1000.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Records per committed batch. Default: 100.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time a partial batch waits before flushing. Default: 1m.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Total flush attempts per batch, including the first. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry. Default: 1s.
    #[serde(default = "default_retry_base_delay", with = "humantime_serde")]
    pub retry_base_delay: Duration,

    /// Backoff growth factor between retries. Default: 2.0.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Upper bound for a single retry delay. Default: 30s.
    #[serde(default = "default_max_retry_delay", with = "humantime_serde")]
    pub max_retry_delay: Duration,

    /// Bound on one begin/insert/commit attempt. Default: 30s.
    #[serde(default = "default_transaction_timeout", with = "humantime_serde")]
    pub transaction_timeout: Duration,
}

/// Durable sink configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SinkConfig {
    /// ClickHouse native-protocol sink.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// HTTP NDJSON sink (e.g., to Vector).
    #[serde(default)]
    pub http: HttpExportConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Enable the ClickHouse sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Target table name. Default: "network_metrics".
    #[serde(default = "default_table")]
    pub table: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,
}

/// HTTP export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to POST batches to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cache_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_transaction_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_database() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "network_metrics".to_string()
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            cache: CacheConfig::default(),
            writer: WriterConfig::default(),
            sink: SinkConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            sweep_interval: default_sweep_interval(),
            persist_aggregates: false,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            max_attempts: default_max_attempts(),
            retry_base_delay: default_retry_base_delay(),
            retry_multiplier: default_retry_multiplier(),
            max_retry_delay: default_max_retry_delay(),
            transaction_timeout: default_transaction_timeout(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            timeout: default_http_timeout(),
            keep_alive: true,
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

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cache.capacity == 0 {
            bail!("cache.capacity must be positive");
        }

        if self.cache.sweep_interval.is_zero() {
            bail!("cache.sweep_interval must be positive");
        }

        self.writer.validate()?;

        match (self.sink.clickhouse.enabled, self.sink.http.enabled) {
            (true, true) => bail!("only one of sink.clickhouse and sink.http may be enabled"),
            (false, false) => bail!("one of sink.clickhouse or sink.http must be enabled"),
            _ => {}
        }

        if self.sink.clickhouse.enabled {
            if self.sink.clickhouse.endpoint.is_empty() {
                bail!("clickhouse endpoint is required when enabled");
            }
            if self.sink.clickhouse.table.is_empty() {
                bail!("clickhouse table is required when enabled");
            }
        }

        if self.sink.http.enabled {
            if self.sink.http.address.is_empty() {
                bail!("http address is required when enabled");
            }

            if self.sink.http.timeout.is_zero() {
                bail!("http timeout must be positive when enabled");
            }

            let compression = &self.sink.http.compression;
            match compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        Ok(())
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("writer.queue_capacity must be positive");
        }

        if self.batch_size == 0 {
            bail!("writer.batch_size must be positive");
        }

        if self.flush_interval.is_zero() {
            bail!("writer.flush_interval must be positive");
        }

        if self.max_attempts == 0 {
            bail!("writer.max_attempts must be at least 1");
        }

        if !(self.retry_multiplier >= 1.0 && self.retry_multiplier.is_finite()) {
            bail!(
                "writer.retry_multiplier must be a finite value >= 1, got {}",
                self.retry_multiplier
            );
        }

        if self.max_retry_delay < self.retry_base_delay {
            bail!("writer.max_retry_delay must not be shorter than writer.retry_base_delay");
        }

        if self.transaction_timeout.is_zero() {
            bail!("writer.transaction_timeout must be positive");
        }

        Ok(())
    }
}

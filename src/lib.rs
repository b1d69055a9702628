//! Network-quality sample ingestion.
//!
//! Samples from monitored nodes are kept in a per-node rolling cache for
//! fast reads and minute aggregation, and independently queued for batched,
//! retried persistence to ClickHouse or an HTTP endpoint.

pub mod agent;
pub mod cache;
pub mod config;
pub mod export;
pub mod metric;
pub mod sink;
pub mod writer;

pub use cache::{CacheError, MetricCache};
pub use metric::{AggregatedMetrics, MetricPoint, MetricRecord};
pub use writer::{BatchWriter, WriteError};

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;

/// One raw network-quality sample reported by a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub packet_loss_rate: f64,
    pub jitter_ms: f64,
}

impl MetricPoint {
    pub fn new(
        timestamp: DateTime<Utc>,
        latency_ms: f64,
        packet_loss_rate: f64,
        jitter_ms: f64,
    ) -> Self {
        Self {
            timestamp,
            latency_ms,
            packet_loss_rate,
            jitter_ms,
        }
    }
}

/// Per-minute summary of the samples buffered for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedMetrics {
    /// Start of the minute bucket.
    pub timestamp: DateTime<Utc>,
    pub latency_ms_avg: f64,
    pub latency_ms_max: f64,
    pub latency_ms_min: f64,
    pub packet_loss_rate_avg: f64,
    pub jitter_ms_avg: f64,
    /// Number of raw samples folded into this bucket.
    pub sample_count: usize,
}

/// Unit of work handed to the batch writer for durable storage.
///
/// Carries the identity fields a sample lacks while it lives in the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub node_id: String,
    pub probe_id: String,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub packet_loss_rate: f64,
    pub jitter_ms: f64,
    pub is_aggregated: bool,
}

impl MetricRecord {
    /// Builds a raw-sample record.
    pub fn from_point(
        node_id: impl Into<String>,
        probe_id: impl Into<String>,
        point: &MetricPoint,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            probe_id: probe_id.into(),
            timestamp: point.timestamp,
            latency_ms: point.latency_ms,
            packet_loss_rate: point.packet_loss_rate,
            jitter_ms: point.jitter_ms,
            is_aggregated: false,
        }
    }

    /// Builds a record from a minute aggregate. Latency is the bucket mean.
    pub fn from_aggregate(
        node_id: impl Into<String>,
        probe_id: impl Into<String>,
        agg: &AggregatedMetrics,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            probe_id: probe_id.into(),
            timestamp: agg.timestamp,
            latency_ms: agg.latency_ms_avg,
            packet_loss_rate: agg.packet_loss_rate_avg,
            jitter_ms: agg.jitter_ms_avg,
            is_aggregated: true,
        }
    }
}

/// Truncates a timestamp to the start of its minute.
pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::metric::{truncate_to_minute, AggregatedMetrics, MetricPoint};

/// Running sums for one minute bucket.
#[derive(Debug, Clone, Copy)]
struct MinuteAccumulator {
    count: usize,
    latency_sum: f64,
    latency_min: f64,
    latency_max: f64,
    packet_loss_sum: f64,
    jitter_sum: f64,
}

impl MinuteAccumulator {
    fn new() -> Self {
        Self {
            count: 0,
            latency_sum: 0.0,
            latency_min: f64::INFINITY,
            latency_max: f64::NEG_INFINITY,
            packet_loss_sum: 0.0,
            jitter_sum: 0.0,
        }
    }

    fn record(&mut self, point: &MetricPoint) {
        self.count += 1;
        self.latency_sum += point.latency_ms;
        self.latency_min = self.latency_min.min(point.latency_ms);
        self.latency_max = self.latency_max.max(point.latency_ms);
        self.packet_loss_sum += point.packet_loss_rate;
        self.jitter_sum += point.jitter_ms;
    }

    fn finish(&self, timestamp: DateTime<Utc>) -> AggregatedMetrics {
        // Buckets only exist once a point was recorded, so count >= 1.
        let n = self.count as f64;
        AggregatedMetrics {
            timestamp,
            latency_ms_avg: self.latency_sum / n,
            latency_ms_max: self.latency_max,
            latency_ms_min: self.latency_min,
            packet_loss_rate_avg: self.packet_loss_sum / n,
            jitter_ms_avg: self.jitter_sum / n,
            sample_count: self.count,
        }
    }
}

/// Groups points into minute buckets and summarises each one.
///
/// Output is ordered by ascending bucket timestamp regardless of the order
/// points were supplied in.
pub fn aggregate_by_minute<'a, I>(points: I) -> Vec<AggregatedMetrics>
where
    I: IntoIterator<Item = &'a MetricPoint>,
{
    let mut buckets: BTreeMap<DateTime<Utc>, MinuteAccumulator> = BTreeMap::new();

    for point in points {
        buckets
            .entry(truncate_to_minute(point.timestamp))
            .or_insert_with(MinuteAccumulator::new)
            .record(point);
    }

    buckets
        .iter()
        .map(|(ts, acc)| acc.finish(*ts))
        .collect()
}

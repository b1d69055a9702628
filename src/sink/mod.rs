pub mod clickhouse;
pub mod exporter;
pub mod http;

use std::future::Future;

use anyhow::{bail, Result};

use crate::metric::MetricRecord;

pub use self::exporter::{Exporter, ExporterTx};

/// Durable store the batch writer persists records into.
///
/// Every flush opens one transaction, inserts each record of the batch and
/// commits. Any failure rolls the transaction back so a batch is stored in
/// full or not at all.
pub trait Sink: Send + Sync + 'static {
    type Tx: Transaction;

    /// Returns the sink's name for logging and metric labels.
    fn name(&self) -> &str;

    /// Opens a transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// One open unit of work against a [`Sink`].
pub trait Transaction: Send {
    /// Stages a record. Nothing is visible until [`commit`](Self::commit).
    fn insert(&mut self, record: &MetricRecord) -> impl Future<Output = Result<()>> + Send;

    /// Makes every staged record durable.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    /// Discards every staged record.
    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}

/// Rejects records no store can key: every row needs a node id.
///
/// Value ranges are not checked here. One out-of-range sample would otherwise
/// fail every attempt of its batch and take the valid records down with it.
pub fn validate_record(record: &MetricRecord) -> Result<()> {
    if record.node_id.is_empty() {
        bail!("record has empty node_id");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::metric::MetricPoint;

    fn record() -> MetricRecord {
        MetricRecord::from_point(
            "node-a",
            "probe-1",
            &MetricPoint::new(Utc::now(), 12.0, 0.02, 1.5),
        )
    }

    #[test]
    fn test_validate_accepts_well_formed_record() {
        validate_record(&record()).expect("valid record");
    }

    #[test]
    fn test_validate_rejects_missing_node_id() {
        let mut r = record();
        r.node_id.clear();
        assert!(validate_record(&r).is_err());
    }

    #[test]
    fn test_validate_passes_values_through() {
        let mut r = record();
        r.packet_loss_rate = 2.5;
        r.latency_ms = -1.0;
        r.jitter_ms = f64::NAN;
        r.probe_id.clear();
        validate_record(&r).expect("store accepts any value");
    }
}

use anyhow::Result;

use crate::metric::MetricRecord;

use super::clickhouse::{ClickHouseSink, ClickHouseTx};
use super::http::{HttpSink, HttpTx};
use super::{Sink, Transaction};

/// Sink selected at runtime from configuration.
///
/// Enum dispatch keeps the batch writer generic over a concrete sink without
/// boxing every transaction future.
pub enum Exporter {
    ClickHouse(ClickHouseSink),
    Http(HttpSink),
}

/// Transaction of whichever sink an [`Exporter`] wraps.
pub enum ExporterTx {
    ClickHouse(ClickHouseTx),
    Http(HttpTx),
}

impl Sink for Exporter {
    type Tx = ExporterTx;

    fn name(&self) -> &str {
        match self {
            Self::ClickHouse(s) => s.name(),
            Self::Http(s) => s.name(),
        }
    }

    async fn begin(&self) -> Result<ExporterTx> {
        match self {
            Self::ClickHouse(s) => s.begin().await.map(ExporterTx::ClickHouse),
            Self::Http(s) => s.begin().await.map(ExporterTx::Http),
        }
    }
}

impl Transaction for ExporterTx {
    async fn insert(&mut self, record: &MetricRecord) -> Result<()> {
        match self {
            Self::ClickHouse(tx) => tx.insert(record).await,
            Self::Http(tx) => tx.insert(record).await,
        }
    }

    async fn commit(self) -> Result<()> {
        match self {
            Self::ClickHouse(tx) => tx.commit().await,
            Self::Http(tx) => tx.commit().await,
        }
    }

    async fn rollback(self) -> Result<()> {
        match self {
            Self::ClickHouse(tx) => tx.rollback().await,
            Self::Http(tx) => tx.rollback().await,
        }
    }
}

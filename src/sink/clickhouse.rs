use std::fmt::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::{ClientHandle, Pool};

use crate::metric::MetricRecord;

use super::{validate_record, Sink, Transaction};

const COLUMNS: &str =
    "node_id, probe_id, timestamp, latency_ms, packet_loss_rate, jitter_ms, is_aggregated";

/// ClickHouse sink writing one multi-row INSERT per committed transaction.
///
/// The native protocol has no multi-statement transactions, so rows are
/// staged client side and sent as a single statement on commit. ClickHouse
/// applies a single INSERT block atomically.
pub struct ClickHouseSink {
    pool: Pool,
    table: Arc<str>,
}

impl ClickHouseSink {
    pub fn new(pool: Pool, database: &str, table: &str) -> Self {
        Self {
            pool,
            table: Arc::from(format!("{database}.{table}")),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl Sink for ClickHouseSink {
    type Tx = ClickHouseTx;

    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn begin(&self) -> Result<ClickHouseTx> {
        let handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for metrics insert")?;

        Ok(ClickHouseTx {
            handle,
            statement: InsertStatement::new(&self.table),
        })
    }
}

/// Open ClickHouse transaction holding a pooled connection and staged rows.
pub struct ClickHouseTx {
    handle: ClientHandle,
    statement: InsertStatement,
}

impl Transaction for ClickHouseTx {
    async fn insert(&mut self, record: &MetricRecord) -> Result<()> {
        validate_record(record)?;
        self.statement.push(record);
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        if self.statement.rows == 0 {
            return Ok(());
        }

        let rows = self.statement.rows;
        self.handle
            .execute(self.statement.sql.as_str())
            .await
            .with_context(|| format!("inserting {rows} rows"))?;

        tracing::debug!(rows, "committed ClickHouse insert");

        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        // Nothing reached the server; dropping the staged SQL is enough.
        Ok(())
    }
}

/// Incrementally built `INSERT ... VALUES` statement.
struct InsertStatement {
    sql: String,
    rows: usize,
}

impl InsertStatement {
    fn new(table: &str) -> Self {
        let mut sql = String::with_capacity(64 + table.len() + COLUMNS.len() + 128 * 16);
        let _ = write!(sql, "INSERT INTO {table} ({COLUMNS}) VALUES ");
        Self { sql, rows: 0 }
    }

    fn push(&mut self, record: &MetricRecord) {
        if self.rows > 0 {
            self.sql.push_str(", ");
        }

        let _ = write!(
            self.sql,
            "('{}', '{}', {}, {}, {}, {}, {})",
            escape_sql(&record.node_id),
            escape_sql(&record.probe_id),
            format_datetime(record.timestamp),
            format_float(record.latency_ms),
            format_float(record.packet_loss_rate),
            format_float(record.jitter_ms),
            u8::from(record.is_aggregated),
        );
        self.rows += 1;
    }
}

/// Formats a timestamp as a quoted DateTime64(3) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Formats a Float64 literal, spelling non-finite values the way ClickHouse parses them.
fn format_float(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        v.to_string()
    }
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

pub mod health;

use std::time::Duration;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;

/// Upper bound on opening the first connection and pinging it.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the ClickHouse native-protocol connection pool used by the sink.
///
/// The pool is LZ4-compressed and sized 2..5 connections. Only one flush
/// runs at a time, so the upper bound is rarely reached.
pub struct ClickHouseWriter {
    cfg: ClickHouseConfig,
    pool: Option<Pool>,
}

impl ClickHouseWriter {
    pub fn new(cfg: ClickHouseConfig) -> Self {
        Self { cfg, pool: None }
    }

    /// Opens the pool and verifies the server answers a ping.
    pub async fn start(&mut self) -> Result<()> {
        let pool = Pool::new(build_dsn(&self.cfg));

        tokio::time::timeout(CONNECT_TIMEOUT, ping(&pool))
            .await
            .with_context(|| format!("connecting to ClickHouse at {}", self.cfg.endpoint))??;

        tracing::info!(
            endpoint = %self.cfg.endpoint,
            database = %self.cfg.database,
            "ClickHouse pool connected"
        );

        self.pool = Some(pool);

        Ok(())
    }

    /// Returns the connection pool, if started.
    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    /// Releases the pool. Idle connections close when the last clone drops.
    pub async fn stop(&mut self) -> Result<()> {
        if self.pool.take().is_some() {
            tracing::debug!(endpoint = %self.cfg.endpoint, "ClickHouse pool released");
        }
        Ok(())
    }
}

async fn ping(pool: &Pool) -> Result<()> {
    let mut handle = pool
        .get_handle()
        .await
        .context("opening ClickHouse connection")?;
    handle.ping().await.context("pinging ClickHouse")?;
    Ok(())
}

/// Builds a clickhouse-rs TCP DSN: `tcp://[user[:pass]@]host:port/database?options`.
fn build_dsn(cfg: &ClickHouseConfig) -> String {
    let auth = match (cfg.username.is_empty(), cfg.password.is_empty()) {
        (true, _) => String::new(),
        (false, true) => format!("{}@", cfg.username),
        (false, false) => format!("{}:{}@", cfg.username, cfg.password),
    };

    format!(
        "tcp://{auth}{}/{}?compression=lz4&pool_min=2&pool_max=5",
        cfg.endpoint, cfg.database
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(username: &str, password: &str) -> ClickHouseConfig {
        ClickHouseConfig {
            enabled: true,
            endpoint: "ch:9000".to_string(),
            database: "netq".to_string(),
            username: username.to_string(),
            password: password.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_dsn_auth_variants() {
        assert_eq!(
            build_dsn(&cfg("", "")),
            "tcp://ch:9000/netq?compression=lz4&pool_min=2&pool_max=5"
        );
        assert_eq!(
            build_dsn(&cfg("ingest", "")),
            "tcp://ingest@ch:9000/netq?compression=lz4&pool_min=2&pool_max=5"
        );
        assert_eq!(
            build_dsn(&cfg("ingest", "s3cret")),
            "tcp://ingest:s3cret@ch:9000/netq?compression=lz4&pool_min=2&pool_max=5"
        );
        // A password without a user is ignored.
        assert_eq!(
            build_dsn(&cfg("", "orphan")),
            "tcp://ch:9000/netq?compression=lz4&pool_min=2&pool_max=5"
        );
    }

    #[tokio::test]
    async fn test_stop_before_start_is_harmless() {
        let mut writer = ClickHouseWriter::new(cfg("", ""));
        assert!(writer.pool().is_none());
        writer.stop().await.expect("stop");
    }
}

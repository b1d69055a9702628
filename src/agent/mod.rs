pub mod feed;
pub mod pipeline;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseWriter;
use crate::metric::MetricPoint;
use crate::sink::clickhouse::ClickHouseSink;
use crate::sink::http::HttpSink;
use crate::sink::Exporter;

pub use self::pipeline::{IngestError, Pipeline};

/// Agent owns the health server, the sink connection and the pipeline.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    ch_writer: Option<ClickHouseWriter>,
    pipeline: Option<Pipeline<Exporter>>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            ch_writer: None,
            pipeline: None,
        })
    }

    /// Starts the health server, connects the sink and starts the pipeline.
    pub async fn start(&mut self) -> Result<()> {
        // Health first so probes respond while the sink connects.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let exporter = self.build_exporter().await?;
        let pipeline = Pipeline::new(&self.cfg, exporter, Some(Arc::clone(&self.health)));
        pipeline.start();
        self.pipeline = Some(pipeline);

        info!(
            cache_capacity = self.cfg.cache.capacity,
            persist_aggregates = self.cfg.cache.persist_aggregates,
            "agent fully started"
        );

        Ok(())
    }

    /// Ingests one sample. Fails with [`IngestError::NotRunning`] before start.
    pub fn ingest(
        &self,
        node_id: &str,
        probe_id: &str,
        point: MetricPoint,
    ) -> Result<(), IngestError> {
        self.pipeline
            .as_ref()
            .ok_or(IngestError::NotRunning)?
            .ingest(node_id, probe_id, point)
    }

    pub fn pipeline(&self) -> Option<&Pipeline<Exporter>> {
        self.pipeline.as_ref()
    }

    /// Gracefully stop all components. The pipeline drains before the sink closes.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop().await;

            let stats = pipeline.writer().stats();
            info!(
                accepted = stats.accepted,
                committed = stats.records_committed,
                dropped_queue_full = stats.dropped_queue_full,
                dropped_after_retries = stats.dropped_after_retries,
                "pipeline stopped"
            );
        }

        if let Some(writer) = &mut self.ch_writer {
            if let Err(e) = writer.stop().await {
                error!(error = %e, "error stopping ClickHouse writer");
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    async fn build_exporter(&mut self) -> Result<Exporter> {
        if self.cfg.sink.clickhouse.enabled {
            let mut writer = ClickHouseWriter::new(self.cfg.sink.clickhouse.clone());
            writer.start().await.context("starting ClickHouse writer")?;

            let pool = writer
                .pool()
                .context("ClickHouse pool missing after start")?
                .clone();
            let sink = ClickHouseSink::new(
                pool,
                &self.cfg.sink.clickhouse.database,
                &self.cfg.sink.clickhouse.table,
            );
            self.ch_writer = Some(writer);

            info!(
                endpoint = %self.cfg.sink.clickhouse.endpoint,
                table = sink.table(),
                "ClickHouse sink configured",
            );

            return Ok(Exporter::ClickHouse(sink));
        }

        let sink = HttpSink::new(self.cfg.sink.http.clone()).context("creating HTTP sink")?;

        info!(
            address = %self.cfg.sink.http.address,
            compression = %self.cfg.sink.http.compression,
            "HTTP sink configured",
        );

        Ok(Exporter::Http(sink))
    }
}

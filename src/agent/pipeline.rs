use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheError, MetricCache, SweepHook};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::metric::{truncate_to_minute, MetricPoint, MetricRecord};
use crate::sink::Sink;
use crate::writer::{BatchWriter, WriteError};

/// Why a sample was not fully ingested.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestError {
    #[error("cache rejected sample: {0}")]
    Cache(#[from] CacheError),

    #[error("writer rejected record: {0}")]
    Write(#[from] WriteError),

    #[error("pipeline is not running")]
    NotRunning,
}

/// The cache and the batch writer fed side by side.
///
/// Every sample goes to the node's ring buffer and, independently, to the
/// writer queue. When aggregate persistence is enabled the cache sweep also
/// hands completed minute buckets to the writer.
pub struct Pipeline<S: Sink> {
    cache: MetricCache,
    writer: Arc<BatchWriter<S>>,
    persist_aggregates: bool,
}

impl<S: Sink> Pipeline<S> {
    pub fn new(cfg: &Config, sink: S, health: Option<Arc<HealthMetrics>>) -> Self {
        let mut cache = MetricCache::new(cfg.cache.clone());
        if let Some(health) = &health {
            cache = cache.with_health(Arc::clone(health));
        }

        let writer = Arc::new(BatchWriter::with_health(cfg.writer.clone(), sink, health));

        if cfg.cache.persist_aggregates {
            cache.on_sweep(persist_completed_minutes(Arc::clone(&writer)));
        }

        Self {
            cache,
            writer,
            persist_aggregates: cfg.cache.persist_aggregates,
        }
    }

    pub fn start(&self) {
        self.cache.start();
        self.writer.start();
    }

    /// Stops the sweep first so no aggregate arrives after the writer drains.
    pub async fn stop(&self) {
        self.cache.stop().await;

        if self.persist_aggregates {
            self.cache.sweep_now();
        }

        self.writer.stop().await;
    }

    /// Stores the sample in the cache and queues it for persistence.
    ///
    /// A sample rejected by the cache is not queued. A full writer queue
    /// leaves the cached copy in place.
    pub fn ingest(
        &self,
        node_id: &str,
        probe_id: &str,
        point: MetricPoint,
    ) -> Result<(), IngestError> {
        self.cache.store(node_id, point)?;
        self.writer
            .write(MetricRecord::from_point(node_id, probe_id, &point))?;
        Ok(())
    }

    pub fn cache(&self) -> &MetricCache {
        &self.cache
    }

    pub fn writer(&self) -> &BatchWriter<S> {
        &self.writer
    }
}

/// Builds a sweep hook that writes each node's completed minutes once.
///
/// Only buckets strictly before the current minute and after the last one
/// persisted for the node are written. A rejected write stops the node's
/// pass so the bucket is retried on the next sweep.
fn persist_completed_minutes<S: Sink>(writer: Arc<BatchWriter<S>>) -> SweepHook {
    let persisted: DashMap<String, DateTime<Utc>> = DashMap::new();

    Box::new(move |node_id, aggregates| {
        let current_minute = truncate_to_minute(Utc::now());
        let since = persisted.get(node_id).map(|e| *e.value());
        let mut newest = since;

        for agg in aggregates {
            if agg.timestamp >= current_minute || since.is_some_and(|s| agg.timestamp <= s) {
                continue;
            }

            match writer.write(MetricRecord::from_aggregate(node_id, "", agg)) {
                Ok(()) => newest = Some(agg.timestamp),
                Err(e) => {
                    warn!(node_id, minute = %agg.timestamp, error = %e, "deferring minute aggregate");
                    break;
                }
            }
        }

        if newest != since {
            if let Some(ts) = newest {
                debug!(node_id, minute = %ts, "persisted minute aggregates");
                persisted.insert(node_id.to_string(), ts);
            }
        }
    })
}

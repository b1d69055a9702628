use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::Utc;
use netquality::agent::feed::{run_ndjson, FeedSummary};
use netquality::agent::{IngestError, Pipeline};
use netquality::config::{CacheConfig, Config, WriterConfig};
use netquality::metric::truncate_to_minute;
use netquality::sink::{Sink, Transaction};
use netquality::{CacheError, MetricPoint, MetricRecord};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorded {
    batches: parking_lot::Mutex<Vec<Vec<MetricRecord>>>,
    failing: AtomicBool,
}

impl Recorded {
    fn records(&self) -> Vec<MetricRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    fn aggregated(&self) -> Vec<MetricRecord> {
        self.records().into_iter().filter(|r| r.is_aggregated).collect()
    }
}

struct RecordingSink(Arc<Recorded>);

struct RecordingTx {
    state: Arc<Recorded>,
    staged: Vec<MetricRecord>,
}

impl Sink for RecordingSink {
    type Tx = RecordingTx;

    fn name(&self) -> &str {
        "recording"
    }

    async fn begin(&self) -> Result<RecordingTx> {
        if self.0.failing.load(Ordering::SeqCst) {
            bail!("store offline");
        }
        Ok(RecordingTx {
            state: Arc::clone(&self.0),
            staged: Vec::new(),
        })
    }
}

impl Transaction for RecordingTx {
    async fn insert(&mut self, record: &MetricRecord) -> Result<()> {
        self.staged.push(record.clone());
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.state.batches.lock().push(self.staged);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

fn config(cache: CacheConfig, writer: WriterConfig) -> Config {
    Config {
        cache,
        writer,
        ..Default::default()
    }
}

fn fast_writer(batch_size: usize) -> WriterConfig {
    WriterConfig {
        batch_size,
        flush_interval: Duration::from_secs(3600),
        retry_base_delay: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

fn pipeline(cfg: &Config) -> (Pipeline<RecordingSink>, Arc<Recorded>) {
    let state = Arc::new(Recorded::default());
    let pipeline = Pipeline::new(cfg, RecordingSink(Arc::clone(&state)), None);
    (pipeline, state)
}

fn point(offset_secs: i64, latency: f64) -> MetricPoint {
    MetricPoint::new(
        Utc::now() + chrono::Duration::seconds(offset_secs),
        latency,
        0.01,
        2.0,
    )
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn ingest_feeds_cache_and_writer_independently() {
    let cfg = config(CacheConfig::default(), fast_writer(10));
    let (pipeline, state) = pipeline(&cfg);
    pipeline.start();

    for i in 0..25 {
        let node = format!("node-{}", i % 3);
        pipeline
            .ingest(&node, "probe-1", point(i, i as f64))
            .expect("ingest");
    }

    pipeline.stop().await;

    assert_eq!(pipeline.cache().len(), 3);
    assert_eq!(pipeline.cache().get("node-0").len(), 9);
    assert_eq!(pipeline.cache().get("node-1").len(), 8);
    assert_eq!(pipeline.cache().get("node-2").len(), 8);

    let records = state.records();
    assert_eq!(records.len(), 25);
    assert!(records.iter().all(|r| !r.is_aggregated));
    assert!(state.batches.lock().iter().all(|b| b.len() <= 10));
    assert_eq!(pipeline.writer().buffer_size(), 0);

    // Reads keep working after shutdown.
    assert!(!pipeline.cache().aggregate_metrics_by_node("node-0").is_empty());
}

#[tokio::test]
async fn rejected_sample_is_not_queued() {
    let cfg = config(CacheConfig::default(), fast_writer(10));
    let (pipeline, state) = pipeline(&cfg);

    assert_eq!(
        pipeline.ingest("", "probe-1", point(0, 1.0)),
        Err(IngestError::Cache(CacheError::EmptyNodeId))
    );
    assert_eq!(pipeline.writer().stats().accepted, 0);

    pipeline.stop().await;
    assert!(state.records().is_empty());
}

#[tokio::test]
async fn completed_minutes_are_persisted_once() {
    let cfg = config(
        CacheConfig {
            sweep_interval: Duration::from_millis(30),
            persist_aggregates: true,
            ..Default::default()
        },
        WriterConfig {
            flush_interval: Duration::from_millis(20),
            ..fast_writer(100)
        },
    );
    let (pipeline, state) = pipeline(&cfg);

    let ten_ago = truncate_to_minute(Utc::now()) - chrono::Duration::minutes(10);
    let nine_ago = ten_ago + chrono::Duration::minutes(1);
    for (ts, latency) in [
        (ten_ago, 100.0),
        (ten_ago + chrono::Duration::seconds(20), 140.0),
        (nine_ago, 50.0),
    ] {
        pipeline
            .ingest("node-a", "probe-1", MetricPoint::new(ts, latency, 0.0, 1.0))
            .expect("ingest");
    }

    pipeline.start();
    wait_until(|| state.aggregated().len() == 2).await;

    // Several more sweeps must not persist the same minutes again.
    tokio::time::sleep(Duration::from_millis(150)).await;
    pipeline.stop().await;

    let aggregated = state.aggregated();
    assert_eq!(aggregated.len(), 2);
    assert_eq!(aggregated[0].timestamp, ten_ago);
    assert_eq!(aggregated[0].latency_ms, 120.0);
    assert_eq!(aggregated[1].timestamp, nine_ago);
    assert_eq!(aggregated[1].latency_ms, 50.0);
    assert!(aggregated.iter().all(|r| r.node_id == "node-a"));

    assert_eq!(state.records().iter().filter(|r| !r.is_aggregated).count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_keep_last_capacity_samples() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 50;

    let cfg = config(
        CacheConfig {
            capacity: 60,
            ..Default::default()
        },
        fast_writer(100),
    );
    let (pipeline, state) = pipeline(&cfg);
    pipeline.start();

    std::thread::scope(|s| {
        for p in 0..PRODUCERS {
            let pipeline = &pipeline;
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    pipeline
                        .ingest("shared", &format!("probe-{p}"), point(i as i64, p as f64))
                        .expect("ingest");
                }
            });
        }
    });

    assert_eq!(pipeline.cache().get("shared").len(), 60);

    pipeline.stop().await;

    let stats = pipeline.writer().stats();
    assert_eq!(stats.accepted, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(state.records().len(), PRODUCERS * PER_PRODUCER);
}

#[tokio::test]
async fn failed_store_does_not_block_ingestion() {
    let mut writer = fast_writer(2);
    writer.max_attempts = 2;
    let cfg = config(CacheConfig::default(), writer);
    let (pipeline, state) = pipeline(&cfg);
    state.failing.store(true, Ordering::SeqCst);
    pipeline.start();

    pipeline.ingest("node-a", "probe-1", point(0, 1.0)).expect("ingest");
    pipeline.ingest("node-a", "probe-1", point(1, 2.0)).expect("ingest");
    wait_until(|| pipeline.writer().stats().dropped_after_retries == 2).await;

    state.failing.store(false, Ordering::SeqCst);
    pipeline.ingest("node-a", "probe-1", point(2, 3.0)).expect("ingest");
    pipeline.ingest("node-a", "probe-1", point(3, 4.0)).expect("ingest");
    pipeline.stop().await;

    let latencies: Vec<f64> = state.records().iter().map(|r| r.latency_ms).collect();
    assert_eq!(latencies, vec![3.0, 4.0]);
    assert_eq!(pipeline.cache().get("node-a").len(), 4);
}

#[tokio::test]
async fn ndjson_feed_skips_bad_lines() {
    let cfg = config(CacheConfig::default(), fast_writer(10));
    let (pipeline, state) = pipeline(&cfg);

    let input = br#"{"node_id":"node-a","probe_id":"p1","latency_ms":12.5,"packet_loss_rate":0.1,"jitter_ms":1.0}
not json

{"node_id":"","probe_id":"p1","latency_ms":1.0}
{"node_id":"node-b","probe_id":"p2","timestamp":"2024-05-01T10:00:30Z","latency_ms":30.0}
{"node_id":"node-c","probe_id":"p3","latency_ms":5.0,"packet_loss_rate":2.5}
{"node_id":"node-c","probe_id":"p3","latency_ms":-4.0}
"#;

    let summary = run_ndjson(&input[..], &pipeline, CancellationToken::new())
        .await
        .expect("feed");

    assert_eq!(
        summary,
        FeedSummary {
            ingested: 2,
            malformed: 1,
            rejected: 3,
        }
    );

    let node_b = pipeline.cache().get("node-b");
    assert_eq!(node_b.len(), 1);
    assert_eq!(node_b[0].timestamp.to_rfc3339(), "2024-05-01T10:00:30+00:00");
    assert_eq!(node_b[0].packet_loss_rate, 0.0);
    assert!(pipeline.cache().get("node-c").is_empty());

    pipeline.stop().await;
    assert_eq!(state.records().len(), 2);
}

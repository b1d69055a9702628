pub mod retry;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WriterConfig;
use crate::export::health::HealthMetrics;
use crate::metric::MetricRecord;
use crate::sink::{Sink, Transaction};

use self::retry::RetryPolicy;

/// Shortest flush interval the consumer ticks at; zero is raised to this.
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Synchronous rejections returned by [`BatchWriter::write`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    #[error("metric record is missing")]
    NilRecord,

    #[error("write queue is full")]
    QueueFull,

    #[error("batch writer is closed")]
    Closed,
}

/// What caused a batch to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The in-flight batch reached the configured batch size.
    Size,
    /// The flush interval elapsed with a partial batch.
    Timer,
    /// The consumer was cancelled with a partial batch.
    Shutdown,
    /// Records left in the queue after the consumer stopped.
    Drain,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timer => "timer",
            Self::Shutdown => "shutdown",
            Self::Drain => "drain",
        }
    }
}

/// Lifetime counters for a writer.
#[derive(Debug, Default)]
pub struct WriterStats {
    accepted: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_after_retries: AtomicU64,
    batches_committed: AtomicU64,
    records_committed: AtomicU64,
    flush_failures: AtomicU64,
}

/// Point-in-time copy of [`WriterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStatsSnapshot {
    pub accepted: u64,
    pub dropped_queue_full: u64,
    pub dropped_after_retries: u64,
    pub batches_committed: u64,
    pub records_committed: u64,
    pub flush_failures: u64,
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            dropped_after_retries: self.dropped_after_retries.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            records_committed: self.records_committed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

/// Records accepted but not yet handed to a flush.
struct Backlog {
    tx: mpsc::Sender<MetricRecord>,
    in_flight: AtomicUsize,
}

impl Backlog {
    fn queued(&self) -> usize {
        self.tx.max_capacity().saturating_sub(self.tx.capacity())
    }

    fn len(&self) -> usize {
        self.queued() + self.in_flight.load(Ordering::Acquire)
    }
}

/// Persists batches through a sink with retries.
struct Flusher<S> {
    sink: Arc<S>,
    retry: RetryPolicy,
    transaction_timeout: Duration,
    stats: Arc<WriterStats>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: Sink> Flusher<S> {
    /// Flushes one batch, retrying with backoff. Returns whether it committed.
    async fn flush(&self, batch: Vec<MetricRecord>, trigger: FlushTrigger) -> bool {
        if batch.is_empty() {
            return true;
        }

        let sink = self.sink.name();
        let records = batch.len();
        let started = Instant::now();
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;

            match self.attempt(&batch).await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    if let Some(health) = &self.health {
                        health.flush_attempt_errors.with_label_values(&[sink]).inc();
                    }

                    if !self.retry.should_retry(attempt) {
                        break Err(e);
                    }

                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        sink,
                        records,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "batch flush failed, retrying",
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        };

        if let Some(health) = &self.health {
            health
                .flush_duration
                .with_label_values(&[sink])
                .observe(started.elapsed().as_secs_f64());
        }

        match result {
            Ok(()) => {
                self.stats.batches_committed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .records_committed
                    .fetch_add(records as u64, Ordering::Relaxed);

                if let Some(health) = &self.health {
                    health
                        .batches_flushed
                        .with_label_values(&[trigger.as_str()])
                        .inc();
                    health.records_committed.inc_by(records as f64);
                    health.batch_size.observe(records as f64);
                }

                debug!(
                    sink,
                    records,
                    attempts = attempt,
                    trigger = trigger.as_str(),
                    "flushed batch",
                );

                true
            }
            Err(e) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .dropped_after_retries
                    .fetch_add(records as u64, Ordering::Relaxed);

                if let Some(health) = &self.health {
                    health.batch_flush_failures.inc();
                    health
                        .records_dropped
                        .with_label_values(&["retry_exhausted"])
                        .inc_by(records as f64);
                }

                error!(
                    sink,
                    records,
                    attempts = attempt,
                    trigger = trigger.as_str(),
                    error = ?e,
                    "dropping batch after exhausting retries",
                );

                false
            }
        }
    }

    /// One transactional attempt bounded by the transaction timeout.
    async fn attempt(&self, batch: &[MetricRecord]) -> Result<()> {
        match tokio::time::timeout(self.transaction_timeout, self.transact(batch)).await {
            Ok(result) => result,
            Err(_) => bail!(
                "transaction timed out after {:?}",
                self.transaction_timeout
            ),
        }
    }

    async fn transact(&self, batch: &[MetricRecord]) -> Result<()> {
        let mut tx = self.sink.begin().await.context("beginning transaction")?;

        for record in batch {
            if let Err(e) = tx.insert(record).await {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "transaction rollback failed");
                }
                return Err(e.context(format!("inserting record for node {}", record.node_id)));
            }
        }

        tx.commit().await.context("committing transaction")
    }
}

/// Bounded asynchronous writer that persists records in batches.
///
/// Producers call [`write`](Self::write), which never waits on I/O. A single
/// background consumer groups records into batches and flushes them when the
/// batch is full, when the flush interval elapses, or on shutdown. Each flush
/// runs in one sink transaction and is retried with exponential backoff; a
/// batch that still fails is dropped and counted.
pub struct BatchWriter<S: Sink> {
    cfg: WriterConfig,
    backlog: Arc<Backlog>,
    rx: Arc<AsyncMutex<mpsc::Receiver<MetricRecord>>>,
    run_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    flusher: Arc<Flusher<S>>,
    stats: Arc<WriterStats>,
    health: Option<Arc<HealthMetrics>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl<S: Sink> BatchWriter<S> {
    /// Creates a stopped writer. Records written before [`start`](Self::start)
    /// are queued.
    pub fn new(cfg: WriterConfig, sink: S) -> Self {
        Self::with_health(cfg, sink, None)
    }

    pub fn with_health(
        mut cfg: WriterConfig,
        sink: S,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        cfg.queue_capacity = cfg.queue_capacity.max(1);
        cfg.batch_size = cfg.batch_size.max(1);
        cfg.flush_interval = cfg.flush_interval.max(MIN_FLUSH_INTERVAL);

        let (tx, rx) = mpsc::channel(cfg.queue_capacity);
        let stats = Arc::new(WriterStats::default());

        let flusher = Arc::new(Flusher {
            sink: Arc::new(sink),
            retry: RetryPolicy::from_config(&cfg),
            transaction_timeout: cfg.transaction_timeout,
            stats: Arc::clone(&stats),
            health: health.clone(),
        });

        Self {
            cfg,
            backlog: Arc::new(Backlog {
                tx,
                in_flight: AtomicUsize::new(0),
            }),
            rx: Arc::new(AsyncMutex::new(rx)),
            run_task: parking_lot::Mutex::new(None),
            started: AtomicBool::new(false),
            flusher,
            stats,
            health,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Enqueues a record without blocking.
    pub fn write(&self, record: impl Into<Option<MetricRecord>>) -> Result<(), WriteError> {
        let Some(record) = record.into() else {
            return Err(WriteError::NilRecord);
        };

        if self.closed.load(Ordering::Acquire) {
            self.record_drop("closed");
            return Err(WriteError::Closed);
        }

        match self.backlog.tx.try_send(record) {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                if let Some(health) = &self.health {
                    health.records_accepted.inc();
                    health.queue_depth.set(self.backlog.len() as f64);
                }
                Ok(())
            }
            Err(TrySendError::Full(record)) => {
                self.stats.dropped_queue_full.fetch_add(1, Ordering::Relaxed);
                self.record_drop("queue_full");
                warn!(
                    node_id = %record.node_id,
                    capacity = self.cfg.queue_capacity,
                    "write queue full, dropping record",
                );
                Err(WriteError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.record_drop("closed");
                Err(WriteError::Closed)
            }
        }
    }

    /// Launches the background consumer. Calling it again is a no-op.
    pub fn start(&self) {
        if self.closed.load(Ordering::Acquire) {
            warn!("batch writer already stopped, not starting");
            return;
        }

        if self.started.swap(true, Ordering::AcqRel) {
            warn!("batch writer already started");
            return;
        }

        // The consumer holds the receiver until it exits. The lock is released
        // even if the task panics, so stop can still drain the queue.
        let rx = match Arc::clone(&self.rx).try_lock_owned() {
            Ok(rx) => rx,
            Err(_) => {
                warn!("batch writer receiver busy, not starting");
                return;
            }
        };

        let task = tokio::spawn(run_consumer(
            rx,
            Arc::clone(&self.flusher),
            Arc::clone(&self.backlog),
            self.health.clone(),
            self.cfg.batch_size,
            self.cfg.flush_interval,
            self.cancel.clone(),
        ));
        *self.run_task.lock() = Some(task);

        info!(
            sink = self.flusher.sink.name(),
            queue_capacity = self.cfg.queue_capacity,
            batch_size = self.cfg.batch_size,
            flush_interval = ?self.cfg.flush_interval,
            "batch writer started",
        );
    }

    /// Stops the consumer, then drains and flushes everything still queued.
    ///
    /// After this returns the queue is closed, further writes fail with
    /// [`WriteError::Closed`] and [`buffer_size`](Self::buffer_size) is zero.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();

        let run_task = { self.run_task.lock().take() };
        if let Some(task) = run_task {
            if let Err(e) = task.await {
                let lost = self.backlog.in_flight.swap(0, Ordering::AcqRel);
                self.stats
                    .dropped_after_retries
                    .fetch_add(lost as u64, Ordering::Relaxed);
                error!(error = %e, lost, "batch writer consumer task failed");
            }
        }

        let mut rx = self.rx.lock().await;

        // No send can succeed after close, so the drain below sees every
        // accepted record.
        rx.close();

        let batch_size = self.cfg.batch_size;
        let mut batch = Vec::with_capacity(batch_size);
        let mut drained = 0usize;

        while let Ok(record) = rx.try_recv() {
            batch.push(record);
            drained += 1;
            self.backlog.in_flight.store(batch.len(), Ordering::Release);

            if batch.len() >= batch_size {
                let full = take_batch(&mut batch, batch_size, &self.backlog);
                self.flusher.flush(full, FlushTrigger::Drain).await;
            }
        }

        let rest = take_batch(&mut batch, batch_size, &self.backlog);
        self.flusher.flush(rest, FlushTrigger::Drain).await;

        if let Some(health) = &self.health {
            health.queue_depth.set(self.backlog.len() as f64);
        }

        let stats = self.stats.snapshot();
        info!(
            drained,
            committed = stats.records_committed,
            dropped = stats.dropped_after_retries,
            "batch writer stopped",
        );
    }

    /// Records accepted but not yet handed to a flush (queued + in-flight batch).
    pub fn buffer_size(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WriterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn sink(&self) -> &S {
        &self.flusher.sink
    }

    fn record_drop(&self, reason: &str) {
        if let Some(health) = &self.health {
            health.records_dropped.with_label_values(&[reason]).inc();
        }
    }
}

/// Single consumer: accumulates records and applies the flush triggers.
async fn run_consumer<S: Sink>(
    mut rx: OwnedMutexGuard<mpsc::Receiver<MetricRecord>>,
    flusher: Arc<Flusher<S>>,
    backlog: Arc<Backlog>,
    health: Option<Arc<HealthMetrics>>,
    batch_size: usize,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let rest = take_batch(&mut batch, batch_size, &backlog);
                flusher.flush(rest, FlushTrigger::Shutdown).await;
                break;
            }

            maybe = rx.recv() => {
                let Some(record) = maybe else {
                    let rest = take_batch(&mut batch, batch_size, &backlog);
                    flusher.flush(rest, FlushTrigger::Shutdown).await;
                    break;
                };

                batch.push(record);
                backlog.in_flight.store(batch.len(), Ordering::Release);

                if batch.len() >= batch_size {
                    let full = take_batch(&mut batch, batch_size, &backlog);
                    flusher.flush(full, FlushTrigger::Size).await;
                    ticker.reset();
                }
            }

            _ = ticker.tick() => {
                if !batch.is_empty() {
                    let partial = take_batch(&mut batch, batch_size, &backlog);
                    flusher.flush(partial, FlushTrigger::Timer).await;
                }
            }
        }

        if let Some(health) = &health {
            health.queue_depth.set(backlog.len() as f64);
        }
    }

    debug!("batch writer consumer exited");
}

/// Hands the current batch to a flush and clears the in-flight count.
fn take_batch(
    batch: &mut Vec<MetricRecord>,
    batch_size: usize,
    backlog: &Backlog,
) -> Vec<MetricRecord> {
    let taken = std::mem::replace(batch, Vec::with_capacity(batch_size));
    backlog.in_flight.store(0, Ordering::Release);
    taken
}

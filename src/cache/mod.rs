pub mod aggregate;
pub mod ring;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::export::health::HealthMetrics;
use crate::metric::{AggregatedMetrics, MetricPoint};

use self::ring::RingBuffer;

/// Validation errors returned by [`MetricCache::store`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("node id must not be empty")]
    EmptyNodeId,

    #[error("metric point is missing")]
    NilPoint,
}

/// Callback run by the aggregation sweep for every known node.
pub type SweepHook = Box<dyn Fn(&str, &[AggregatedMetrics]) + Send + Sync>;

type SharedHook = Arc<dyn Fn(&str, &[AggregatedMetrics]) + Send + Sync>;

type NodeBuffers = DashMap<String, Arc<RingBuffer>>;

/// Shortest sweep interval; zero is raised to this.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Registry of per-node ring buffers with a periodic aggregation sweep.
///
/// Buffers are created on the first store for a node and kept for the life
/// of the cache. The registry and each buffer lock independently, so adding
/// a node never blocks reads or writes on existing ones.
pub struct MetricCache {
    cfg: CacheConfig,
    buffers: Arc<NodeBuffers>,
    hooks: Arc<parking_lot::RwLock<Vec<SharedHook>>>,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
    run_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MetricCache {
    /// Creates an empty cache. The sweep does not run until [`start`](Self::start).
    pub fn new(mut cfg: CacheConfig) -> Self {
        cfg.sweep_interval = cfg.sweep_interval.max(MIN_SWEEP_INTERVAL);

        Self {
            cfg,
            buffers: Arc::new(DashMap::new()),
            hooks: Arc::new(parking_lot::RwLock::new(Vec::new())),
            health: None,
            cancel: CancellationToken::new(),
            run_task: parking_lot::Mutex::new(None),
        }
    }

    /// Attaches health metrics for node and eviction accounting.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Stores a sample for `node_id`, creating the node's buffer if needed.
    pub fn store(
        &self,
        node_id: &str,
        point: impl Into<Option<MetricPoint>>,
    ) -> Result<(), CacheError> {
        if node_id.is_empty() {
            return Err(CacheError::EmptyNodeId);
        }
        let Some(point) = point.into() else {
            return Err(CacheError::NilPoint);
        };

        let buffer = self.buffer_for(node_id);
        if buffer.write(point) {
            if let Some(health) = &self.health {
                health.cache_evictions.inc();
            }
        }

        Ok(())
    }

    /// Returns the node's buffered samples, oldest first. Unknown nodes yield
    /// an empty vector and are not registered.
    pub fn get(&self, node_id: &str) -> Vec<MetricPoint> {
        self.existing(node_id)
            .map(|buffer| buffer.read_all())
            .unwrap_or_default()
    }

    /// Returns the node's per-minute aggregates, ordered by minute.
    pub fn aggregate_metrics_by_node(&self, node_id: &str) -> Vec<AggregatedMetrics> {
        self.existing(node_id)
            .map(|buffer| buffer.aggregate_metrics())
            .unwrap_or_default()
    }

    /// Returns a snapshot of every known node id.
    pub fn node_ids(&self) -> Vec<String> {
        self.buffers.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Registers a callback invoked by each sweep. A hook registered while a
    /// sweep is running is first called by the next sweep.
    pub fn on_sweep(&self, hook: SweepHook) {
        self.hooks.write().push(Arc::from(hook));
    }

    /// Runs one aggregation sweep immediately, returning the nodes visited.
    pub fn sweep_now(&self) -> usize {
        sweep(&self.buffers, &self.hooks, self.health.as_deref())
    }

    /// Starts the background sweep task. Calling it again while running, or
    /// after [`stop`](Self::stop), is a no-op.
    pub fn start(&self) {
        if self.cancel.is_cancelled() {
            warn!("metric cache already stopped, not starting sweep");
            return;
        }

        let mut run_task = self.run_task.lock();
        if run_task.is_some() {
            return;
        }

        let interval = self.cfg.sweep_interval;
        let buffers = Arc::clone(&self.buffers);
        let hooks = Arc::clone(&self.hooks);
        let health = self.health.clone();
        let cancel = self.cancel.clone();

        *run_task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("metric cache sweep stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let nodes = sweep(&buffers, &hooks, health.as_deref());
                        debug!(nodes, "metric cache sweep complete");
                    }
                }
            }
        }));

        info!(
            capacity = self.cfg.capacity,
            sweep_interval = ?interval,
            "metric cache started"
        );
    }

    /// Stops the sweep and waits for it to exit. Stores and reads keep working.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let run_task = { self.run_task.lock().take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "metric cache sweep task join failed");
            }
        }
    }

    fn existing(&self, node_id: &str) -> Option<Arc<RingBuffer>> {
        self.buffers.get(node_id).map(|e| Arc::clone(e.value()))
    }

    fn buffer_for(&self, node_id: &str) -> Arc<RingBuffer> {
        if let Some(buffer) = self.existing(node_id) {
            return buffer;
        }

        let mut created = false;
        let buffer = {
            let entry = self.buffers.entry(node_id.to_string()).or_insert_with(|| {
                created = true;
                Arc::new(RingBuffer::new(self.cfg.capacity))
            });
            Arc::clone(entry.value())
        };

        if created {
            debug!(node_id, "registered node buffer");
            if let Some(health) = &self.health {
                health.cache_nodes.set(self.buffers.len() as f64);
            }
        }

        buffer
    }
}

impl std::fmt::Debug for MetricCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricCache")
            .field("capacity", &self.cfg.capacity)
            .field("nodes", &self.buffers.len())
            .finish()
    }
}

/// Aggregates every node known at the start of the sweep.
///
/// Node ids are snapshotted first so no registry shard lock is held while
/// aggregating or running hooks. Nodes added mid-sweep are picked up next time.
fn sweep(
    buffers: &NodeBuffers,
    hooks: &parking_lot::RwLock<Vec<SharedHook>>,
    health: Option<&HealthMetrics>,
) -> usize {
    let started = Instant::now();
    // Hooks run without the lock held so they may register further hooks.
    let hooks: Vec<SharedHook> = hooks.read().clone();
    let node_ids: Vec<String> = buffers.iter().map(|e| e.key().clone()).collect();

    let mut visited = 0;
    for node_id in &node_ids {
        let Some(buffer) = buffers.get(node_id).map(|e| Arc::clone(e.value())) else {
            continue;
        };

        let aggregates = buffer.aggregate_metrics();
        visited += 1;

        for hook in &hooks {
            hook(node_id, &aggregates);
        }
    }

    if let Some(health) = health {
        health.cache_sweeps.inc();
        health.sweep_duration.observe(started.elapsed().as_secs_f64());
    }

    visited
}

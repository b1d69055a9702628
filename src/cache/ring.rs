use parking_lot::RwLock;

use crate::metric::{AggregatedMetrics, MetricPoint};

use super::aggregate::aggregate_by_minute;

/// Default number of samples retained per node (one per minute for an hour).
pub const DEFAULT_CAPACITY: usize = 60;

/// Fixed-capacity circular store of one node's samples.
///
/// Writes take the write lock only for the slot update; readers get copies.
/// Once full, each write overwrites the oldest sample.
pub struct RingBuffer {
    capacity: usize,
    state: RwLock<RingState>,
}

struct RingState {
    slots: Vec<Option<MetricPoint>>,
    /// Next slot to write.
    write_pos: usize,
    /// Oldest buffered slot.
    read_pos: usize,
    size: usize,
}

impl RingBuffer {
    /// Creates an empty buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: RwLock::new(RingState {
                slots: vec![None; capacity],
                write_pos: 0,
                read_pos: 0,
                size: 0,
            }),
        }
    }

    /// Appends a sample, returning true if the oldest sample was evicted.
    pub fn write(&self, point: MetricPoint) -> bool {
        let mut state = self.state.write();

        let write_pos = state.write_pos;
        state.slots[write_pos] = Some(point);
        state.write_pos = (write_pos + 1) % self.capacity;

        if state.size == self.capacity {
            state.read_pos = (state.read_pos + 1) % self.capacity;
            true
        } else {
            state.size += 1;
            false
        }
    }

    /// Returns a copy of all buffered samples, oldest first.
    pub fn read_all(&self) -> Vec<MetricPoint> {
        let state = self.state.read();
        let mut out = Vec::with_capacity(state.size);
        for i in 0..state.size {
            let idx = (state.read_pos + i) % self.capacity;
            if let Some(point) = state.slots[idx] {
                out.push(point);
            }
        }
        out
    }

    /// Returns the most recently written sample.
    pub fn latest(&self) -> Option<MetricPoint> {
        let state = self.state.read();
        if state.size == 0 {
            return None;
        }
        let idx = (state.write_pos + self.capacity - 1) % self.capacity;
        state.slots[idx]
    }

    /// Summarises buffered samples per minute, ordered by bucket start.
    pub fn aggregate_metrics(&self) -> Vec<AggregatedMetrics> {
        // Aggregate from a snapshot so writers are not held off while
        // buckets are computed.
        let points = self.read_all();
        aggregate_by_minute(&points)
    }

    pub fn len(&self) -> usize {
        self.state.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

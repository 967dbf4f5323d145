use crate::sync::{AtomicU64, Ordering};

/// Monotonically increasing counter
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-cleaner statistics for observability and testing
///
/// Each Cleaner instance has its own set of counters, so multiple logs in one
/// process never share state and tests can validate a single cleaner in
/// isolation.
pub struct CleanerStats {
    // Pass bookkeeping
    pub memory_passes: Counter,
    pub disk_passes: Counter,
    pub passes_aborted: Counter,
    pub idle_ticks: Counter,

    // Entry-level work
    pub entries_scanned: Counter,
    pub entries_relocated: Counter,
    pub entries_dead_on_relocation: Counter,

    // Space accounting
    pub bytes_relocated: Counter,
    pub bytes_freed: Counter,
    pub seglets_freed: Counter,
    pub survivors_allocated: Counter,

    // Write cost of the most recent memory pass, stored as f64 bits
    last_write_cost: AtomicU64,
}

impl CleanerStats {
    pub fn new() -> Self {
        Self {
            memory_passes: Counter::new(),
            disk_passes: Counter::new(),
            passes_aborted: Counter::new(),
            idle_ticks: Counter::new(),
            entries_scanned: Counter::new(),
            entries_relocated: Counter::new(),
            entries_dead_on_relocation: Counter::new(),
            bytes_relocated: Counter::new(),
            bytes_freed: Counter::new(),
            seglets_freed: Counter::new(),
            survivors_allocated: Counter::new(),
            last_write_cost: AtomicU64::new(0),
        }
    }

    /// Write cost of the most recent memory-cleaning pass: bytes written per
    /// byte freed. 0.0 until the first pass completes; infinity when a pass
    /// freed nothing.
    pub fn last_write_cost(&self) -> f64 {
        f64::from_bits(self.last_write_cost.load(Ordering::Relaxed))
    }

    pub(crate) fn set_write_cost(&self, cost: f64) {
        self.last_write_cost.store(cost.to_bits(), Ordering::Relaxed);
    }
}

impl Default for CleanerStats {
    fn default() -> Self {
        Self::new()
    }
}

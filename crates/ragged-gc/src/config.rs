//! Collector tunables.

use std::time::Duration;

use crate::error::ConfigError;
use crate::gc::barrier::DEFAULT_BARRIER_BUFFER_CAPACITY;
use crate::heap::SPAN_BYTES;

/// Default number of dedicated background marker threads.
pub const DEFAULT_BACKGROUND_WORKERS: usize = 2;
/// Default grey references per global-queue batch.
pub const DEFAULT_BATCH_CAPACITY: usize = 128;
/// Default local-queue length above which a worker hands half to others.
pub const DEFAULT_BALANCE_THRESHOLD: usize = 512;
/// Default objects scanned between a background worker's safe-points.
pub const DEFAULT_SAFEPOINT_INTERVAL: usize = 256;
/// Default bytes of allocation that owe one unit of assist work.
pub const DEFAULT_ASSIST_BYTES_PER_UNIT: usize = 64;
/// Default cap on assist units per allocation.
pub const DEFAULT_MAX_ASSIST_UNITS: usize = 128;
/// Default heap growth, in percent of the last live size, that starts a cycle.
pub const DEFAULT_GC_PERCENT: u32 = 100;
/// Default floor for the heap-growth trigger (4 MiB).
pub const DEFAULT_MIN_TRIGGER_BYTES: usize = 4 * 1024 * 1024;
/// Default heap limit (1 GiB).
pub const DEFAULT_MAX_HEAP_BYTES: usize = 1024 * 1024 * 1024;
/// Default time an idle background worker sleeps before polling again.
pub const DEFAULT_IDLE_PARK: Duration = Duration::from_millis(1);

/// Configuration for a [`Collector`](crate::Collector).
///
/// # Example
///
/// ```
/// use ragged_gc::GcConfig;
///
/// let mut config = GcConfig::new(0);
/// config.set_gc_percent(None);
/// config.set_safepoint_interval(64);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Dedicated marker threads. Zero leaves all marking to mutator assists
    /// and [`Mutator::collect`](crate::Mutator::collect).
    pub background_workers: usize,
    /// Grey references per global-queue batch.
    pub batch_capacity: usize,
    /// Local-queue length above which half is handed to the global queue
    /// when it runs dry.
    pub balance_threshold: usize,
    /// Write-barrier records buffered per worker before spilling.
    pub barrier_buffer_capacity: usize,
    /// Objects a background worker scans between safe-points, where the
    /// termination detector and stop-the-world can reach it.
    pub safepoint_interval: usize,
    /// Allocation bytes that owe one unit of assist work while marking.
    pub assist_bytes_per_unit: usize,
    /// Most assist units done by a single allocation.
    pub max_assist_units: usize,
    /// Heap growth in percent of the last live size that starts a cycle;
    /// `None` disables the trigger.
    pub gc_percent: Option<u32>,
    /// Floor for the heap-growth trigger.
    pub min_trigger_bytes: usize,
    /// Hard heap limit. Reaching it forces a stop-the-world collection.
    pub max_heap_bytes: usize,
    /// Idle background worker poll period.
    pub idle_park: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            background_workers: DEFAULT_BACKGROUND_WORKERS,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            balance_threshold: DEFAULT_BALANCE_THRESHOLD,
            barrier_buffer_capacity: DEFAULT_BARRIER_BUFFER_CAPACITY,
            safepoint_interval: DEFAULT_SAFEPOINT_INTERVAL,
            assist_bytes_per_unit: DEFAULT_ASSIST_BYTES_PER_UNIT,
            max_assist_units: DEFAULT_MAX_ASSIST_UNITS,
            gc_percent: Some(DEFAULT_GC_PERCENT),
            min_trigger_bytes: DEFAULT_MIN_TRIGGER_BYTES,
            max_heap_bytes: DEFAULT_MAX_HEAP_BYTES,
            idle_park: DEFAULT_IDLE_PARK,
        }
    }
}

impl GcConfig {
    /// Defaults with `background_workers` marker threads.
    #[must_use]
    pub fn new(background_workers: usize) -> Self {
        Self {
            background_workers,
            ..Self::default()
        }
    }

    /// Check the configuration for values the collector cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_capacity == 0 {
            return Err(ConfigError::Zero("batch_capacity"));
        }
        if self.barrier_buffer_capacity == 0 {
            return Err(ConfigError::Zero("barrier_buffer_capacity"));
        }
        if self.safepoint_interval == 0 {
            return Err(ConfigError::Zero("safepoint_interval"));
        }
        if self.assist_bytes_per_unit == 0 {
            return Err(ConfigError::Zero("assist_bytes_per_unit"));
        }
        if self.max_heap_bytes < SPAN_BYTES {
            return Err(ConfigError::HeapTooSmall {
                max_heap_bytes: self.max_heap_bytes,
                span_bytes: SPAN_BYTES,
            });
        }
        Ok(())
    }

    /// Set the number of background marker threads.
    pub const fn set_background_workers(&mut self, workers: usize) {
        self.background_workers = workers;
    }

    /// Set the global-queue batch size.
    pub const fn set_batch_capacity(&mut self, capacity: usize) {
        self.batch_capacity = capacity;
    }

    /// Set the local-queue balancing threshold.
    pub const fn set_balance_threshold(&mut self, threshold: usize) {
        self.balance_threshold = threshold;
    }

    /// Set the write-barrier buffer size.
    pub const fn set_barrier_buffer_capacity(&mut self, capacity: usize) {
        self.barrier_buffer_capacity = capacity;
    }

    /// Set the objects scanned between background safe-points.
    pub const fn set_safepoint_interval(&mut self, interval: usize) {
        self.safepoint_interval = interval;
    }

    /// Set the assist exchange rate and per-allocation cap.
    pub const fn set_assist(&mut self, bytes_per_unit: usize, max_units: usize) {
        self.assist_bytes_per_unit = bytes_per_unit;
        self.max_assist_units = max_units;
    }

    /// Set or disable the heap-growth trigger.
    pub const fn set_gc_percent(&mut self, percent: Option<u32>) {
        self.gc_percent = percent;
    }

    /// Set the heap-growth trigger floor.
    pub const fn set_min_trigger_bytes(&mut self, bytes: usize) {
        self.min_trigger_bytes = bytes;
    }

    /// Set the hard heap limit.
    pub const fn set_max_heap_bytes(&mut self, bytes: usize) {
        self.max_heap_bytes = bytes;
    }

    /// Set the idle background worker poll period.
    pub const fn set_idle_park(&mut self, period: Duration) {
        self.idle_park = period;
    }

    /// Heap-growth trigger after a cycle that left `live_bytes` marked.
    #[must_use]
    pub fn next_trigger(&self, live_bytes: usize) -> Option<usize> {
        let percent = self.gc_percent?;
        let growth = live_bytes.saturating_mul(percent as usize) / 100;
        Some(growth.max(self.min_trigger_bytes))
    }
}

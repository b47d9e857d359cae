use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Global runtime metrics for the telemetry subsystem.
///
/// Purpose:
/// - Track collector liveness (restarts, heartbeat failures)
/// - Track socket pool membership
/// - Track sample throughput
/// - Track persistence activity
///
/// Design:
/// - Lock-free (Atomics)
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // Samples
    pub samples_received: AtomicUsize,
    pub samples_dropped: AtomicUsize,

    // Refresh fan-out
    pub refresh_broadcasts: AtomicUsize,

    // Local collector
    pub agent_restarts: AtomicUsize,
    pub heartbeat_failures: AtomicUsize,

    // Socket pool
    pub pool_members_active: AtomicUsize,
    pub pool_rejections: AtomicUsize,

    // Persistence
    pub cache_flushes: AtomicUsize,
    pub cache_flush_skips: AtomicUsize,
}

impl RuntimeMetrics {
    /// One-line summary used by the host's periodic reporter.
    pub fn summary(&self) -> String {
        format!(
            "samples={} dropped={} refresh={} restarts={} hb_fail={} members={} rejected={} flushes={} flush_skips={}",
            self.samples_received.load(Ordering::Relaxed),
            self.samples_dropped.load(Ordering::Relaxed),
            self.refresh_broadcasts.load(Ordering::Relaxed),
            self.agent_restarts.load(Ordering::Relaxed),
            self.heartbeat_failures.load(Ordering::Relaxed),
            self.pool_members_active.load(Ordering::Relaxed),
            self.pool_rejections.load(Ordering::Relaxed),
            self.cache_flushes.load(Ordering::Relaxed),
            self.cache_flush_skips.load(Ordering::Relaxed),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));

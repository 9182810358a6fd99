//! Process-wide counters for the things spec.md §5/§7 requires to be
//! "counted" rather than silently discarded: malformed frames, CRC failures,
//! and records dropped under backpressure or store timeout. No external
//! metrics backend is assumed (spec.md's non-goals exclude a query/metrics
//! API) — these are logged periodically instead.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub frames_parsed: AtomicU64,
    pub frames_malformed: AtomicU64,
    pub crc_failures: AtomicU64,
    pub records_dropped_backpressure: AtomicU64,
    pub records_dropped_store_timeout: AtomicU64,
    pub unknown_devices_rejected: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_frames_parsed(&self) {
        self.frames_parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_crc_failures(&self) {
        self.crc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_backpressure(&self) {
        self.records_dropped_backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_store_timeout(&self) {
        self.records_dropped_store_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_device_rejected(&self) {
        self.unknown_devices_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Spawns the periodic logger. Runs for the lifetime of the process;
    /// there's nothing to cancel it against since it only reads atomics.
    pub fn spawn_reporter(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                tracing::info!(
                    frames_parsed = self.frames_parsed.load(Ordering::Relaxed),
                    frames_malformed = self.frames_malformed.load(Ordering::Relaxed),
                    crc_failures = self.crc_failures.load(Ordering::Relaxed),
                    dropped_backpressure = self.records_dropped_backpressure.load(Ordering::Relaxed),
                    dropped_store_timeout = self.records_dropped_store_timeout.load(Ordering::Relaxed),
                    unknown_devices_rejected = self.unknown_devices_rejected.load(Ordering::Relaxed),
                    "ingestion counters"
                );
            }
        });
    }
}

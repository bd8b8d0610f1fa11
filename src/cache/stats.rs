use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for one coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    /// Negotiation network tasks issued (fallback probes included)
    pub negotiations_started: Arc<AtomicU64>,
    /// Full-body download tasks issued
    pub downloads_started: Arc<AtomicU64>,
    /// Retries scheduled across both request kinds
    pub retries: Arc<AtomicU64>,
    /// Downloads discarded and restarted from byte 0
    pub restarts: Arc<AtomicU64>,
    pub bytes_flushed: Arc<AtomicU64>,
    pub range_requests: Arc<AtomicU64>,
    pub range_bytes_served: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl Default for CoordinatorStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorStats {
    pub fn new() -> Self {
        Self {
            negotiations_started: Arc::new(AtomicU64::new(0)),
            downloads_started: Arc::new(AtomicU64::new(0)),
            retries: Arc::new(AtomicU64::new(0)),
            restarts: Arc::new(AtomicU64::new(0)),
            bytes_flushed: Arc::new(AtomicU64::new(0)),
            range_requests: Arc::new(AtomicU64::new(0)),
            range_bytes_served: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn increment_negotiations(&self) {
        self.negotiations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_downloads(&self) {
        self.downloads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_restarts(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_flushed(&self, bytes: u64) {
        self.bytes_flushed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_range_requests(&self) {
        self.range_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_range_bytes_served(&self, bytes: u64) {
        self.range_bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            negotiations_started: self.negotiations_started.load(Ordering::Relaxed),
            downloads_started: self.downloads_started.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            range_requests: self.range_requests.load(Ordering::Relaxed),
            range_bytes_served: self.range_bytes_served.load(Ordering::Relaxed),
        }
    }

    pub fn format_report(&self) -> String {
        let uptime_secs = self.start_time.elapsed().as_secs();
        let s = self.snapshot();
        let flushed_mb = s.bytes_flushed as f64 / (1024.0 * 1024.0);
        let served_mb = s.range_bytes_served as f64 / (1024.0 * 1024.0);

        format!(
            "📊 Cache Stats [{}m {}s] | Downloads: {} | Negotiations: {} | Retries: {} | Restarts: {} | Flushed: {:.1} MB | Ranges: {} ({:.1} MB served)",
            uptime_secs / 60,
            uptime_secs % 60,
            s.downloads_started,
            s.negotiations_started,
            s.retries,
            s.restarts,
            flushed_mb,
            s.range_requests,
            served_mb
        )
    }
}

/// Point-in-time copy of [`CoordinatorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub negotiations_started: u64,
    pub downloads_started: u64,
    pub retries: u64,
    pub restarts: u64,
    pub bytes_flushed: u64,
    pub range_requests: u64,
    pub range_bytes_served: u64,
}

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Process-wide pipeline counters.
///
/// Counters are monotonically non-decreasing for the process lifetime and are
/// only reset by a restart. Updates go through a mutex so the long-lived watch
/// mode stays correct even if processing ever moves off the main thread.
pub struct PipelineStats {
    inner: Mutex<StatsInner>,
}

struct StatsInner {
    start_time: DateTime<Local>,
    total_processed: u64,
    successful_detections: u64,
    notifications_sent: u64,
    errors: u64,
    per_label: BTreeMap<String, u64>,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    pub start_time: DateTime<Local>,
    pub total_processed: u64,
    pub successful_detections: u64,
    pub notifications_sent: u64,
    pub errors: u64,
    pub per_label: BTreeMap<String, u64>,
}

impl StatsSnapshot {
    pub fn uptime_hours(&self) -> f64 {
        let elapsed = Local::now().signed_duration_since(self.start_time);
        elapsed.num_seconds().max(0) as f64 / 3600.0
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                start_time: Local::now(),
                total_processed: 0,
                successful_detections: 0,
                notifications_sent: 0,
                errors: 0,
                per_label: BTreeMap::new(),
            }),
        }
    }

    pub fn record_processed(&self) {
        self.lock().total_processed += 1;
    }

    pub fn record_detection(&self, label: &str) {
        let mut inner = self.lock();
        inner.successful_detections += 1;
        *inner.per_label.entry(label.to_string()).or_insert(0) += 1;
    }

    pub fn record_notified(&self) {
        self.lock().notifications_sent += 1;
    }

    pub fn record_error(&self) {
        self.lock().errors += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            start_time: inner.start_time,
            total_processed: inner.total_processed,
            successful_detections: inner.successful_detections,
            notifications_sent: inner.notifications_sent,
            errors: inner.errors,
            per_label: inner.per_label.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        // A poisoned lock means a panic mid-increment; counters are still
        // usable, so recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

//! In-process counters for the operator surface.
//!
//! Kept deliberately small: a gauge pair for live sessions/sources plus
//! lifetime totals, readable as one consistent-enough snapshot for the
//! detailed health endpoint. Export to a telemetry backend happens outside
//! this process.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct MonitorMetrics {
    sessions_active: AtomicI64,
    sessions_total: AtomicU64,
    sources_active: AtomicI64,
    sources_total: AtomicU64,
}

impl MonitorMetrics {
    pub fn session_opened(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn source_opened(&self) {
        self.sources_active.fetch_add(1, Ordering::Relaxed);
        self.sources_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn source_closed(&self) {
        self.sources_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            sources_active: self.sources_active.load(Ordering::Relaxed),
            sources_total: self.sources_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_active: i64,
    pub sessions_total: u64,
    pub sources_active: i64,
    pub sources_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_track_open_and_close() {
        let metrics = MonitorMetrics::default();
        metrics.source_opened();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_active, 1);
        assert_eq!(snapshot.sessions_total, 2);
        assert_eq!(snapshot.sources_active, 1);
        assert_eq!(snapshot.sources_total, 1);
    }
}

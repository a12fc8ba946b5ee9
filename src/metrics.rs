//! Session-scoped counters for the synchronization layer.
//! One `SyncMetrics` lives per live session and is shared by `Arc`.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct SyncMetrics {
    sends_dispatched: AtomicU64,
    sends_acked: AtomicU64,
    sends_failed: AtomicU64,
    send_retries: AtomicU64,
    ack_latency_sum_ms: AtomicU64,
    ack_latency_count: AtomicU64,
    duplicates_suppressed: AtomicU64,
    reconnect_attempts: AtomicU64,
    refresh_ticks: AtomicU64,
    refresh_skipped: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_sends_dispatched(&self) {
        self.sends_dispatched.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_sends_acked(&self) {
        self.sends_acked.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_sends_failed(&self) {
        self.sends_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_send_retries(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }
    pub fn observe_ack_latency(&self, sent_at: Instant) {
        let ms = sent_at.elapsed().as_millis() as u64;
        self.ack_latency_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.ack_latency_count.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_duplicates_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_refresh_ticks(&self) {
        self.refresh_ticks.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_refresh_skipped(&self) {
        self.refresh_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.ack_latency_count.load(Ordering::Relaxed);
        let sum = self.ack_latency_sum_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            sends_dispatched: self.sends_dispatched.load(Ordering::Relaxed),
            sends_acked: self.sends_acked.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            send_retries: self.send_retries.load(Ordering::Relaxed),
            ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            refresh_ticks: self.refresh_ticks.load(Ordering::Relaxed),
            refresh_skipped: self.refresh_skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sends_dispatched: u64,
    pub sends_acked: u64,
    pub sends_failed: u64,
    pub send_retries: u64,
    pub ack_latency_avg_ms: Option<u64>,
    pub duplicates_suppressed: u64,
    pub reconnect_attempts: u64,
    pub refresh_ticks: u64,
    pub refresh_skipped: u64,
}

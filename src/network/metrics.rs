use std::sync::atomic::{AtomicU64, Ordering};

pub static ORDERS_QUEUED_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static ORDERS_SYNCED_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static ORDERS_DIRECT_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static ORDERS_REJECTED_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static SUBMIT_TRANSIENT_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static REALTIME_RECONNECTS_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static REALTIME_FRAMES_DROPPED_TOTAL: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub orders_queued: u64,
    pub orders_synced: u64,
    pub orders_direct: u64,
    pub orders_rejected: u64,
    pub submit_transient_failures: u64,
    pub realtime_reconnects: u64,
    pub realtime_frames_dropped: u64,
}

pub fn record_queued() {
    ORDERS_QUEUED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn record_synced() {
    ORDERS_SYNCED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn record_direct() {
    ORDERS_DIRECT_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn record_rejected() {
    ORDERS_REJECTED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn record_transient_failure() {
    SUBMIT_TRANSIENT_FAILURES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn record_reconnect() {
    REALTIME_RECONNECTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn record_dropped_frame() {
    REALTIME_FRAMES_DROPPED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        orders_queued: ORDERS_QUEUED_TOTAL.load(Ordering::Relaxed),
        orders_synced: ORDERS_SYNCED_TOTAL.load(Ordering::Relaxed),
        orders_direct: ORDERS_DIRECT_TOTAL.load(Ordering::Relaxed),
        orders_rejected: ORDERS_REJECTED_TOTAL.load(Ordering::Relaxed),
        submit_transient_failures: SUBMIT_TRANSIENT_FAILURES_TOTAL.load(Ordering::Relaxed),
        realtime_reconnects: REALTIME_RECONNECTS_TOTAL.load(Ordering::Relaxed),
        realtime_frames_dropped: REALTIME_FRAMES_DROPPED_TOTAL.load(Ordering::Relaxed),
    }
}

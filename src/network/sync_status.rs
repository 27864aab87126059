use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::network::realtime::ChannelState;

/// Snapshot of queue and connection health, polled by the UI layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatusState {
    /// Latest committed connectivity reading.
    pub online: bool,
    /// Records still waiting in the durable queue (pending or syncing).
    pub pending_orders: u64,
    /// Records in the user-visible failed list.
    pub failed_orders: u64,
    /// Number of records confirmed by the last flush.
    pub last_synced: u64,
    /// Timestamp of the last flush attempt, in milliseconds since UNIX_EPOCH.
    pub last_flush_ms: u64,
    /// Last transient submission error, if the last flush stopped on one.
    pub last_error: Option<String>,
    /// State of the live-updates channel. `given_up` means live updates are
    /// unavailable until the channel is reconnected.
    pub realtime: ChannelState,
}

pub type SharedSyncStatus = Arc<Mutex<SyncStatusState>>;

pub fn shared_status() -> SharedSyncStatus {
    Arc::new(Mutex::new(SyncStatusState::default()))
}

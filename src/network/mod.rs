pub mod client;
pub mod connectivity;
pub mod error;
pub mod http_admin;
pub mod metrics;
pub mod offline_queue;
pub mod realtime;
pub mod sync_status;
pub mod sync_worker;

pub use client::{HttpOrderApi, OrderApi, SubmitAck};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, HttpProbe, ReachabilityProbe};
pub use error::{ChannelError, NetworkError, SubmitError};
pub use offline_queue::{FlushReport, RetryPolicy, SyncQueue};
pub use realtime::{
    ChannelState, Connector, FrameStream, InboundEvent, RealtimeChannel, ReconnectPolicy,
    Subscription, WebSocketConnector,
};
pub use sync_status::{SharedSyncStatus, SyncStatusState};
pub use sync_worker::SyncWorker;

#[cfg(test)]
pub(crate) static TEST_ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

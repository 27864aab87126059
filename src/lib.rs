// Order model and local persistence
pub mod order;
pub mod storage;
pub mod config;
pub mod gateway;

// Connectivity, sync and realtime
pub mod network;
pub mod common;

// Public exports
pub use config::Config;
pub use gateway::{GatewayError, OrderOutcome, OrdersGateway};
pub use order::{OrderItem, OrderPayload, PendingOrder, SyncStatus};

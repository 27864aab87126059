use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;

use crate::common::time::now_ms;
use crate::network::realtime::{InboundEvent, RealtimeChannel, Subscription};
use crate::network::{metrics, ConnectivityMonitor, OrderApi, SubmitError, SyncQueue};
use crate::order::{FailureReason, OrderPayload, PendingOrder};
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Order rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderOutcome {
    /// The server created (or recognised) the order.
    Confirmed { local_id: String, server_id: String },
    /// Recorded locally; the sync queue will deliver it.
    Queued(PendingOrder),
}

impl OrderOutcome {
    pub fn local_id(&self) -> &str {
        match self {
            OrderOutcome::Confirmed { local_id, .. } => local_id,
            OrderOutcome::Queued(record) => &record.local_id,
        }
    }
}

/// The single entry point business code uses for orders and live updates.
///
/// `create_order` is the only place that decides between the online and
/// offline paths.
pub struct OrdersGateway {
    connectivity: Arc<ConnectivityMonitor>,
    queue: SyncQueue,
    api: Arc<dyn OrderApi>,
    realtime: Arc<RealtimeChannel>,
    submit_timeout: Duration,
}

impl OrdersGateway {
    pub fn new(
        connectivity: Arc<ConnectivityMonitor>,
        queue: SyncQueue,
        api: Arc<dyn OrderApi>,
        realtime: Arc<RealtimeChannel>,
    ) -> Self {
        let submit_timeout = queue.policy().submit_timeout;
        Self {
            connectivity,
            queue,
            api,
            realtime,
            submit_timeout,
        }
    }

    /// Create an order.
    ///
    /// Offline, the order is queued and returned as `pending` immediately.
    /// Online with older orders still queued, it joins the tail of the queue
    /// and a flush is run, so it never reaches the server ahead of them.
    /// Otherwise it is submitted directly; if that submission fails
    /// transiently the order is queued under the same `local_id`, since the
    /// server may already have committed it.
    pub async fn create_order(&self, payload: OrderPayload) -> Result<OrderOutcome, GatewayError> {
        let record = PendingOrder::new(payload, now_ms());

        if !self.connectivity.is_online() {
            let queued = self.queue.enqueue_record(record).await?;
            return Ok(OrderOutcome::Queued(queued));
        }

        if self.queue.has_backlog()? {
            log::debug!(
                "Older orders still queued, sending {} through the queue",
                record.local_id
            );
            let queued = self.queue.enqueue_record(record).await?;
            return self.flush_behind_backlog(queued).await;
        }

        let result = match timeout(
            self.submit_timeout,
            self.api.submit_order(&record.local_id, &record.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Transient(format!(
                "submission timed out after {:?}",
                self.submit_timeout
            ))),
        };

        match result {
            Ok(ack) => {
                metrics::record_direct();
                log::info!("Order {} created as {}", record.local_id, ack.server_id);
                Ok(OrderOutcome::Confirmed {
                    local_id: record.local_id,
                    server_id: ack.server_id,
                })
            }
            Err(SubmitError::Rejected { status, message }) => {
                metrics::record_rejected();
                Err(GatewayError::Rejected { status, message })
            }
            Err(SubmitError::Transient(err)) => {
                metrics::record_transient_failure();
                log::warn!(
                    "Direct submission of order {} failed, queueing it: {err}",
                    record.local_id
                );
                let queued = self.queue.enqueue_record(record).await?;
                Ok(OrderOutcome::Queued(queued))
            }
        }
    }

    async fn flush_behind_backlog(
        &self,
        queued: PendingOrder,
    ) -> Result<OrderOutcome, GatewayError> {
        let local_id = queued.local_id.clone();
        let report = self.queue.flush().await?;

        if report.synced.contains(&local_id) {
            if let Some(server_id) = self.queue.get(&local_id)?.and_then(|r| r.server_id) {
                return Ok(OrderOutcome::Confirmed {
                    local_id,
                    server_id,
                });
            }
        }

        if report.rejected.contains(&local_id) {
            // Reported to the caller here, so it does not also wait in the
            // failed list.
            if let Some(FailureReason::Rejected { status, message }) = self
                .queue
                .discard_failed(&local_id)
                .await?
                .and_then(|r| r.failure)
            {
                return Err(GatewayError::Rejected { status, message });
            }
        }

        let current = match self.queue.get(&local_id)? {
            Some(record) => record,
            None => self.queue.get_failed(&local_id)?.unwrap_or(queued),
        };
        Ok(OrderOutcome::Queued(current))
    }

    /// Orders not yet confirmed, oldest first.
    pub fn pending_orders(&self) -> Result<Vec<PendingOrder>, StorageError> {
        self.queue.optimistic_view()
    }

    /// Orders that need manual resolution.
    pub fn failed_orders(&self) -> Result<Vec<PendingOrder>, StorageError> {
        self.queue.failed_orders()
    }

    pub fn subscribe<F>(&self, event_key: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.realtime.subscribe(event_key, handler)
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn realtime(&self) -> &Arc<RealtimeChannel> {
        &self.realtime
    }
}

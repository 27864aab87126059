use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::common::time::now_ms;
use crate::network::offline_queue::SyncQueue;
use crate::network::SharedSyncStatus;

/// Drives `SyncQueue::flush`: once on every offline-to-online transition and
/// then on a fixed interval for as long as the client stays online.
pub struct SyncWorker {
    queue: SyncQueue,
    connectivity: watch::Receiver<bool>,
    interval: Duration,
    status: Option<SharedSyncStatus>,
    shutdown: CancellationToken,
}

impl SyncWorker {
    pub fn new(
        queue: SyncQueue,
        connectivity: watch::Receiver<bool>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            connectivity,
            interval,
            status: None,
            shutdown,
        }
    }

    pub fn with_status(mut self, status: SharedSyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let online = *self.connectivity.borrow_and_update();
        self.set_online(online).await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = self.connectivity.changed() => {
                    if changed.is_err() {
                        log::warn!("Connectivity monitor dropped, stopping SyncWorker");
                        break;
                    }
                    let online = *self.connectivity.borrow_and_update();
                    self.set_online(online).await;
                    if online {
                        log::info!("Back online, flushing offline queue");
                        self.sync_once().await;
                    }
                }
                _ = ticker.tick() => {
                    if *self.connectivity.borrow() {
                        self.sync_once().await;
                    }
                }
            }
        }

        log::info!("SyncWorker stopped");
    }

    async fn sync_once(&self) {
        match self.queue.flush().await {
            Ok(report) if report.skipped => {}
            Ok(report) => {
                if !report.synced.is_empty() || !report.rejected.is_empty() {
                    log::info!(
                        "SyncWorker flushed queue (synced={}, rejected={}, exhausted={}, remaining={})",
                        report.synced.len(),
                        report.rejected.len(),
                        report.exhausted.len(),
                        report.remaining
                    );
                }
                if let Some(err) = report.last_error {
                    log::warn!(
                        "SyncWorker stopped early, {} orders still queued: {err}",
                        report.remaining
                    );
                }
            }
            Err(e) => log::error!("SyncWorker error: {e}"),
        }

        match self.queue.stale_orders(now_ms()) {
            Ok(stale) => {
                for record in stale {
                    log::warn!(
                        "Order {} for table {} has been waiting {}s without confirmation",
                        record.local_id,
                        record.payload.table_id,
                        record.age_ms(now_ms()) / 1000
                    );
                }
            }
            Err(e) => log::error!("SyncWorker failed to check stale orders: {e}"),
        }
    }

    async fn set_online(&self, online: bool) {
        if let Some(status) = &self.status {
            status.lock().await.online = online;
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

use crate::common::time::{add_ms, now_ms};
use crate::network::client::{OrderApi, SubmitAck};
use crate::network::metrics;
use crate::network::sync_status::SharedSyncStatus;
use crate::network::SubmitError;
use crate::order::{FailureReason, OrderPayload, PendingOrder, SyncStatus};
use crate::storage::{DurableQueueStore, StorageError};

/// Bounded retry policy for queued submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// A record is terminally failed once this many submissions have failed.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// A submission that neither succeeds nor fails within this window counts
    /// as a transient failure.
    pub submit_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            submit_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures:
    /// `base_delay * 2^(failures - 1)`, capped at `max_delay`.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts.max(1)
    }
}

/// What a single flush cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Another flush was already running; nothing was submitted.
    pub skipped: bool,
    pub synced: Vec<String>,
    pub rejected: Vec<String>,
    pub exhausted: Vec<String>,
    /// Records still queued when the cycle stopped.
    pub remaining: usize,
    /// Last transient error seen during the cycle, if any.
    pub last_error: Option<String>,
}

enum Attempt {
    Synced,
    Rejected,
    Retrying(String),
    Exhausted(String),
}

/// Owns the lifecycle of optimistic orders.
///
/// `enqueue` only touches local storage. `flush` drains pending records
/// against the server strictly one at a time, in FIFO order, and is the only
/// writer of record status.
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<DurableQueueStore>,
    api: Arc<dyn OrderApi>,
    policy: RetryPolicy,
    confirm_grace: Duration,
    stale_after: Duration,
    flush_lock: Arc<Mutex<()>>,
    status: Option<SharedSyncStatus>,
}

impl SyncQueue {
    pub fn new(store: Arc<DurableQueueStore>, api: Arc<dyn OrderApi>, policy: RetryPolicy) -> Self {
        Self {
            store,
            api,
            policy,
            confirm_grace: Duration::from_secs(3),
            stale_after: Duration::from_secs(15 * 60),
            flush_lock: Arc::new(Mutex::new(())),
            status: None,
        }
    }

    /// How long a synced record stays visible before it is removed.
    pub fn with_confirm_grace(mut self, grace: Duration) -> Self {
        self.confirm_grace = grace;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_status(mut self, status: SharedSyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a new order locally and return it as `pending`.
    ///
    /// Never waits on the network. The only possible error is a local
    /// storage failure.
    pub async fn enqueue(&self, payload: OrderPayload) -> Result<PendingOrder, StorageError> {
        self.enqueue_record(PendingOrder::new(payload, now_ms()))
            .await
    }

    /// Queue a record whose `local_id` was already minted, e.g. by a direct
    /// submission that may or may not have reached the server.
    pub(crate) async fn enqueue_record(
        &self,
        record: PendingOrder,
    ) -> Result<PendingOrder, StorageError> {
        self.store.append(&record)?;
        metrics::record_queued();
        log::info!(
            "Queued order {} for table {} ({} items)",
            record.local_id,
            record.payload.table_id,
            record.payload.items.len()
        );
        self.refresh_status(None).await;
        Ok(record)
    }

    /// Submit due pending records to the server, oldest first.
    ///
    /// The cycle stops at the first record still inside its backoff window
    /// and at the first retryable failure, so later records never overtake
    /// earlier ones. Rejected and exhausted records are moved to the failed
    /// list and do not block the queue.
    pub async fn flush(&self) -> Result<FlushReport, StorageError> {
        let _guard = match self.flush_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::debug!("Flush already in progress, skipping");
                return Ok(FlushReport {
                    skipped: true,
                    ..FlushReport::default()
                });
            }
        };

        self.prune_confirmed(now_ms())?;

        let mut report = FlushReport::default();
        let mut pending = Vec::new();
        for record in self.store.list_all()? {
            match record.status {
                SyncStatus::Pending => pending.push(record),
                // Holding the flush lock means no submission owns it.
                SyncStatus::Syncing => {
                    log::warn!(
                        "Order {} was left in flight by an earlier flush, returning it to pending",
                        record.local_id
                    );
                    if let Some(record) = self.release_in_flight(&record.local_id)? {
                        pending.push(record);
                    }
                }
                SyncStatus::Synced | SyncStatus::Failed => {}
            }
        }

        for record in pending {
            if !record.is_due(now_ms()) {
                log::debug!(
                    "Order {} is backing off until {}, stopping flush",
                    record.local_id,
                    record.next_attempt_at_ms
                );
                break;
            }

            let local_id = record.local_id.clone();
            match self.submit_one(record).await? {
                Attempt::Synced => report.synced.push(local_id),
                Attempt::Rejected => report.rejected.push(local_id),
                Attempt::Retrying(err) => {
                    report.last_error = Some(err);
                    break;
                }
                Attempt::Exhausted(err) => {
                    report.exhausted.push(local_id);
                    report.last_error = Some(err);
                }
            }
        }

        report.remaining = self
            .store
            .list_all()?
            .iter()
            .filter(|r| r.status != SyncStatus::Synced)
            .count();

        if !report.synced.is_empty() {
            self.schedule_prune();
        }
        self.refresh_status(Some(&report)).await;

        Ok(report)
    }

    async fn submit_one(&self, record: PendingOrder) -> Result<Attempt, StorageError> {
        let local_id = record.local_id.clone();
        self.store.update(&local_id, |r| r.status = SyncStatus::Syncing)?;

        let result = match timeout(
            self.policy.submit_timeout,
            self.api.submit_order(&local_id, &record.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Transient(format!(
                "submission timed out after {:?}",
                self.policy.submit_timeout
            ))),
        };

        self.settle(&record, result).map_err(|err| {
            if let Err(reset) = self.release_in_flight(&local_id) {
                log::error!("Order {local_id} could not be returned to pending: {reset}");
            }
            err
        })
    }

    /// Record the outcome of a submission.
    fn settle(
        &self,
        record: &PendingOrder,
        result: Result<SubmitAck, SubmitError>,
    ) -> Result<Attempt, StorageError> {
        let local_id = &record.local_id;
        match result {
            Ok(ack) => {
                let synced_at = now_ms();
                let server_id = ack.server_id.clone();
                self.store.update(local_id, |r| {
                    r.status = SyncStatus::Synced;
                    r.server_id = Some(server_id.clone());
                    r.synced_at_ms = Some(synced_at);
                    r.last_error = None;
                })?;
                metrics::record_synced();
                log::info!(
                    "Order {} confirmed as {} (created={})",
                    local_id,
                    ack.server_id,
                    ack.created
                );
                Ok(Attempt::Synced)
            }
            Err(SubmitError::Rejected { status, message }) => {
                let failed = self.store.update(local_id, |r| {
                    r.status = SyncStatus::Failed;
                    r.last_error = Some(message.clone());
                    r.failure = Some(FailureReason::Rejected {
                        status,
                        message: message.clone(),
                    });
                })?;
                if let Some(failed) = failed {
                    self.store.move_to_failed(&failed)?;
                }
                metrics::record_rejected();
                log::warn!("Order {local_id} rejected by server ({status}): {message}");
                Ok(Attempt::Rejected)
            }
            Err(SubmitError::Transient(err)) => {
                metrics::record_transient_failure();
                let failures = record.retry_count + 1;

                if self.policy.is_exhausted(failures) {
                    let failed = self.store.update(local_id, |r| {
                        r.status = SyncStatus::Failed;
                        r.retry_count = failures;
                        r.last_error = Some(err.clone());
                        r.failure = Some(FailureReason::RetriesExhausted {
                            last_error: err.clone(),
                        });
                    })?;
                    if let Some(failed) = failed {
                        self.store.move_to_failed(&failed)?;
                    }
                    log::error!("Order {local_id} failed after {failures} attempts: {err}");
                    return Ok(Attempt::Exhausted(err));
                }

                let delay = self.policy.backoff(failures);
                let next_attempt = add_ms(now_ms(), delay);
                self.store.update(local_id, |r| {
                    r.status = SyncStatus::Pending;
                    r.retry_count = failures;
                    r.next_attempt_at_ms = next_attempt;
                    r.last_error = Some(err.clone());
                })?;
                log::warn!(
                    "Order {local_id} submission failed (attempt {failures}/{}), retrying in {:?}: {err}",
                    self.policy.max_attempts,
                    delay
                );
                Ok(Attempt::Retrying(err))
            }
        }
    }

    fn release_in_flight(&self, local_id: &str) -> Result<Option<PendingOrder>, StorageError> {
        self.store.update(local_id, |r| {
            if r.status == SyncStatus::Syncing {
                r.status = SyncStatus::Pending;
            }
        })
    }

    /// Read-only snapshot of every queued record, oldest first.
    pub fn optimistic_view(&self) -> Result<Vec<PendingOrder>, StorageError> {
        self.store.list_all()
    }

    /// True while any queued record has not been confirmed by the server.
    pub fn has_backlog(&self) -> Result<bool, StorageError> {
        Ok(self
            .store
            .list_all()?
            .iter()
            .any(|r| r.status != SyncStatus::Synced))
    }

    pub fn get(&self, local_id: &str) -> Result<Option<PendingOrder>, StorageError> {
        self.store.get(local_id)
    }

    pub fn failed_orders(&self) -> Result<Vec<PendingOrder>, StorageError> {
        self.store.list_failed()
    }

    pub fn get_failed(&self, local_id: &str) -> Result<Option<PendingOrder>, StorageError> {
        self.store.get_failed(local_id)
    }

    /// Put a failed record back at the tail of the queue with a fresh retry
    /// budget. The `local_id` is kept so the server can still deduplicate.
    pub async fn retry_failed(&self, local_id: &str) -> Result<Option<PendingOrder>, StorageError> {
        let Some(mut record) = self.store.get_failed(local_id)? else {
            return Ok(None);
        };
        record.status = SyncStatus::Pending;
        record.retry_count = 0;
        record.next_attempt_at_ms = now_ms();
        record.failure = None;
        record.last_error = None;

        // Queue first: if the failed entry outlives a crash, opening the store
        // sees the pending copy and clears it.
        self.store.append(&record)?;
        self.store.remove_failed(local_id)?;
        log::info!("Order {local_id} moved back to the queue for another attempt");
        self.refresh_status(None).await;
        Ok(Some(record))
    }

    pub async fn discard_failed(&self, local_id: &str) -> Result<Option<PendingOrder>, StorageError> {
        let removed = self.store.remove_failed(local_id)?;
        if removed.is_some() {
            log::info!("Order {local_id} discarded from the failed list");
            self.refresh_status(None).await;
        }
        Ok(removed)
    }

    /// Pending records older than the staleness threshold.
    pub fn stale_orders(&self, now: u64) -> Result<Vec<PendingOrder>, StorageError> {
        let threshold = self.stale_after.as_millis() as u64;
        Ok(self
            .store
            .list_all()?
            .into_iter()
            .filter(|r| r.status == SyncStatus::Pending && r.age_ms(now) >= threshold)
            .collect())
    }

    /// Remove synced records whose grace period has elapsed.
    pub fn prune_confirmed(&self, now: u64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for record in self.store.list_all()? {
            if record.status != SyncStatus::Synced {
                continue;
            }
            let synced_at = record.synced_at_ms.unwrap_or(0);
            if add_ms(synced_at, self.confirm_grace) <= now {
                self.store.remove(&record.local_id)?;
                log::debug!("Order {} removed after confirmation", record.local_id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn schedule_prune(&self) {
        let queue = self.clone();
        let grace = self.confirm_grace;
        tokio::spawn(async move {
            sleep(grace).await;
            if let Err(e) = queue.prune_confirmed(now_ms()) {
                log::error!("Failed to prune confirmed orders: {e}");
            }
            queue.refresh_status(None).await;
        });
    }

    async fn refresh_status(&self, report: Option<&FlushReport>) {
        let Some(status) = &self.status else {
            return;
        };

        let pending = match self.store.list_all() {
            Ok(records) => records
                .iter()
                .filter(|r| r.status != SyncStatus::Synced)
                .count() as u64,
            Err(e) => {
                log::error!("Failed to read queue for status: {e}");
                return;
            }
        };
        let failed = self.store.failed_len() as u64;

        let mut status = status.lock().await;
        status.pending_orders = pending;
        status.failed_orders = failed;
        if let Some(report) = report {
            status.last_flush_ms = now_ms();
            status.last_synced = report.synced.len() as u64;
            status.last_error = report.last_error.clone();
        }
    }
}

use std::convert::TryInto;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::order::{FailureReason, OrderPayload, PendingOrder, SyncStatus};
use crate::storage::error::StorageError;

/// Durable queue of optimistic orders backed by dedicated Sled trees.
///
/// Queue entries are keyed by a monotonically increasing sequence ID encoded
/// in big-endian, so iteration order corresponds to insertion order (FIFO).
/// Every write touches a single key, which Sled applies atomically; a crash
/// mid-write can lose that write but never corrupts records already stored.
///
/// Terminally failed records live in a second tree keyed by `local_id` until
/// the user retries or discards them.
pub struct DurableQueueStore {
    queue: sled::Tree,
    failed: sled::Tree,
    next_id: Mutex<u64>,
    sync_writes: bool,
}

impl DurableQueueStore {
    const QUEUE_TREE: &'static str = "__order_queue__";
    const FAILED_TREE: &'static str = "__order_failed__";
    const META_NEXT_ID_KEY: &'static [u8] = b"__next_id__";

    /// Open or create the order queue in the given database.
    ///
    /// Opening also repairs what a crash may have left behind: records stuck
    /// in `syncing` go back to `pending`, and records already moved to the
    /// failed list are dropped from the queue.
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        let queue = db
            .open_tree(Self::QUEUE_TREE)
            .map_err(|e| StorageError::SledError(e.to_string()))?;
        let failed = db
            .open_tree(Self::FAILED_TREE)
            .map_err(|e| StorageError::SledError(e.to_string()))?;

        let mut next_id: u64 = 0;
        if let Some(bytes) = queue
            .get(Self::META_NEXT_ID_KEY)
            .map_err(|e| StorageError::SledError(e.to_string()))?
        {
            if let Ok(arr) = bytes.as_ref().try_into() as Result<[u8; 8], _> {
                next_id = u64::from_be_bytes(arr);
            }
        }

        let store = Self {
            queue,
            failed,
            next_id: Mutex::new(next_id),
            sync_writes: true,
        };
        store.recover()?;
        Ok(store)
    }

    /// Skip the fsync after each write. Only meant for tests and benchmarks.
    pub fn without_sync_writes(mut self) -> Self {
        self.sync_writes = false;
        self
    }

    /// Append a record at the tail of the queue. Returns its sequence ID.
    pub fn append(&self, record: &PendingOrder) -> Result<u64, StorageError> {
        let bytes = encode(record)?;

        let mut next_id = self
            .next_id
            .lock()
            .map_err(|_| StorageError::Poisoned)?;
        let id = next_id.wrapping_add(1);

        self.queue
            .insert(id.to_be_bytes(), bytes)
            .map_err(|e| StorageError::SledError(e.to_string()))?;

        // Persist next_id so sequence numbers never restart, even if the
        // queue drains completely.
        self.queue
            .insert(Self::META_NEXT_ID_KEY, id.to_be_bytes().to_vec())
            .map_err(|e| StorageError::SledError(e.to_string()))?;
        *next_id = id;
        drop(next_id);

        self.flush()?;
        Ok(id)
    }

    /// All queued records in insertion order.
    pub fn list_all(&self) -> Result<Vec<PendingOrder>, StorageError> {
        let mut records = Vec::new();
        for item in self.queue.iter() {
            let (key, value) = item.map_err(|e| StorageError::SledError(e.to_string()))?;
            // Only 8-byte keys are queue entries; everything else is metadata.
            if key.len() != 8 {
                continue;
            }
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    pub fn get(&self, local_id: &str) -> Result<Option<PendingOrder>, StorageError> {
        Ok(self.find(local_id)?.map(|(_, record)| record))
    }

    /// Apply `patch` to the record with the given `local_id` in place.
    ///
    /// The record keeps its queue position. Returns the patched record, or
    /// `None` if no such record is queued. `patch` may run more than once if
    /// the record changes concurrently.
    pub fn update<F>(&self, local_id: &str, patch: F) -> Result<Option<PendingOrder>, StorageError>
    where
        F: Fn(&mut PendingOrder),
    {
        loop {
            let Some((key, current)) = self.find_raw(local_id)? else {
                return Ok(None);
            };

            let mut record = decode(&current)?;
            patch(&mut record);
            let bytes = encode(&record)?;

            let swapped = self
                .queue
                .compare_and_swap(&key, Some(&current), Some(bytes))
                .map_err(|e| StorageError::SledError(e.to_string()))?;

            if swapped.is_ok() {
                self.flush()?;
                return Ok(Some(record));
            }
        }
    }

    /// Remove a record from the queue, returning it if it was present.
    pub fn remove(&self, local_id: &str) -> Result<Option<PendingOrder>, StorageError> {
        let Some((key, record)) = self.find(local_id)? else {
            return Ok(None);
        };
        self.queue
            .remove(key)
            .map_err(|e| StorageError::SledError(e.to_string()))?;
        self.flush()?;
        Ok(Some(record))
    }

    /// Move a record out of the retry cycle into the failed list.
    ///
    /// The queued copy is marked `failed` and the failed copy written before
    /// the queue entry is removed. If the process dies in between, `open`
    /// finishes the move.
    pub fn move_to_failed(&self, record: &PendingOrder) -> Result<(), StorageError> {
        self.update(&record.local_id, |r| r.status = SyncStatus::Failed)?;
        let bytes = encode(record)?;
        self.failed
            .insert(record.local_id.as_bytes(), bytes)
            .map_err(|e| StorageError::SledError(e.to_string()))?;
        self.flush()?;
        self.remove(&record.local_id)?;
        Ok(())
    }

    /// Failed records, ordered by creation time.
    pub fn list_failed(&self) -> Result<Vec<PendingOrder>, StorageError> {
        let mut records = Vec::new();
        for item in self.failed.iter() {
            let (_key, value) = item.map_err(|e| StorageError::SledError(e.to_string()))?;
            records.push(decode(&value)?);
        }
        records.sort_by_key(|r| r.created_at_ms);
        Ok(records)
    }

    pub fn get_failed(&self, local_id: &str) -> Result<Option<PendingOrder>, StorageError> {
        match self
            .failed
            .get(local_id.as_bytes())
            .map_err(|e| StorageError::SledError(e.to_string()))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a record from the failed list, returning it if present.
    pub fn remove_failed(&self, local_id: &str) -> Result<Option<PendingOrder>, StorageError> {
        let removed = self
            .failed
            .remove(local_id.as_bytes())
            .map_err(|e| StorageError::SledError(e.to_string()))?;
        match removed {
            Some(bytes) => {
                self.flush()?;
                Ok(Some(decode(&bytes)?))
            }
            None => Ok(None),
        }
    }

    /// Number of queued records.
    pub fn len(&self) -> Result<usize, StorageError> {
        let mut count: usize = 0;
        for item in self.queue.iter() {
            let (key, _value) = item.map_err(|e| StorageError::SledError(e.to_string()))?;
            if key.len() == 8 {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    pub fn failed_len(&self) -> usize {
        self.failed.len()
    }

    fn recover(&self) -> Result<(), StorageError> {
        for record in self.list_all()? {
            // A record in both places is a move that did not finish. A
            // `failed` queued copy was on its way out of the queue; anything
            // else was on its way back in through a retry.
            if self.get_failed(&record.local_id)?.is_some() {
                if record.status == SyncStatus::Failed {
                    log::warn!(
                        "Dropping queued order {} already present in the failed list",
                        record.local_id
                    );
                    self.remove(&record.local_id)?;
                    continue;
                }
                log::info!(
                    "Order {} was re-queued for retry, clearing its failed entry",
                    record.local_id
                );
                self.remove_failed(&record.local_id)?;
            }

            if record.status == SyncStatus::Syncing {
                log::info!(
                    "Order {} was in flight at shutdown, returning it to pending",
                    record.local_id
                );
                self.update(&record.local_id, |r| {
                    if r.status == SyncStatus::Syncing {
                        r.status = SyncStatus::Pending;
                    }
                })?;
            }
        }
        Ok(())
    }

    fn find(&self, local_id: &str) -> Result<Option<(sled::IVec, PendingOrder)>, StorageError> {
        match self.find_raw(local_id)? {
            Some((key, value)) => Ok(Some((key, decode(&value)?))),
            None => Ok(None),
        }
    }

    fn find_raw(&self, local_id: &str) -> Result<Option<(sled::IVec, sled::IVec)>, StorageError> {
        for item in self.queue.iter() {
            let (key, value) = item.map_err(|e| StorageError::SledError(e.to_string()))?;
            if key.len() != 8 {
                continue;
            }
            if decode(&value)?.local_id == local_id {
                return Ok(Some((key, value)));
            }
        }
        Ok(None)
    }

    fn flush(&self) -> Result<(), StorageError> {
        if self.sync_writes {
            self.queue
                .flush()
                .map_err(|e| StorageError::SledError(e.to_string()))?;
            self.failed
                .flush()
                .map_err(|e| StorageError::SledError(e.to_string()))?;
        }
        Ok(())
    }
}

/// On-disk shape of a queued order.
///
/// The payload is kept as JSON text: it may hold arbitrary JSON values,
/// which bincode's serde codec cannot decode.
#[derive(Serialize, Deserialize)]
struct StoredOrder {
    local_id: String,
    payload_json: String,
    status: SyncStatus,
    created_at_ms: u64,
    retry_count: u32,
    server_id: Option<String>,
    next_attempt_at_ms: u64,
    last_error: Option<String>,
    synced_at_ms: Option<u64>,
    failure: Option<FailureReason>,
}

fn encode(record: &PendingOrder) -> Result<Vec<u8>, StorageError> {
    let stored = StoredOrder {
        local_id: record.local_id.clone(),
        payload_json: serde_json::to_string(&record.payload)
            .map_err(|e| StorageError::CodecError(e.to_string()))?,
        status: record.status,
        created_at_ms: record.created_at_ms,
        retry_count: record.retry_count,
        server_id: record.server_id.clone(),
        next_attempt_at_ms: record.next_attempt_at_ms,
        last_error: record.last_error.clone(),
        synced_at_ms: record.synced_at_ms,
        failure: record.failure.clone(),
    };
    bincode::serde::encode_to_vec(&stored, bincode::config::standard())
        .map_err(|e| StorageError::CodecError(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<PendingOrder, StorageError> {
    let (stored, _): (StoredOrder, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::CodecError(e.to_string()))?;
    let payload: OrderPayload = serde_json::from_str(&stored.payload_json)
        .map_err(|e| StorageError::CodecError(e.to_string()))?;
    Ok(PendingOrder {
        local_id: stored.local_id,
        payload,
        status: stored.status,
        created_at_ms: stored.created_at_ms,
        retry_count: stored.retry_count,
        server_id: stored.server_id,
        next_attempt_at_ms: stored.next_attempt_at_ms,
        last_error: stored.last_error,
        synced_at_ms: stored.synced_at_ms,
        failure: stored.failure,
    })
}

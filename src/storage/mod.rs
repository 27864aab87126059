pub mod error;
pub mod offline_queue;

use std::path::Path;

pub use self::error::StorageError;
pub use self::offline_queue::DurableQueueStore;

/// Open (creating if needed) the Sled database under `data_dir`.
pub fn open_db(data_dir: &str) -> Result<sled::Db, StorageError> {
    let path = Path::new(data_dir);
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    sled::open(path).map_err(|e| StorageError::SledError(e.to_string()))
}

/// Open the durable order queue stored under `data_dir`.
pub fn open_queue(data_dir: &str) -> Result<(sled::Db, DurableQueueStore), StorageError> {
    let db = open_db(data_dir)?;
    let store = DurableQueueStore::open(&db)?;
    Ok((db, store))
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Sled error: {0}")]
    SledError(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Queue lock poisoned")]
    Poisoned,
}

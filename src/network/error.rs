use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP client error: {0}")]
    ClientError(#[from] reqwest::Error),
}

/// Outcome of a failed order submission.
///
/// `Transient` failures are retried; `Rejected` ones leave the retry cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl SubmitError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::Transient(_))
    }

    /// Classify an HTTP status that was not a success.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            408 | 429 | 500..=599 => {
                SubmitError::Transient(format!("server returned {status}: {message}"))
            }
            _ => SubmitError::Rejected { status, message },
        }
    }
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Channel is already connected")]
    AlreadyConnected,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

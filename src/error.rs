use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage Error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("Couldn't persist a batch, {pending} parcels were not written: {source}")]
    StorageFlush {
        pending: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),
    #[error("Couldn't send a completion through a channel.")]
    RuntimeSendError,
    #[error("The admission gate was closed while ids were still waiting.")]
    AdmissionClosed,

    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_value: mpsc::error::SendError<T>) -> Self {
        Error::RuntimeSendError
    }
}

/// Why a single identifier could not be fetched.
///
/// The variants split into transient ones, which the retry policy may try
/// again, and permanent ones, which end the item immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("server error {0}")]
    ServerError(u16),
    #[error("rate limited by remote")]
    RateLimited { retry_after: Option<Duration> },
    #[error("couldn't read response body: {0}")]
    Body(String),

    #[error("no record for this id")]
    NotFound,
    #[error("request rejected with status {0}")]
    Rejected(u16),
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout
                | FetchError::Connection(_)
                | FetchError::ServerError(_)
                | FetchError::RateLimited { .. }
                | FetchError::Body(_)
        )
    }
}

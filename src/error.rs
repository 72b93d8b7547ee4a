//! Error types for stagepipe.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A write was attempted after `close_for_writes`. Never expected in
    /// correct usage; the coordinator reports it once shutdown completes.
    #[error("queue protocol violation: put on closed queue {queue}")]
    QueueClosed { queue: &'static str },

    #[error("cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Errors for the ingestion core.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Invalid topic")]
    InvalidTopic(String),

    #[error("Invalid MMSI")]
    InvalidMmsi(String),

    #[error("Database connection error: {0}")]
    DatabaseConnectionError(String),

    #[error("Database error")]
    DatabaseError(#[from] sqlx::Error),

    #[error("storage still contended after {attempts} attempts")]
    StorageContention {
        attempts: u32,
        #[source]
        origin: sqlx::Error,
    },

    #[error("no usable credentials: {needed} session groups, capacity {capacity}")]
    InsufficientCredentials { needed: usize, capacity: usize },
}

//! Error types for mail-dispatch.

use std::path::PathBuf;

use crate::queue::CommandStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Command queue storage errors.
///
/// Not-found is never an error here: lookups return `None` / `false`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is locked by another process: {}", path.display())]
    Busy { path: PathBuf },

    #[error("Lock file error: {0}")]
    Lock(#[source] std::io::Error),

    #[error("Failed to open queue database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("A command with Message-ID {message_id} is already queued")]
    DuplicateMessage { message_id: String },

    #[error("Command {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: i64,
        from: CommandStatus,
        to: CommandStatus,
    },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

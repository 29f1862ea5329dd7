use thiserror::Error;

/// Main error type for callindex
#[derive(Error, Debug)]
pub enum CallIndexError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filename / cursor parse errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The job claim for an agent is no longer held by this run
    #[error("Lease lost for agent {agent}: {reason}")]
    LeaseLost { agent: String, reason: String },

    /// Audio container could not be probed
    #[error("Probe error: {0}")]
    Probe(String),

    /// Blocking task panicked or was cancelled by the runtime
    #[error("Task join error: {0}")]
    Join(String),
}

/// Convenient Result type using CallIndexError
pub type Result<T> = std::result::Result<T, CallIndexError>;

//! Error types for psi-agent

use thiserror::Error;

/// Result type alias using psi-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during agent operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the chat-provider layer
    #[error(transparent)]
    Provider(#[from] psi_ai::Error),

    /// History file I/O failed; the context must be replaced by the caller
    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    /// A tool with the same name is already registered
    #[error("Duplicate tool name: {0}")]
    DuplicateTool(String),

    /// Revert target outside the valid checkpoint range
    #[error("Invalid checkpoint {requested}: {available} checkpoints exist")]
    InvalidCheckpoint { requested: u32, available: u32 },

    /// An error during compaction
    #[error("Compaction error: {0}")]
    Compaction(String),
}

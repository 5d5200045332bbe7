//! Error types for the ghostline chat core

use thiserror::Error;

/// Main error type for chat core operations
#[derive(Error, Debug)]
pub enum ChatError {
    /// Directory publish or resolve failed (unreachable, timed out, dropped)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Outgoing message text exceeds the per-message size ceiling
    #[error("Message too large for the directory ({len} bytes, max {max}). Try a shorter message or share a link instead.")]
    PayloadTooLarge {
        /// Encoded byte length of the rejected text
        len: usize,
        /// The enforced ceiling
        max: usize,
    },

    /// The directory retained zero messages from a publish (record full)
    #[error("Message could not be published: directory record limit exceeded")]
    RecordLimitExceeded,

    /// Camera or microphone could not be acquired
    #[error("Media error: {0}")]
    Media(String),

    /// Inbound call signal could not be decoded
    #[error("Signal decode error: {0}")]
    SignalDecode(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Session was not found in storage
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session has been burned; no further sends or polls
    #[error("Chat has been burned")]
    Burned,

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using ChatError
pub type ChatResult<T> = Result<T, ChatError>;

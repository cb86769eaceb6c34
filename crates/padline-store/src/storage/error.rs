//! Storage error types.
//!
//! Defines errors that can occur during storage operations:
//! - `NotFound`: Requested conversation has no persisted ledger
//! - `Conflict`: Operation index gap or stale writer detected
//! - `Diverged`: In-memory ledger disagrees with what is persisted
//! - `Corrupt`: Persisted ledger does not replay
//! - `Serialization`: Failed to encode/decode data
//! - `Io`: Underlying storage system errors

use padline_core::{ConversationId, HistoryError};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Conversation not found
    #[error("conversation not found: {conversation_id}")]
    NotFound {
        /// Conversation that was not found
        conversation_id: ConversationId,
    },

    /// Operation index conflict
    ///
    /// Appends must start exactly at the persisted operation count. For
    /// example, appending at index 5 when 3 operations are stored (expected
    /// index 3), or checkpointing a ledger that is shorter than what is
    /// already persisted.
    #[error("operation index conflict: expected {expected}, got {got}")]
    Conflict {
        /// Persisted operation count
        expected: u64,
        /// Index supplied by the writer
        got: u64,
    },

    /// In-memory ledger disagrees with the persisted prefix
    ///
    /// Another writer persisted different operations for the conversation.
    /// The ledger must be reloaded, its unpersisted operations are lost.
    #[error("key history {conversation_id} diverged from storage within {operations} operations")]
    Diverged {
        /// Conversation whose ledger diverged
        conversation_id: ConversationId,
        /// Persisted operation count
        operations: u64,
    },

    /// Persisted ledger failed replay or its state snapshot check
    #[error("corrupt key history for {conversation_id}: {source}")]
    Corrupt {
        /// Conversation whose ledger is corrupt
        conversation_id: ConversationId,
        /// Replay failure
        #[source]
        source: HistoryError,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

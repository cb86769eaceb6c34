//! Storage abstraction for key histories
//!
//! Trait-based abstraction for persisting per-conversation ledgers. The trait
//! is synchronous (no async) to match the synchronous ledger core.
//!
//! Ledgers are persisted as an append-only sequence of operation records
//! plus a snapshot of the state after the last append. The snapshot is only
//! a corruption check: restoring always replays the operations.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use padline_core::{
    ConversationId, KeyHistory, KeyHistoryRecord, KeyInterval, Operation, OperationRecord,
};

pub use self::redb::RedbStorage;

/// Storage abstraction for key histories
///
/// Must be Clone, Send + Sync (thread-safe), and synchronous (no async
/// methods). Implementations typically share internal state via Arc, so
/// clones access the same underlying storage.
///
/// Each conversation needs a single writer: share one storage between
/// registries only if they own disjoint conversations. A second writer is
/// detected at checkpoint time, never merged.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Append operation records to a conversation's ledger
    ///
    /// # Invariants
    ///
    /// - Pre: `from_index` must equal the persisted operation count
    /// - Pre: `state_after` is the ledger state after the last appended
    ///   operation
    /// - Post: All records are persisted, or none are
    fn append_operations(
        &self,
        conversation_id: &ConversationId,
        from_index: u64,
        operations: &[OperationRecord],
        state_after: &KeyInterval,
    ) -> Result<(), StorageError>;

    /// Number of persisted operations. 0 if the conversation is unknown.
    fn operation_count(&self, conversation_id: &ConversationId) -> Result<u64, StorageError>;

    /// Load the persisted record for a conversation.
    ///
    /// Returns `None` if nothing has been persisted. The record is returned
    /// as stored, without replay.
    fn load_record(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<KeyHistoryRecord>, StorageError>;

    /// State snapshot written with the last append.
    ///
    /// Returns `None` if nothing has been persisted. The default reads the
    /// whole record; backends with a separate head override it.
    fn persisted_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<KeyInterval>, StorageError> {
        Ok(self.load_record(conversation_id)?.and_then(|record| record.current_state))
    }

    /// List all conversations with a persisted ledger.
    ///
    /// Order is not guaranteed.
    fn list_conversations(&self) -> Result<Vec<ConversationId>, StorageError>;

    /// Delete a conversation's whole ledger.
    ///
    /// Returns `false` if nothing was persisted. Only for conversation
    /// deletion: ledgers are otherwise never truncated.
    fn delete_history(&self, conversation_id: &ConversationId) -> Result<bool, StorageError>;

    /// Load and replay a conversation's ledger.
    ///
    /// # Errors
    ///
    /// - `StorageError::Corrupt` if the records do not replay or disagree
    ///   with the stored state snapshot
    fn load_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<KeyHistory>, StorageError> {
        let Some(record) = self.load_record(conversation_id)? else {
            return Ok(None);
        };

        KeyHistory::from_record(record).map(Some).map_err(|source| StorageError::Corrupt {
            conversation_id: conversation_id.clone(),
            source,
        })
    }

    /// Persist the operations of `history` that are not yet stored.
    ///
    /// Returns the number of operations appended (0 if already up to date).
    ///
    /// # Errors
    ///
    /// - `StorageError::Conflict` if storage holds more operations than
    ///   `history` (the in-memory ledger is stale)
    /// - `StorageError::Diverged` if the persisted state differs from the
    ///   state of `history` after the same number of operations
    fn checkpoint(&self, history: &KeyHistory) -> Result<usize, StorageError> {
        let conversation_id = history.conversation_id();
        let persisted = self.operation_count(conversation_id)?;
        let len = history.len() as u64;

        if persisted > len {
            tracing::warn!(
                conversation_id = %conversation_id,
                persisted,
                in_memory = len,
                "Refusing to checkpoint stale key history"
            );
            return Err(StorageError::Conflict { expected: persisted, got: len });
        }

        if persisted > 0 {
            let stored = self.persisted_state(conversation_id)?;
            let local = history.state_after(persisted as usize);

            if stored != local {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    persisted,
                    stored = ?stored,
                    local = ?local,
                    "Refusing to checkpoint diverged key history"
                );
                return Err(StorageError::Diverged {
                    conversation_id: conversation_id.clone(),
                    operations: persisted,
                });
            }
        }

        if persisted == len {
            return Ok(0);
        }

        let pending: Vec<OperationRecord> =
            history.operations()[persisted as usize..].iter().map(Operation::to_record).collect();

        self.append_operations(conversation_id, persisted, &pending, history.current_state())?;

        tracing::debug!(
            conversation_id = %conversation_id,
            appended = pending.len(),
            operations = len,
            "Checkpointed key history"
        );

        Ok(pending.len())
    }
}

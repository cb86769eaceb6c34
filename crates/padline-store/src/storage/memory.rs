#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use padline_core::{ConversationId, KeyHistoryRecord, KeyInterval, OperationRecord};

use super::{Storage, StorageError};

/// In-memory storage implementation for testing and simulation
///
/// Uses `HashMap` keyed by conversation and a Vec of operation records in
/// append order. All state is wrapped in Arc<Mutex<>> so clones share the
/// same ledgers. A poisoned mutex surfaces as `StorageError::Io`.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<HashMap<ConversationId, StoredLedger>>>,
}

struct StoredLedger {
    /// Operation records in append order
    operations: Vec<OperationRecord>,

    /// State after the last appended operation
    current_state: KeyInterval,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Number of conversations with persisted operations.
    ///
    /// Useful for debugging and testing.
    pub fn conversation_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.len())
    }

    /// Total number of operations across all conversations.
    ///
    /// Useful for debugging and testing.
    pub fn total_operation_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.values().map(|ledger| ledger.operations.len()).sum())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ConversationId, StoredLedger>>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Io("memory storage mutex poisoned".to_string()))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn append_operations(
        &self,
        conversation_id: &ConversationId,
        from_index: u64,
        operations: &[OperationRecord],
        state_after: &KeyInterval,
    ) -> Result<(), StorageError> {
        debug_assert_eq!(state_after.conversation_id(), conversation_id);

        let mut inner = self.lock()?;

        let expected_index =
            inner.get(conversation_id).map_or(0, |ledger| ledger.operations.len() as u64);

        if from_index != expected_index {
            return Err(StorageError::Conflict { expected: expected_index, got: from_index });
        }

        if operations.is_empty() {
            return Ok(());
        }

        let ledger = inner.entry(conversation_id.clone()).or_insert_with(|| StoredLedger {
            operations: Vec::new(),
            current_state: KeyInterval::empty(conversation_id.clone()),
        });

        ledger.operations.extend_from_slice(operations);
        ledger.current_state = state_after.clone();

        debug_assert_eq!(ledger.operations.len() as u64, from_index + operations.len() as u64);

        Ok(())
    }

    fn operation_count(&self, conversation_id: &ConversationId) -> Result<u64, StorageError> {
        let inner = self.lock()?;

        Ok(inner.get(conversation_id).map_or(0, |ledger| ledger.operations.len() as u64))
    }

    fn load_record(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<KeyHistoryRecord>, StorageError> {
        let inner = self.lock()?;

        Ok(inner.get(conversation_id).map(|ledger| KeyHistoryRecord {
            conversation_id: conversation_id.clone(),
            operations: ledger.operations.clone(),
            current_state: Some(ledger.current_state.clone()),
        }))
    }

    fn persisted_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<KeyInterval>, StorageError> {
        let inner = self.lock()?;

        Ok(inner.get(conversation_id).map(|ledger| ledger.current_state.clone()))
    }

    fn list_conversations(&self) -> Result<Vec<ConversationId>, StorageError> {
        let inner = self.lock()?;

        Ok(inner.keys().cloned().collect())
    }

    fn delete_history(&self, conversation_id: &ConversationId) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;

        Ok(inner.remove(conversation_id).is_some())
    }
}

//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. An
//! append either lands completely (operations and state snapshot) or not at
//! all.

use std::{path::Path, sync::Arc};

use padline_core::{ConversationId, HistoryError, KeyHistoryRecord, KeyInterval, OperationRecord};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{Storage, StorageError};

/// Table: operations
/// Key: (`conversation_id`, index) as `[id_len: 4 BE][id bytes][index: 8 BE]`
/// Value: CBOR-encoded `OperationRecord`
const OPERATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("operations");

/// Table: conversations
/// Key: `conversation_id`
/// Value: CBOR-encoded `LedgerHead`
const CONVERSATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("conversations");

/// Per-conversation summary written in the same transaction as each append.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerHead {
    operation_count: u64,
    current_state: KeyInterval,
}

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (OPERATIONS, CONVERSATIONS).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(OPERATIONS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        tracing::debug!(path = %path.as_ref().display(), "Opened key history database");

        Ok(Self { db: Arc::new(db) })
    }

    fn load_head<T: ReadableTable<&'static str, &'static [u8]>>(
        table: &T,
        conversation_id: &ConversationId,
    ) -> Result<Option<LedgerHead>, StorageError> {
        match table.get(conversation_id.as_str()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => Ok(Some(decode_cbor(value.value())?)),
            None => Ok(None),
        }
    }
}

impl Storage for RedbStorage {
    fn append_operations(
        &self,
        conversation_id: &ConversationId,
        from_index: u64,
        operations: &[OperationRecord],
        state_after: &KeyInterval,
    ) -> Result<(), StorageError> {
        debug_assert_eq!(state_after.conversation_id(), conversation_id);

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut heads =
                txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            let expected_index =
                Self::load_head(&heads, conversation_id)?.map_or(0, |head| head.operation_count);

            if from_index != expected_index {
                return Err(StorageError::Conflict { expected: expected_index, got: from_index });
            }

            if operations.is_empty() {
                return Ok(());
            }

            let mut table =
                txn.open_table(OPERATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            for (offset, operation) in operations.iter().enumerate() {
                let key = encode_operation_key(conversation_id, from_index + offset as u64);
                let value = encode_cbor(operation)?;
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }

            let head = LedgerHead {
                operation_count: from_index + operations.len() as u64,
                current_state: state_after.clone(),
            };
            let value = encode_cbor(&head)?;
            heads
                .insert(conversation_id.as_str(), value.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn operation_count(&self, conversation_id: &ConversationId) -> Result<u64, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let heads = txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self::load_head(&heads, conversation_id)?.map_or(0, |head| head.operation_count))
    }

    fn load_record(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<KeyHistoryRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;

        let heads = txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;
        let Some(head) = Self::load_head(&heads, conversation_id)? else {
            return Ok(None);
        };

        let table = txn.open_table(OPERATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

        let start_key = encode_operation_key(conversation_id, 0);
        let end_key = encode_operation_key(conversation_id, u64::MAX);

        let results = table
            .range(start_key.as_slice()..=end_key.as_slice())
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let id_bytes = conversation_id.as_str().as_bytes();
        let mut operations = Vec::with_capacity(head.operation_count as usize);
        for result in results {
            let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let expected = operations.len() as u64;

            let in_sequence = matches!(
                decode_operation_key(key.value()),
                Some((id, index)) if id == id_bytes && index == expected
            );
            if !in_sequence {
                return Err(corrupt(
                    conversation_id,
                    format!("operation key out of sequence at index {expected}"),
                ));
            }

            operations.push(decode_cbor(value.value())?);
        }

        if operations.len() as u64 != head.operation_count {
            return Err(corrupt(
                conversation_id,
                format!(
                    "expected {} operations, found {}",
                    head.operation_count,
                    operations.len()
                ),
            ));
        }

        Ok(Some(KeyHistoryRecord {
            conversation_id: conversation_id.clone(),
            operations,
            current_state: Some(head.current_state),
        }))
    }

    fn persisted_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<KeyInterval>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let heads = txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self::load_head(&heads, conversation_id)?.map(|head| head.current_state))
    }

    fn list_conversations(&self) -> Result<Vec<ConversationId>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;

        let heads = txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut conversations = Vec::new();

        for result in heads.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            conversations.push(ConversationId::new(key.value()));
        }

        Ok(conversations)
    }

    fn delete_history(&self, conversation_id: &ConversationId) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut heads =
                txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            let existed = heads
                .remove(conversation_id.as_str())
                .map_err(|e| StorageError::Io(e.to_string()))?
                .is_some();

            if !existed {
                return Ok(false);
            }

            let mut table =
                txn.open_table(OPERATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            let start_key = encode_operation_key(conversation_id, 0);
            let end_key = encode_operation_key(conversation_id, u64::MAX);

            let mut keys = Vec::new();
            for result in table
                .range(start_key.as_slice()..=end_key.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?
            {
                let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                keys.push(key.value().to_vec());
            }

            for key in &keys {
                table.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }

            tracing::info!(
                conversation_id = %conversation_id,
                operations = keys.len(),
                "Deleted key history"
            );
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(true)
    }
}

/// Encode (`conversation_id`, index) as an operation key.
///
/// Layout: [id_len: 4 bytes BE][id bytes][index: 8 bytes BE]
/// The length prefix keeps each conversation's keys contiguous (no id is a
/// prefix of another's key range) and big-endian indices keep lexicographic
/// ordering equal to numeric ordering.
fn encode_operation_key(conversation_id: &ConversationId, index: u64) -> Vec<u8> {
    let id = conversation_id.as_str().as_bytes();
    debug_assert!(id.len() <= u32::MAX as usize);

    let mut key = Vec::with_capacity(4 + id.len() + 8);
    key.extend_from_slice(&(id.len() as u32).to_be_bytes());
    key.extend_from_slice(id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Decode an operation key back to (id bytes, index).
///
/// Returns `None` if the key does not follow the layout.
fn decode_operation_key(key: &[u8]) -> Option<(&[u8], u64)> {
    let (len_bytes, rest) = key.split_first_chunk::<4>()?;
    let id_len = u32::from_be_bytes(*len_bytes) as usize;

    if rest.len() != id_len.checked_add(8)? {
        return None;
    }

    let (id, index_bytes) = rest.split_at(id_len);
    let index = u64::from_be_bytes(index_bytes.try_into().ok()?);
    Some((id, index))
}

fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn corrupt(conversation_id: &ConversationId, reason: String) -> StorageError {
    tracing::warn!(
        conversation_id = %conversation_id,
        %reason,
        "Persisted operation table is inconsistent"
    );
    StorageError::Corrupt {
        conversation_id: conversation_id.clone(),
        source: HistoryError::Codec(reason),
    }
}

#[cfg(test)]
mod tests {
    use padline_core::{KeyHistory, Operation};
    use tempfile::tempdir;

    use super::*;

    fn segment(id: &str, start: u64, end: u64) -> KeyInterval {
        KeyInterval::new(id, start, end).unwrap()
    }

    fn sample_history(id: &str) -> KeyHistory {
        let mut history = KeyHistory::new(id);
        history.record_extension(segment(id, 0, 1024), "kex id=k1", Some("k1".into())).unwrap();
        history.record_consumption(segment(id, 0, 12), "send", Some("m1".into())).unwrap();
        history.record_consumption(segment(id, 12, 14), "recv", Some("m2".into())).unwrap();
        history
    }

    #[test]
    fn test_operation_key_encoding() {
        let id = ConversationId::from("conversation-42");
        let key = encode_operation_key(&id, 42);
        assert_eq!(key.len(), 4 + 15 + 8);

        let (decoded_id, decoded_index) = decode_operation_key(&key).unwrap();
        assert_eq!(decoded_id, b"conversation-42");
        assert_eq!(decoded_index, 42);
    }

    #[test]
    fn test_operation_key_rejects_malformed() {
        assert!(decode_operation_key(&[]).is_none());
        assert!(decode_operation_key(&[0, 0, 0, 3, b'a']).is_none());
        assert!(decode_operation_key(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_operation_key_ranges_do_not_interleave() {
        let a = ConversationId::from("a");
        let ab = ConversationId::from("ab");

        // Every key of "a" sorts before every key of "ab"
        assert!(encode_operation_key(&a, u64::MAX) < encode_operation_key(&ab, 0));
        assert!(encode_operation_key(&a, 1) < encode_operation_key(&a, 256));
    }

    #[test]
    fn test_checkpoint_and_load() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let history = sample_history("c");

        assert_eq!(storage.checkpoint(&history).unwrap(), 3);
        assert_eq!(storage.operation_count(history.conversation_id()).unwrap(), 3);

        let loaded = storage.load_history(history.conversation_id()).unwrap().unwrap();
        assert_eq!(loaded.operations(), history.operations());
        assert_eq!(loaded.current_state(), history.current_state());
    }

    #[test]
    fn test_append_conflict() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let history = sample_history("c");
        let records: Vec<OperationRecord> =
            history.operations().iter().map(Operation::to_record).collect();
        let id = history.conversation_id();

        storage.append_operations(id, 0, &records[..1], &segment("c", 0, 1024)).unwrap();

        // Try to append at index 2 (gap)
        let result = storage.append_operations(id, 2, &records[2..], history.current_state());

        match result {
            Err(StorageError::Conflict { expected: 1, got: 2 }) => {},
            other => panic!("Expected Conflict error, got: {other:?}"),
        }
        assert_eq!(storage.operation_count(id).unwrap(), 1);
    }

    #[test]
    fn test_unknown_conversation() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let id = ConversationId::from("missing");

        assert_eq!(storage.operation_count(&id).unwrap(), 0);
        assert!(storage.load_history(&id).unwrap().is_none());
        assert!(!storage.delete_history(&id).unwrap());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        let history = sample_history("c");

        {
            let storage = RedbStorage::open(&path).unwrap();
            storage.checkpoint(&history).unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        let loaded = storage.load_history(history.conversation_id()).unwrap().unwrap();
        assert_eq!(loaded.format(), history.format());
    }

    #[test]
    fn test_incremental_checkpoints() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let mut history = KeyHistory::new("c");

        for round in 0..10u64 {
            let extension = history.extend_segment(100).unwrap();
            history.record_extension(extension, format!("kex id=k{round}"), None).unwrap();
            let message = history.consume_segment(40).unwrap();
            history.record_consumption(message, "send", None).unwrap();

            assert_eq!(storage.checkpoint(&history).unwrap(), 2);
        }

        let loaded = storage.load_history(history.conversation_id()).unwrap().unwrap();
        assert_eq!(loaded.len(), 20);
        assert_eq!(loaded.current_state(), &segment("c", 400, 1000));
    }

    #[test]
    fn test_persisted_state_tracks_head() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let history = sample_history("c");
        let id = history.conversation_id();

        assert_eq!(storage.persisted_state(id).unwrap(), None);

        storage.checkpoint(&history).unwrap();
        assert_eq!(storage.persisted_state(id).unwrap().as_ref(), Some(history.current_state()));

        let mut diverged = KeyHistory::new("c");
        for _ in 0..history.len() {
            let segment = diverged.extend_segment(8).unwrap();
            diverged.record_extension(segment, "kex", None).unwrap();
        }
        assert!(matches!(storage.checkpoint(&diverged), Err(StorageError::Diverged { .. })));
    }

    #[test]
    fn test_list_conversations() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        assert_eq!(storage.list_conversations().unwrap(), vec![]);

        for id in ["a", "ab", "b"] {
            storage.checkpoint(&sample_history(id)).unwrap();
        }

        let mut conversations = storage.list_conversations().unwrap();
        conversations.sort();
        assert_eq!(conversations, vec![
            ConversationId::from("a"),
            ConversationId::from("ab"),
            ConversationId::from("b"),
        ]);

        // Neighbouring ids keep separate operation ranges
        let a = storage.load_history(&ConversationId::from("a")).unwrap().unwrap();
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_delete_history() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        storage.checkpoint(&sample_history("a")).unwrap();
        storage.checkpoint(&sample_history("ab")).unwrap();

        assert!(storage.delete_history(&ConversationId::from("a")).unwrap());
        assert!(storage.load_history(&ConversationId::from("a")).unwrap().is_none());

        let ab = storage.load_history(&ConversationId::from("ab")).unwrap().unwrap();
        assert_eq!(ab.len(), 3);

        // A fresh ledger can reuse the id from index 0
        storage.checkpoint(&sample_history("a")).unwrap();
        assert_eq!(storage.operation_count(&ConversationId::from("a")).unwrap(), 3);
    }

    #[test]
    fn test_tampered_head_is_corrupt() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        storage.checkpoint(&sample_history("c")).unwrap();

        let head = LedgerHead { operation_count: 3, current_state: segment("c", 0, 1024) };
        let txn = storage.db.begin_write().unwrap();
        {
            let mut heads = txn.open_table(CONVERSATIONS).unwrap();
            heads.insert("c", encode_cbor(&head).unwrap().as_slice()).unwrap();
        }
        txn.commit().unwrap();

        match storage.load_history(&ConversationId::from("c")) {
            Err(StorageError::Corrupt { source: HistoryError::StateMismatch { .. }, .. }) => {},
            other => panic!("Expected Corrupt error, got: {other:?}"),
        }
    }

    #[test]
    fn test_missing_operation_is_corrupt() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let id = ConversationId::from("c");
        storage.checkpoint(&sample_history("c")).unwrap();

        let txn = storage.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(OPERATIONS).unwrap();
            table.remove(encode_operation_key(&id, 1).as_slice()).unwrap();
        }
        txn.commit().unwrap();

        match storage.load_history(&id) {
            Err(StorageError::Corrupt { source: HistoryError::Codec(_), .. }) => {},
            other => panic!("Expected Corrupt error, got: {other:?}"),
        }
    }
}

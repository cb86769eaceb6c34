//! Append-only key history for one conversation.
//!
//! The ledger is the single source of truth for which key stream offsets a
//! conversation has exchanged and spent. Operations are only ever appended;
//! the current state is a cache of folding them from the empty interval.
//!
//! Flow: a key exchange records an extension, a message service probes the
//! next bytes with [`KeyHistory::consume_segment`], performs the transform
//! elsewhere, and records the consumption only once the message has been
//! durably handled.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    ConversationId, HistoryError, KeyError, KeyInterval, Operation, OperationKind,
    record::KeyHistoryRecord,
};

/// Ordered ledger of extensions and consumptions for one conversation.
///
/// # Invariants
///
/// - Every segment belongs to `conversation_id`
/// - `current_state` equals the fold of `operations` from `[0, 0)`, and
///   `states[i]` the fold of the first `i + 1`
/// - Operations are never removed or edited
///
/// Mutation takes `&mut self` and is not synchronized. Callers sharing a
/// ledger across tasks serialize access per conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "KeyHistoryRecord", try_from = "KeyHistoryRecord")]
pub struct KeyHistory {
    conversation_id: ConversationId,
    operations: Vec<Operation>,
    /// State after each operation, parallel to `operations`
    states: Vec<KeyInterval>,
    current_state: KeyInterval,
}

impl KeyHistory {
    /// Create an empty ledger.
    pub fn new(conversation_id: impl Into<ConversationId>) -> Self {
        let conversation_id = conversation_id.into();
        let current_state = KeyInterval::empty(conversation_id.clone());
        Self { conversation_id, operations: Vec::new(), states: Vec::new(), current_state }
    }

    /// Conversation this ledger belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Key range currently available for consumption.
    pub fn current_state(&self) -> &KeyInterval {
        &self.current_state
    }

    /// Recorded operations, oldest first.
    ///
    /// Read-only view. Copying it out (`to_vec()`) detaches the copy from
    /// the ledger. The view itself cannot grow:
    ///
    /// ```compile_fail
    /// use padline_core::{KeyHistory, KeyInterval};
    ///
    /// let mut history = KeyHistory::new("c");
    /// history.record_extension(KeyInterval::new("c", 0, 16)?, "kex", None)?;
    ///
    /// let forged = history.operations()[0].clone();
    /// history.operations().push(forged);
    /// # Ok::<(), padline_core::KeyError>(())
    /// ```
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// State after the first `count` operations.
    ///
    /// `state_after(0)` is `[0, 0)` and `state_after(len())` is the current
    /// state. `None` if `count` exceeds the number of operations.
    pub fn state_after(&self, count: usize) -> Option<KeyInterval> {
        match count.checked_sub(1) {
            None => Some(KeyInterval::empty(self.conversation_id.clone())),
            Some(index) => self.states.get(index).cloned(),
        }
    }

    /// Bytes available for consumption.
    pub fn available(&self) -> u64 {
        self.current_state.len()
    }

    /// Total bytes ever appended by key exchanges.
    pub fn total_extended(&self) -> u64 {
        self.total(OperationKind::Extension)
    }

    /// Total bytes ever spent on messages.
    pub fn total_consumed(&self) -> u64 {
        self.total(OperationKind::Consumption)
    }

    /// Next `len` bytes available for a message. Pure probe, see
    /// [`KeyInterval::consume_segment`].
    pub fn consume_segment(&self, len: u64) -> Result<KeyInterval, KeyError> {
        self.current_state.consume_segment(len)
    }

    /// Next `len` bytes a key exchange would append. See
    /// [`KeyInterval::extend_segment`].
    pub fn extend_segment(&self, len: u64) -> Result<KeyInterval, KeyError> {
        self.current_state.extend_segment(len)
    }

    /// Record key material appended by a key exchange.
    ///
    /// All-or-nothing: on error the ledger is unchanged.
    ///
    /// # Errors
    ///
    /// - `KeyError::CrossConversationMismatch` if the segment belongs to
    ///   another conversation
    /// - `KeyError::NonContiguousExtension` if the segment does not start at
    ///   the current end
    pub fn record_extension(
        &mut self,
        segment: KeyInterval,
        reason: impl Into<String>,
        kex_id: Option<String>,
    ) -> Result<&KeyInterval, KeyError> {
        let operation = Operation::Extension { segment, reason: reason.into(), kex_id };
        self.record(operation)
    }

    /// Record key material spent on one message.
    ///
    /// All-or-nothing: on error the ledger is unchanged.
    ///
    /// # Errors
    ///
    /// - `KeyError::CrossConversationMismatch` if the segment belongs to
    ///   another conversation
    /// - `KeyError::NonContiguousConsumption` if the segment does not start
    ///   at the current start
    /// - `KeyError::InsufficientKeyMaterial` if the segment runs past the
    ///   current end
    pub fn record_consumption(
        &mut self,
        segment: KeyInterval,
        reason: impl Into<String>,
        message_id: Option<String>,
    ) -> Result<&KeyInterval, KeyError> {
        let operation = Operation::Consumption { segment, reason: reason.into(), message_id };
        self.record(operation)
    }

    /// Audit trail, one line per state transition starting with `t0`.
    ///
    /// ```text
    /// t0 : key = [0, 0)
    /// t1 : key = [0, 1024)  + [0, 1024)  kex id=kex_123
    /// t2 : key = [12, 1024)  - [0, 12)  send "hello world"
    /// ```
    pub fn format(&self) -> String {
        self.to_string()
    }

    /// Persisted form, including a snapshot of the current state.
    pub fn to_record(&self) -> KeyHistoryRecord {
        KeyHistoryRecord {
            conversation_id: self.conversation_id.clone(),
            operations: self.operations.iter().map(Operation::to_record).collect(),
            current_state: Some(self.current_state.clone()),
        }
    }

    /// Restore a ledger by replaying its persisted operations.
    ///
    /// The stored snapshot, when present, must match the replayed state.
    ///
    /// # Errors
    ///
    /// - `HistoryError::Replay` if an operation is rejected by the algebra
    /// - `HistoryError::StateMismatch` if the snapshot disagrees with replay
    pub fn from_record(record: KeyHistoryRecord) -> Result<Self, HistoryError> {
        let mut history = Self::new(record.conversation_id);

        for (index, operation) in record.operations.into_iter().enumerate() {
            let replayed = Operation::from_record(operation, &history.conversation_id)
                .and_then(|operation| history.push(operation));

            if let Err(source) = replayed {
                tracing::warn!(
                    conversation_id = %history.conversation_id,
                    index,
                    error = %source,
                    "Persisted key history failed to replay"
                );
                return Err(HistoryError::Replay { index, source });
            }
        }

        if let Some(persisted) = record.current_state
            && persisted != history.current_state
        {
            tracing::warn!(
                conversation_id = %history.conversation_id,
                persisted = %persisted,
                replayed = %history.current_state,
                "Persisted key state disagrees with replayed history"
            );
            return Err(HistoryError::StateMismatch { persisted, replayed: history.current_state });
        }

        tracing::debug!(
            conversation_id = %history.conversation_id,
            operations = history.len(),
            state = %history.current_state,
            "Restored key history"
        );

        Ok(history)
    }

    /// Encode as CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>, HistoryError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&self.to_record(), &mut bytes)
            .map_err(|e| HistoryError::Codec(e.to_string()))?;
        Ok(bytes)
    }

    /// Decode from CBOR and replay. See [`from_record`](Self::from_record).
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, HistoryError> {
        let record: KeyHistoryRecord =
            ciborium::from_reader(bytes).map_err(|e| HistoryError::Codec(e.to_string()))?;
        Self::from_record(record)
    }

    fn record(&mut self, operation: Operation) -> Result<&KeyInterval, KeyError> {
        let kind = operation.kind();
        let segment = operation.segment().clone();

        if let Err(e) = self.push(operation) {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                ?kind,
                segment = %segment,
                state = %self.current_state,
                error = %e,
                "Rejected key operation"
            );
            return Err(e);
        }

        tracing::debug!(
            conversation_id = %self.conversation_id,
            ?kind,
            segment = %segment,
            state = %self.current_state,
            operations = self.operations.len(),
            "Recorded key operation"
        );

        Ok(&self.current_state)
    }

    fn push(&mut self, operation: Operation) -> Result<(), KeyError> {
        let next = operation.apply(&self.current_state)?;

        debug_assert_eq!(next.conversation_id(), &self.conversation_id);

        self.operations.push(operation);
        self.states.push(next.clone());
        self.current_state = next;
        Ok(())
    }

    fn total(&self, kind: OperationKind) -> u64 {
        self.operations
            .iter()
            .filter(|op| op.kind() == kind)
            .map(|op| op.segment().len())
            .sum()
    }
}

impl fmt::Display for KeyHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t0 : key = {}", KeyInterval::empty(self.conversation_id.clone()))?;

        for (i, (operation, state)) in self.operations.iter().zip(&self.states).enumerate() {
            write!(
                f,
                "\nt{} : key = {}  {} {}  {}",
                i + 1,
                state,
                operation.sign(),
                operation.segment(),
                operation.reason()
            )?;
        }

        Ok(())
    }
}

impl From<KeyHistory> for KeyHistoryRecord {
    fn from(history: KeyHistory) -> Self {
        history.to_record()
    }
}

impl TryFrom<KeyHistoryRecord> for KeyHistory {
    type Error = HistoryError;

    fn try_from(record: KeyHistoryRecord) -> Result<Self, Self::Error> {
        Self::from_record(record)
    }
}

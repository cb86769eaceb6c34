//! Persisted layout of a key history.
//!
//! One [`KeyHistoryRecord`] per conversation: the id, the ordered operation
//! records, and an optional snapshot of the current state. The snapshot is a
//! cache used to detect corruption on restore, never ground truth.

use serde::{Deserialize, Serialize};

use crate::{ConversationId, KeyInterval, OperationKind};

/// Persisted form of one ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// Extension or consumption
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// First offset of the applied segment
    pub start_index: u64,
    /// End offset (exclusive) of the applied segment
    pub end_index: u64,
    /// Free-text audit reason
    pub reason: String,
    /// Key exchange id, extensions only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kex_id: Option<String>,
    /// Message id, consumptions only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Persisted form of a whole ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyHistoryRecord {
    /// Conversation the ledger belongs to
    pub conversation_id: ConversationId,
    /// Operations in the order they were recorded
    pub operations: Vec<OperationRecord>,
    /// State at the time the record was written, checked against replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<KeyInterval>,
}

//! Error types for key accounting.
//!
//! Two layers: [`KeyError`] for the interval algebra (every variant is a
//! protocol bug upstream and never recoverable by the core) and
//! [`HistoryError`] for restoring a ledger from its persisted form.

use thiserror::Error;

use crate::{ConversationId, KeyInterval};

/// Errors raised by the key interval algebra.
///
/// Each variant aborts the single operation that triggered it. Nothing is
/// clamped or resynchronized: a misaligned offset here means key bytes could
/// be reused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Interval constructed with `start > end`
    #[error("invalid interval: start {start} is past end {end}")]
    InvalidInterval {
        /// Requested start offset
        start: u64,
        /// Requested end offset
        end: u64,
    },

    /// Operands belong to different conversations
    #[error("conversation mismatch: expected {expected}, got {actual}")]
    CrossConversationMismatch {
        /// Conversation of the interval being operated on
        expected: ConversationId,
        /// Conversation of the segment that was applied
        actual: ConversationId,
    },

    /// Extension does not continue exactly from the current end
    #[error("non-contiguous extension: segment starts at {actual_start}, expected {expected_start}")]
    NonContiguousExtension {
        /// Current end of the key range
        expected_start: u64,
        /// Start of the rejected segment
        actual_start: u64,
    },

    /// Consumption does not remove from the current front
    #[error(
        "non-contiguous consumption: segment starts at {actual_start}, expected {expected_start}"
    )]
    NonContiguousConsumption {
        /// Current start of the key range
        expected_start: u64,
        /// Start of the rejected segment
        actual_start: u64,
    },

    /// Consumption runs past the key material that has been exchanged
    #[error("insufficient key material: segment ends at {requested_end}, key ends at {available_end}")]
    InsufficientKeyMaterial {
        /// Current end of the key range
        available_end: u64,
        /// End of the rejected segment
        requested_end: u64,
    },

    /// Segment arithmetic would leave the 64-bit offset space
    #[error("key offset overflow: {index} + {len} exceeds u64::MAX")]
    IndexOverflow {
        /// Offset the segment would start from
        index: u64,
        /// Requested segment length
        len: u64,
    },
}

/// Errors raised while restoring a [`KeyHistory`](crate::KeyHistory) from
/// its persisted record or bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// A persisted operation was rejected by the algebra during replay
    #[error("replay failed at operation {index}: {source}")]
    Replay {
        /// Zero-based position of the rejected operation
        index: usize,
        /// Algebra failure for that operation
        #[source]
        source: KeyError,
    },

    /// Replayed state disagrees with the persisted snapshot
    #[error("state mismatch: persisted {persisted}, replayed {replayed}")]
    StateMismatch {
        /// Snapshot stored alongside the operations
        persisted: KeyInterval,
        /// State obtained by folding the operations
        replayed: KeyInterval,
    },

    /// CBOR encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(String),
}

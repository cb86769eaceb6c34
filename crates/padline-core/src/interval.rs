//! Half-open key stream intervals and their algebra.
//!
//! A [`KeyInterval`] is the unit of currency of the ledger: a contiguous
//! range `[start, end)` of one conversation's key stream. The algebra only
//! ever grows a range at its end and shrinks it at its front, which turns the
//! key stream into a strictly ordered, gap-free sequence of bytes that are
//! handed out at most once.
//!
//! ```text
//!            consume (-)                     extend (+)
//!                │                               │
//!                ▼                               ▼
//!   ... spent ...[start ........ available ...... end) ... not yet exchanged ...
//! ```

use std::{
    fmt,
    ops::{Add, Sub},
};

use serde::{Deserialize, Serialize};

use crate::{ConversationId, KeyError};

/// Contiguous half-open range `[start, end)` of a conversation's key stream.
///
/// Immutable: every algebra operation returns a new value.
///
/// # Invariants
///
/// - `start <= end`, enforced at construction and deserialization
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "KeyIntervalRecord")]
pub struct KeyInterval {
    conversation_id: ConversationId,
    start_index: u64,
    end_index: u64,
}

/// Unvalidated wire form, checked by `TryFrom` on the way in.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyIntervalRecord {
    conversation_id: ConversationId,
    start_index: u64,
    end_index: u64,
}

impl TryFrom<KeyIntervalRecord> for KeyInterval {
    type Error = KeyError;

    fn try_from(record: KeyIntervalRecord) -> Result<Self, Self::Error> {
        Self::new(record.conversation_id, record.start_index, record.end_index)
    }
}

impl KeyInterval {
    /// Create the interval `[start, end)`.
    ///
    /// # Errors
    ///
    /// - `KeyError::InvalidInterval` if `start > end`
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        start: u64,
        end: u64,
    ) -> Result<Self, KeyError> {
        if start > end {
            return Err(KeyError::InvalidInterval { start, end });
        }

        Ok(Self { conversation_id: conversation_id.into(), start_index: start, end_index: end })
    }

    /// The empty interval `[0, 0)` a conversation starts from.
    pub fn empty(conversation_id: impl Into<ConversationId>) -> Self {
        Self { conversation_id: conversation_id.into(), start_index: 0, end_index: 0 }
    }

    /// Conversation this interval belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// First offset in the interval (inclusive).
    pub fn start(&self) -> u64 {
        self.start_index
    }

    /// Offset one past the last byte (exclusive).
    pub fn end(&self) -> u64 {
        self.end_index
    }

    /// Number of key bytes covered.
    pub fn len(&self) -> u64 {
        debug_assert!(self.start_index <= self.end_index);
        self.end_index - self.start_index
    }

    /// True if the interval covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.start_index == self.end_index
    }

    /// Grow this interval by a segment appended at its end.
    ///
    /// # Errors
    ///
    /// - `KeyError::CrossConversationMismatch` if the segment belongs to
    ///   another conversation
    /// - `KeyError::NonContiguousExtension` if `segment.start() != self.end()`
    pub fn extend(&self, segment: &Self) -> Result<Self, KeyError> {
        self.check_conversation(segment)?;

        if segment.start_index != self.end_index {
            return Err(KeyError::NonContiguousExtension {
                expected_start: self.end_index,
                actual_start: segment.start_index,
            });
        }

        Ok(Self {
            conversation_id: self.conversation_id.clone(),
            start_index: self.start_index,
            end_index: segment.end_index,
        })
    }

    /// Shrink this interval by removing a segment from its front.
    ///
    /// # Errors
    ///
    /// - `KeyError::CrossConversationMismatch` if the segment belongs to
    ///   another conversation
    /// - `KeyError::NonContiguousConsumption` if
    ///   `segment.start() != self.start()`
    /// - `KeyError::InsufficientKeyMaterial` if `segment.end() > self.end()`
    pub fn consume(&self, segment: &Self) -> Result<Self, KeyError> {
        self.check_conversation(segment)?;

        if segment.start_index != self.start_index {
            return Err(KeyError::NonContiguousConsumption {
                expected_start: self.start_index,
                actual_start: segment.start_index,
            });
        }

        if segment.end_index > self.end_index {
            return Err(KeyError::InsufficientKeyMaterial {
                available_end: self.end_index,
                requested_end: segment.end_index,
            });
        }

        Ok(Self {
            conversation_id: self.conversation_id.clone(),
            start_index: segment.end_index,
            end_index: self.end_index,
        })
    }

    /// The next `len` bytes available for allocation, `[start, start + len)`.
    ///
    /// Pure probe: not checked against [`len`](Self::len). That check happens
    /// when the segment is passed to [`consume`](Self::consume), so callers
    /// can reserve a candidate range and commit only after the message has
    /// been handled.
    ///
    /// # Errors
    ///
    /// - `KeyError::IndexOverflow` if `start + len` exceeds `u64::MAX`
    pub fn consume_segment(&self, len: u64) -> Result<Self, KeyError> {
        self.segment_from(self.start_index, len)
    }

    /// The next `len` bytes an upcoming key exchange would append,
    /// `[end, end + len)`.
    ///
    /// # Errors
    ///
    /// - `KeyError::IndexOverflow` if `end + len` exceeds `u64::MAX`
    pub fn extend_segment(&self, len: u64) -> Result<Self, KeyError> {
        self.segment_from(self.end_index, len)
    }

    /// True if `inner` lies entirely within this interval.
    ///
    /// Always false across conversations.
    pub fn contains(&self, inner: &Self) -> bool {
        self.conversation_id == inner.conversation_id
            && inner.start_index >= self.start_index
            && inner.end_index <= self.end_index
    }

    /// True if the two intervals share at least one byte.
    ///
    /// Adjacent intervals (sharing only an endpoint) do not overlap. Always
    /// false across conversations.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.conversation_id == other.conversation_id
            && self.start_index < other.end_index
            && other.start_index < self.end_index
    }

    fn check_conversation(&self, segment: &Self) -> Result<(), KeyError> {
        if segment.conversation_id != self.conversation_id {
            return Err(KeyError::CrossConversationMismatch {
                expected: self.conversation_id.clone(),
                actual: segment.conversation_id.clone(),
            });
        }
        Ok(())
    }

    fn segment_from(&self, index: u64, len: u64) -> Result<Self, KeyError> {
        let end = index.checked_add(len).ok_or(KeyError::IndexOverflow { index, len })?;

        Ok(Self { conversation_id: self.conversation_id.clone(), start_index: index, end_index: end })
    }
}

impl fmt::Display for KeyInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start_index, self.end_index)
    }
}

/// `current + segment` is [`KeyInterval::extend`].
impl Add<&KeyInterval> for &KeyInterval {
    type Output = Result<KeyInterval, KeyError>;

    fn add(self, segment: &KeyInterval) -> Self::Output {
        self.extend(segment)
    }
}

/// `current - segment` is [`KeyInterval::consume`].
impl Sub<&KeyInterval> for &KeyInterval {
    type Output = Result<KeyInterval, KeyError>;

    fn sub(self, segment: &KeyInterval) -> Self::Output {
        self.consume(segment)
    }
}

//! Ledger operations.

use serde::{Deserialize, Serialize};

use crate::{ConversationId, KeyError, KeyInterval, record::OperationRecord};

/// Discriminant of an [`Operation`], also its tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Key material appended by a key exchange
    Extension,
    /// Key material spent on one message
    Consumption,
}

/// One state transition recorded in a [`KeyHistory`](crate::KeyHistory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Key exchange appended `segment` at the end of the key range
    Extension {
        /// Bytes that became available
        segment: KeyInterval,
        /// Free-text audit reason
        reason: String,
        /// Key exchange this extension came from
        kex_id: Option<String>,
    },

    /// A message spent `segment` from the front of the key range
    Consumption {
        /// Bytes that were spent
        segment: KeyInterval,
        /// Free-text audit reason
        reason: String,
        /// Message the bytes were spent on
        message_id: Option<String>,
    },
}

impl Operation {
    /// Which kind of transition this is.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Extension { .. } => OperationKind::Extension,
            Self::Consumption { .. } => OperationKind::Consumption,
        }
    }

    /// Segment applied to the key range.
    pub fn segment(&self) -> &KeyInterval {
        match self {
            Self::Extension { segment, .. } | Self::Consumption { segment, .. } => segment,
        }
    }

    /// Audit reason.
    pub fn reason(&self) -> &str {
        match self {
            Self::Extension { reason, .. } | Self::Consumption { reason, .. } => reason,
        }
    }

    /// Key exchange id for extensions, message id for consumptions.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Extension { kex_id, .. } => kex_id.as_deref(),
            Self::Consumption { message_id, .. } => message_id.as_deref(),
        }
    }

    /// `+` for extensions, `-` for consumptions.
    pub fn sign(&self) -> char {
        match self {
            Self::Extension { .. } => '+',
            Self::Consumption { .. } => '-',
        }
    }

    /// State obtained by applying this operation to `state`.
    pub fn apply(&self, state: &KeyInterval) -> Result<KeyInterval, KeyError> {
        match self {
            Self::Extension { segment, .. } => state.extend(segment),
            Self::Consumption { segment, .. } => state.consume(segment),
        }
    }

    /// Persisted form. The conversation is implied by the enclosing ledger.
    pub fn to_record(&self) -> OperationRecord {
        let segment = self.segment();
        let (kex_id, message_id) = match self {
            Self::Extension { kex_id, .. } => (kex_id.clone(), None),
            Self::Consumption { message_id, .. } => (None, message_id.clone()),
        };

        OperationRecord {
            kind: self.kind(),
            start_index: segment.start(),
            end_index: segment.end(),
            reason: self.reason().to_string(),
            kex_id,
            message_id,
        }
    }

    /// Rebuild an operation from its persisted form.
    ///
    /// The correlation id that does not belong to the record's kind is
    /// dropped.
    ///
    /// # Errors
    ///
    /// - `KeyError::InvalidInterval` if the record's bounds are inverted
    pub fn from_record(
        record: OperationRecord,
        conversation_id: &ConversationId,
    ) -> Result<Self, KeyError> {
        let segment =
            KeyInterval::new(conversation_id.clone(), record.start_index, record.end_index)?;

        Ok(match record.kind {
            OperationKind::Extension => {
                Self::Extension { segment, reason: record.reason, kex_id: record.kex_id }
            },
            OperationKind::Consumption => {
                Self::Consumption { segment, reason: record.reason, message_id: record.message_id }
            },
        })
    }
}

//! Padline key accounting core
//!
//! Tracks which bytes of a conversation's one-time-pad key stream have been
//! exchanged and which have been spent. A one-time pad is only secure if no
//! key byte is ever used twice, so the whole crate exists to make reuse
//! impossible to record.
//!
//! # Layers
//!
//! ```text
//! Key exchange ──── extension ────┐
//!                                 ▼
//!                            KeyHistory (append-only ledger, audit trail)
//!                                 ▲
//! Message service ── consumption ─┘
//!                                 │ folds
//!                                 ▼
//!                            KeyInterval (half-open range algebra)
//! ```
//!
//! - [`KeyInterval`]: immutable `[start, end)` range. Extensions must start
//!   exactly at the current end, consumptions exactly at the current start.
//! - [`KeyHistory`]: ordered [`Operation`]s whose fold is the current state.
//!
//! This crate performs no cryptography and no I/O. Everything is synchronous
//! and deterministic. Callers serialize writers per conversation.
//!
//! # Security
//!
//! Every algebra violation is a hard error ([`KeyError`]). The ledger never
//! clamps, skips, or resynchronizes offsets: a failed operation leaves the
//! ledger exactly as it was.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod conversation;
mod error;
mod history;
mod interval;
mod operation;
pub mod record;

pub use conversation::ConversationId;
pub use error::{HistoryError, KeyError};
pub use history::KeyHistory;
pub use interval::KeyInterval;
pub use operation::{Operation, OperationKind};
pub use record::{KeyHistoryRecord, OperationRecord};

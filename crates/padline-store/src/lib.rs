//! Padline key history persistence
//!
//! Durable storage for the per-conversation ledgers of `padline-core`, and
//! the registry that keeps each ledger single-writer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Ledgers<S>                               │
//! │  - one LedgerGuard per conversation      │
//! │  - lazy load, checkpoint on demand       │
//! └───────────────────┬──────────────────────┘
//!                     │
//! ┌───────────────────▼──────────────────────┐
//! │ Storage (sync trait)                     │
//! │  MemoryStorage | RedbStorage | Chaotic   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Ledgers are append-only. Storage never truncates a ledger and refuses
//! appends that do not continue the persisted operation count. Every load
//! replays the stored operations, so a tampered or partially written ledger
//! is reported as [`StorageError::Corrupt`] instead of being trusted.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod ledgers;
pub mod storage;

pub use ledgers::{LedgerError, LedgerGuard, Ledgers, Reservation};
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError};

//! Per-conversation exclusive access to key histories.
//!
//! A [`KeyHistory`] must have exactly one writer at a time, otherwise two
//! tasks can probe the same offsets and spend the same key bytes. The
//! [`Ledgers`] registry hands out at most one [`LedgerGuard`] per
//! conversation. Holding the guard is the capability to mutate that ledger.
//!
//! ```text
//! Ledgers ── try_acquire / acquire ──> LedgerGuard (owned, exclusive)
//!    │                                     │ reserve -> commit_message
//!    │ lazy load                           │ record_key_exchange
//!    ▼                                     ▼ checkpoint
//! Storage <────────────────────────────────┘
//! ```

#![allow(clippy::disallowed_types, reason = "Registry lock is never held across await points")]

use std::{
    collections::HashMap,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use padline_core::{ConversationId, KeyError, KeyHistory, KeyInterval};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMappedMutexGuard, OwnedMutexGuard};

use crate::storage::{Storage, StorageError};

/// Errors from registry and guard operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Another guard holds the conversation
    #[error("key history busy: {conversation_id}")]
    Busy {
        /// Conversation that is held
        conversation_id: ConversationId,
    },

    /// Ledger rejected the operation
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Storage failed to load or persist
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// `None` until the first guard loads the ledger while holding the slot
type Slot = Arc<AsyncMutex<Option<KeyHistory>>>;

/// Registry of per-conversation ledgers.
///
/// Ledgers are loaded from storage on first access, or start empty. The slot
/// is registered before the load and the load runs under the slot's lock, so
/// concurrent callers see `Busy` (or wait) instead of loading twice. Clone is
/// cheap and clones share the registry.
#[derive(Clone)]
pub struct Ledgers<S: Storage> {
    storage: S,
    slots: Arc<Mutex<HashMap<ConversationId, Slot>>>,
}

impl<S: Storage> Ledgers<S> {
    /// Create an empty registry over `storage`
    pub fn new(storage: S) -> Self {
        Self { storage, slots: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Backing storage
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Whether a ledger for the conversation is cached or being loaded
    pub fn is_cached(&self, conversation_id: &ConversationId) -> bool {
        let slots = self.lock_slots();
        let Some(slot) = slots.get(conversation_id) else {
            return false;
        };

        match slot.try_lock() {
            Ok(history) => history.is_some(),
            Err(_) => true,
        }
    }

    /// Acquire a conversation without waiting.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Busy` if another guard holds the conversation
    /// - `LedgerError::Storage` if the ledger could not be loaded
    pub fn try_acquire(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<LedgerGuard<S>, LedgerError> {
        let slot = self.slot(conversation_id);

        let held = slot.try_lock_owned().map_err(|_| {
            tracing::debug!(conversation_id = %conversation_id, "Key history busy");
            LedgerError::Busy { conversation_id: conversation_id.clone() }
        })?;

        self.open(conversation_id, held)
    }

    /// Acquire a conversation, waiting for the current holder to release it.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Storage` if the ledger could not be loaded
    pub async fn acquire(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<LedgerGuard<S>, LedgerError> {
        let held = self.slot(conversation_id).lock_owned().await;

        self.open(conversation_id, held)
    }

    /// Drop a cached ledger so the next acquire reloads it from storage.
    ///
    /// Operations not yet persisted are checkpointed first, holding only this
    /// conversation's slot. Returns `false` if no ledger was cached.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Busy` if a guard or a pending acquire holds the slot,
    ///   including one that arrived during the checkpoint
    /// - `LedgerError::Storage` if the final checkpoint fails (the ledger
    ///   stays cached)
    pub fn evict(&self, conversation_id: &ConversationId) -> Result<bool, LedgerError> {
        let busy = || LedgerError::Busy { conversation_id: conversation_id.clone() };

        let held = {
            let slots = self.lock_slots();
            let Some(slot) = slots.get(conversation_id) else {
                return Ok(false);
            };

            // Every guard and pending acquire owns a clone of the slot
            if Arc::strong_count(slot) > 1 {
                return Err(busy());
            }

            Arc::clone(slot).try_lock_owned().map_err(|_| busy())?
        };

        if let Some(history) = &*held {
            self.storage.checkpoint(history)?;
        }

        let mut slots = self.lock_slots();

        // Registry entry plus `held`; anything more arrived mid-checkpoint
        let untouched = slots.get(conversation_id).is_some_and(|slot| {
            Arc::ptr_eq(slot, OwnedMutexGuard::mutex(&held)) && Arc::strong_count(slot) == 2
        });
        if !untouched {
            return Err(busy());
        }

        slots.remove(conversation_id);
        drop(slots);

        tracing::debug!(conversation_id = %conversation_id, "Evicted key history");

        Ok(held.is_some())
    }

    fn slot(&self, conversation_id: &ConversationId) -> Slot {
        let mut slots = self.lock_slots();
        let slot = slots
            .entry(conversation_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)));

        Arc::clone(slot)
    }

    /// Turn a held slot into a guard, loading the ledger if this is the
    /// first holder. A failed load leaves the slot empty for the next one.
    fn open(
        &self,
        conversation_id: &ConversationId,
        mut held: OwnedMutexGuard<Option<KeyHistory>>,
    ) -> Result<LedgerGuard<S>, LedgerError> {
        let history = match held.take() {
            Some(history) => history,
            None => self.load(conversation_id)?,
        };

        let history = OwnedMutexGuard::map(held, |slot| slot.insert(history));

        Ok(LedgerGuard { storage: self.storage.clone(), history })
    }

    fn load(&self, conversation_id: &ConversationId) -> Result<KeyHistory, LedgerError> {
        match self.storage.load_history(conversation_id)? {
            Some(history) => {
                tracing::info!(
                    conversation_id = %conversation_id,
                    operations = history.len(),
                    state = %history.current_state(),
                    "Loaded key history"
                );
                Ok(history)
            },
            None => Ok(KeyHistory::new(conversation_id.clone())),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<ConversationId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Key material probed for a message but not yet spent.
///
/// Produced by [`LedgerGuard::reserve`] and spent by
/// [`LedgerGuard::commit_message`] once the message is durably handled.
/// Dropping it spends nothing.
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    segment: KeyInterval,
}

impl Reservation {
    /// Reserved key range
    pub fn segment(&self) -> &KeyInterval {
        &self.segment
    }
}

/// Exclusive write access to one conversation's ledger.
///
/// Derefs to [`KeyHistory`] for reads. Dropping the guard releases the
/// conversation. Mutations stay in memory until [`checkpoint`](Self::checkpoint).
pub struct LedgerGuard<S: Storage> {
    storage: S,
    history: OwnedMappedMutexGuard<Option<KeyHistory>, KeyHistory>,
}

impl<S: Storage> LedgerGuard<S> {
    /// Append an extension. See [`KeyHistory::record_extension`].
    pub fn record_extension(
        &mut self,
        segment: KeyInterval,
        reason: impl Into<String>,
        kex_id: Option<String>,
    ) -> Result<&KeyInterval, LedgerError> {
        Ok(self.history.record_extension(segment, reason, kex_id)?)
    }

    /// Append a consumption. See [`KeyHistory::record_consumption`].
    pub fn record_consumption(
        &mut self,
        segment: KeyInterval,
        reason: impl Into<String>,
        message_id: Option<String>,
    ) -> Result<&KeyInterval, LedgerError> {
        Ok(self.history.record_consumption(segment, reason, message_id)?)
    }

    /// Record `len` fresh bytes from key exchange `kex_id`.
    ///
    /// The segment continues the current end and the audit reason is
    /// `kex id=<kex_id>`.
    pub fn record_key_exchange(
        &mut self,
        len: u64,
        kex_id: impl Into<String>,
    ) -> Result<&KeyInterval, LedgerError> {
        let kex_id = kex_id.into();
        let segment = self.history.extend_segment(len)?;
        let reason = format!("kex id={kex_id}");

        Ok(self.history.record_extension(segment, reason, Some(kex_id))?)
    }

    /// Probe the next `len` bytes without spending them.
    ///
    /// Succeeds even when `len` exceeds what is available; the shortfall is
    /// reported by [`commit_message`](Self::commit_message).
    pub fn reserve(&self, len: u64) -> Result<Reservation, LedgerError> {
        Ok(Reservation { segment: self.history.consume_segment(len)? })
    }

    /// Spend a reservation after the message was durably handled.
    ///
    /// The consumption lives in memory only. Call
    /// [`checkpoint`](Self::checkpoint) before the message leaves the
    /// device: after a crash an uncheckpointed consumption is gone and its
    /// bytes are offered again.
    pub fn commit_message(
        &mut self,
        reservation: Reservation,
        reason: impl Into<String>,
        message_id: Option<String>,
    ) -> Result<&KeyInterval, LedgerError> {
        Ok(self.history.record_consumption(reservation.segment, reason, message_id)?)
    }

    /// Persist operations recorded since the last checkpoint.
    ///
    /// Returns the number of operations written.
    pub fn checkpoint(&self) -> Result<usize, LedgerError> {
        Ok(self.storage.checkpoint(&self.history)?)
    }
}

impl<S: Storage> Deref for LedgerGuard<S> {
    type Target = KeyHistory;

    fn deref(&self) -> &KeyHistory {
        &self.history
    }
}

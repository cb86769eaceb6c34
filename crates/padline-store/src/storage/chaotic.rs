//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails calls to test that ledgers stay
//! consistent when persistence breaks. A failed append leaves the wrapped
//! storage untouched, so recovery is always possible by retrying.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{Arc, Mutex, PoisonError};

use padline_core::{ConversationId, KeyHistoryRecord, KeyInterval, OperationRecord};

use super::{Storage, StorageError};

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but fails calls based
/// on a configured failure rate. Failures are injected before delegating, so
/// the inner storage never sees a partial write.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Storage calls attempted, including injected failures
    call_count: Arc<Mutex<usize>>,
}

/// Linear congruential generator, so chaos runs replay from a seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }

    fn should_fail(&mut self, failure_rate: f64) -> bool {
        self.next() < failure_rate
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage calls attempted.
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and decide whether to fail it.
    fn inject(&self, call: &'static str) -> Result<(), StorageError> {
        *self.call_count.lock().unwrap_or_else(PoisonError::into_inner) += 1;

        let fail = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_fail(self.failure_rate);

        if fail {
            tracing::trace!(call, "Injecting storage failure");
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }

        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn append_operations(
        &self,
        conversation_id: &ConversationId,
        from_index: u64,
        operations: &[OperationRecord],
        state_after: &KeyInterval,
    ) -> Result<(), StorageError> {
        self.inject("append_operations")?;
        self.inner.append_operations(conversation_id, from_index, operations, state_after)
    }

    fn operation_count(&self, conversation_id: &ConversationId) -> Result<u64, StorageError> {
        self.inject("operation_count")?;
        self.inner.operation_count(conversation_id)
    }

    fn load_record(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<KeyHistoryRecord>, StorageError> {
        self.inject("load_record")?;
        self.inner.load_record(conversation_id)
    }

    fn persisted_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<KeyInterval>, StorageError> {
        self.inject("persisted_state")?;
        self.inner.persisted_state(conversation_id)
    }

    fn list_conversations(&self) -> Result<Vec<ConversationId>, StorageError> {
        self.inject("list_conversations")?;
        self.inner.list_conversations()
    }

    fn delete_history(&self, conversation_id: &ConversationId) -> Result<bool, StorageError> {
        self.inject("delete_history")?;
        self.inner.delete_history(conversation_id)
    }
}

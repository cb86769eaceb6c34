//! Fuzz target for key history ledgers under arbitrary callers
//!
//! Drives one conversation's ledger through the registry with arbitrary key
//! exchanges, messages, forged segments, checkpoints and reloads, while the
//! storage randomly fails.
//!
//! # Strategy
//!
//! - Honest extensions and consumptions of arbitrary length
//! - Forged segments at arbitrary offsets (replays, gaps, overreach)
//! - Checkpoints and registry reloads under storage failure
//!
//! # Invariants
//!
//! - NEVER panic, whatever the caller does
//! - A rejected operation leaves the ledger unchanged
//! - Consumptions tile `[0, current.start)` with no overlap
//! - `total_extended - total_consumed == available`
//! - Whatever reached storage replays, so a reload never offers bytes a
//!   persisted consumption already spent

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use padline_core::{ConversationId, KeyHistory, KeyInterval, OperationKind};
use padline_store::{ChaoticStorage, Ledgers, MemoryStorage, Storage};

#[derive(Debug, Clone, Arbitrary)]
struct LedgerScenario {
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Sequence of caller actions
    operations: Vec<LedgerOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum LedgerOperation {
    KeyExchange { len: u16 },
    Message { len: u16 },
    ForgedConsumption { start: u32, len: u16 },
    ForgedExtension { start: u32, len: u16 },
    Checkpoint,
    Reload,
}

fuzz_target!(|scenario: LedgerScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let storage =
        ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, scenario.chaos_seed);
    let mut ledgers = Ledgers::new(storage.clone());
    let id = ConversationId::from("fuzz");

    for op in scenario.operations {
        // Loading can fail under chaos; the operation is then skipped
        let Ok(mut guard) = ledgers.try_acquire(&id) else {
            continue;
        };
        let before = guard.to_record();

        let accepted = match op {
            LedgerOperation::KeyExchange { len } => {
                guard.record_key_exchange(u64::from(len), "kex").is_ok()
            },
            LedgerOperation::Message { len } => match guard.reserve(u64::from(len)) {
                Ok(reservation) => guard.commit_message(reservation, "send", None).is_ok(),
                Err(_) => false,
            },
            LedgerOperation::ForgedConsumption { start, len } => {
                let start = u64::from(start);
                let Ok(segment) = KeyInterval::new(id.clone(), start, start + u64::from(len))
                else {
                    continue;
                };
                guard.record_consumption(segment, "forged", None).is_ok()
            },
            LedgerOperation::ForgedExtension { start, len } => {
                let start = u64::from(start);
                let Ok(segment) = KeyInterval::new(id.clone(), start, start + u64::from(len))
                else {
                    continue;
                };
                guard.record_extension(segment, "forged", None).is_ok()
            },
            LedgerOperation::Checkpoint => {
                let _ = guard.checkpoint();
                false
            },
            LedgerOperation::Reload => {
                drop(guard);
                ledgers = Ledgers::new(storage.clone());
                verify_reload(&storage, &id);
                continue;
            },
        };

        if !accepted {
            assert_eq!(guard.to_record(), before, "rejected operation changed the ledger");
        }

        verify_ledger(&guard);
    }
});

fn verify_ledger(history: &KeyHistory) {
    assert_eq!(history.total_extended() - history.total_consumed(), history.available());

    let mut cursor = 0u64;
    for operation in history.operations() {
        if operation.kind() == OperationKind::Consumption {
            assert_eq!(operation.segment().start(), cursor, "consumption left a gap or overlap");
            cursor = operation.segment().end();
        }
    }
    assert_eq!(cursor, history.current_state().start());
}

fn verify_reload(storage: &ChaoticStorage<MemoryStorage>, id: &ConversationId) {
    match storage.inner().load_history(id) {
        Ok(Some(history)) => verify_ledger(&history),
        Ok(None) => {},
        Err(e) => panic!("persisted ledger failed to replay: {e}"),
    }
}

//! Fuzz target for restoring key histories from untrusted bytes
//!
//! # Strategy
//!
//! - Random bytes: arbitrary CBOR data (general malformation)
//! - Structured records: well-formed records with arbitrary offsets, so
//!   replay itself is exercised rather than only the decoder
//!
//! # Invariants
//!
//! - NEVER panic on malformed input
//! - Any history that restores satisfies the fold invariant
//! - A restored history re-encodes and restores to an equal ledger

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use padline_core::{
    ConversationId, KeyHistory, KeyHistoryRecord, KeyInterval, OperationKind, OperationRecord,
};

#[derive(Debug, Clone, Arbitrary)]
enum HistoryInput {
    RandomBytes(Vec<u8>),
    Record { operations: Vec<ArbitraryOperation>, snapshot: Option<(u64, u64)> },
}

#[derive(Debug, Clone, Arbitrary)]
struct ArbitraryOperation {
    consumption: bool,
    start: u64,
    end: u64,
}

fuzz_target!(|input: HistoryInput| {
    let restored = match input {
        HistoryInput::RandomBytes(bytes) => KeyHistory::from_cbor(&bytes),
        HistoryInput::Record { operations, snapshot } => {
            let conversation_id = ConversationId::from("fuzz");
            let current_state = snapshot
                .and_then(|(start, end)| KeyInterval::new(conversation_id.clone(), start, end).ok());
            let record = KeyHistoryRecord {
                conversation_id,
                operations: operations
                    .into_iter()
                    .map(|op| OperationRecord {
                        kind: if op.consumption {
                            OperationKind::Consumption
                        } else {
                            OperationKind::Extension
                        },
                        start_index: op.start,
                        end_index: op.end,
                        reason: String::new(),
                        kex_id: None,
                        message_id: None,
                    })
                    .collect(),
                current_state,
            };
            KeyHistory::from_record(record)
        },
    };

    let Ok(history) = restored else {
        return;
    };

    let mut state = KeyInterval::empty(history.conversation_id().clone());
    for operation in history.operations() {
        let Ok(next) = operation.apply(&state) else {
            panic!("restored operation does not replay");
        };
        state = next;
    }
    assert_eq!(&state, history.current_state());

    let Ok(bytes) = history.to_cbor() else {
        panic!("restored history failed to encode");
    };
    let Ok(again) = KeyHistory::from_cbor(&bytes) else {
        panic!("re-encoded history failed to restore");
    };
    assert_eq!(again.operations(), history.operations());
});

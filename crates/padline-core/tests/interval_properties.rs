//! Property-based tests for the key interval algebra
//!
//! These tests verify that extension and consumption are accepted exactly
//! when they continue the key stream, for ALL offsets, not just the examples
//! in the unit tests.

use padline_core::{ConversationId, KeyError, KeyInterval};
use proptest::prelude::*;

/// Strategy for a valid interval in conversation `c`, kept well below
/// `u64::MAX` so segment arithmetic never overflows.
fn arbitrary_interval() -> impl Strategy<Value = KeyInterval> {
    (0u64..1 << 40, 0u64..1 << 20).prop_map(|(start, len)| {
        KeyInterval::new("c", start, start + len).expect("start <= end by construction")
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: construction succeeds iff start <= end, and length is end - start
    #[test]
    fn prop_construction_invariant(start in any::<u64>(), end in any::<u64>()) {
        match KeyInterval::new("c", start, end) {
            Ok(interval) => {
                prop_assert!(start <= end);
                prop_assert_eq!(interval.len(), end - start);
                prop_assert_eq!(interval.is_empty(), start == end);
            },
            Err(e) => {
                prop_assert!(start > end);
                prop_assert_eq!(e, KeyError::InvalidInterval { start, end });
            },
        }
    }

    /// Property: extend_segment always produces an accepted extension
    #[test]
    fn prop_extend_segment_is_contiguous(current in arbitrary_interval(), n in 0u64..1 << 20) {
        let segment = current.extend_segment(n)?;
        let extended = current.extend(&segment)?;

        prop_assert_eq!(extended.start(), current.start());
        prop_assert_eq!(extended.end(), current.end() + n);
        prop_assert_eq!(extended.len(), current.len() + n);
        prop_assert!(!current.overlaps(&segment));
    }

    /// Property: any extension not starting at the current end is rejected
    #[test]
    fn prop_misaligned_extension_rejected(
        current in arbitrary_interval(),
        start in 0u64..1 << 41,
        len in 0u64..1024,
    ) {
        prop_assume!(start != current.end());
        let segment = KeyInterval::new("c", start, start + len)?;

        let result = current.extend(&segment);
        prop_assert_eq!(
            result,
            Err(KeyError::NonContiguousExtension {
                expected_start: current.end(),
                actual_start: start,
            })
        );
    }

    /// Property: consume_segment is accepted iff it fits in the current range
    #[test]
    fn prop_consume_segment_fits_or_fails(current in arbitrary_interval(), n in 0u64..1 << 21) {
        let probe = current.consume_segment(n)?;

        // Probing twice yields the same candidate
        prop_assert_eq!(&probe, &current.consume_segment(n)?);

        match current.consume(&probe) {
            Ok(rest) => {
                prop_assert!(n <= current.len());
                prop_assert!(current.contains(&probe));
                prop_assert_eq!(rest.start(), current.start() + n);
                prop_assert_eq!(rest.end(), current.end());
                prop_assert!(!probe.overlaps(&rest));
            },
            Err(e) => {
                prop_assert!(n > current.len());
                prop_assert_eq!(
                    e,
                    KeyError::InsufficientKeyMaterial {
                        available_end: current.end(),
                        requested_end: current.start() + n,
                    }
                );
            },
        }
    }

    /// Property: any consumption not starting at the current start is rejected
    #[test]
    fn prop_misaligned_consumption_rejected(
        current in arbitrary_interval(),
        start in 0u64..1 << 41,
        len in 0u64..1024,
    ) {
        prop_assume!(start != current.start());
        let segment = KeyInterval::new("c", start, start + len)?;

        prop_assert!(matches!(
            current.consume(&segment),
            Err(KeyError::NonContiguousConsumption { .. })
        ), "expected NonContiguousConsumption");
    }

    /// Property: operands from different conversations never combine
    #[test]
    fn prop_cross_conversation_always_fails(
        current in arbitrary_interval(),
        other_id in "[a-z]{2,8}",
        n in 0u64..1024,
    ) {
        let foreign_id = ConversationId::new(other_id);
        let extension = KeyInterval::new(foreign_id.clone(), current.end(), current.end() + n)?;
        let consumption =
            KeyInterval::new(foreign_id.clone(), current.start(), current.start() + n)?;

        let expected = KeyError::CrossConversationMismatch {
            expected: ConversationId::from("c"),
            actual: foreign_id,
        };
        prop_assert_eq!(current.extend(&extension), Err(expected.clone()));
        prop_assert_eq!(current.consume(&consumption), Err(expected));
        prop_assert!(!current.contains(&consumption));
        prop_assert!(!current.overlaps(&consumption));
    }

    /// Property: overlap is symmetric and agrees with a byte-level definition
    #[test]
    fn prop_overlap_matches_shared_bytes(
        a_start in 0u64..256,
        a_len in 0u64..64,
        b_start in 0u64..256,
        b_len in 0u64..64,
    ) {
        let a = KeyInterval::new("c", a_start, a_start + a_len)?;
        let b = KeyInterval::new("c", b_start, b_start + b_len)?;

        let shared = (a.start()..a.end()).any(|byte| byte >= b.start() && byte < b.end());

        prop_assert_eq!(a.overlaps(&b), shared);
        prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
    }

    /// Property: CBOR round trip reproduces an equal interval
    #[test]
    fn prop_interval_cbor_roundtrip(interval in arbitrary_interval()) {
        let mut bytes = Vec::new();
        ciborium::into_writer(&interval, &mut bytes).expect("encode should succeed");

        let decoded: KeyInterval = ciborium::from_reader(&bytes[..]).expect("decode should succeed");
        prop_assert_eq!(decoded, interval);
    }
}

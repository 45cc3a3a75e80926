//! Property-based tests for the session state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::*;
use crate::protocol::FollowUpQuestion;
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

fn streaming_session() -> StreamSession {
    let mut session = StreamSession::new("test-conv");
    transition(&mut session, SessionEvent::Start).unwrap();
    session
}

fn chunk(seq: u64, content: &str) -> SessionEvent {
    SessionEvent::Chunk {
        content: content.to_string(),
        seq,
    }
}

/// Last partial published by a sequence of transitions
fn last_partial(effects: &[Effect]) -> Option<String> {
    effects.iter().rev().find_map(|e| match e {
        Effect::PublishPartial { content } => Some(content.clone()),
        _ => None,
    })
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

/// Fragments for seq 1..=n together with a delivery order
fn arb_shuffled_chunks() -> impl Strategy<Value = (Vec<String>, Vec<usize>)> {
    proptest::collection::vec("[a-z ]{1,6}", 1..12).prop_flat_map(|fragments| {
        let order: Vec<usize> = (0..fragments.len()).collect();
        (Just(fragments), Just(order).prop_shuffle())
    })
}

fn arb_follow_ups() -> impl Strategy<Value = Vec<FollowUpQuestion>> {
    proptest::collection::vec(
        ("[a-z0-9]{1,4}", "[A-Za-z ?]{1,20}").prop_map(|(id, q)| FollowUpQuestion::new(id, q)),
        0..4,
    )
}

fn arb_event() -> impl Strategy<Value = SessionEvent> {
    prop_oneof![
        (0u64..20, "[a-z]{0,5}").prop_map(|(seq, content)| SessionEvent::Chunk { content, seq }),
        ("[a-z ]{0,10}", arb_follow_ups(), proptest::option::of("[A-Za-z ]{1,10}")).prop_map(
            |(content, follow_up_questions, title)| SessionEvent::Complete {
                content,
                follow_up_questions,
                title,
            }
        ),
        "[a-z ]{1,10}".prop_map(|message| SessionEvent::Error { message }),
        Just(SessionEvent::StopRequested),
        Just(SessionEvent::StopConfirmed),
        Just(SessionEvent::Stopped),
        Just(SessionEvent::ConnectionLost),
        Just(SessionEvent::Superseded),
        Just(SessionEvent::Start),
    ]
}

fn arb_terminal_event() -> impl Strategy<Value = SessionEvent> {
    prop_oneof![
        Just(SessionEvent::Stopped),
        Just(SessionEvent::ConnectionLost),
        Just(SessionEvent::Superseded),
        "[a-z]{1,5}".prop_map(|message| SessionEvent::Error { message }),
        "[a-z]{1,5}".prop_map(|content| SessionEvent::Complete {
            content,
            follow_up_questions: vec![],
            title: None,
        }),
    ]
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Delivering seq 1..n in any order publishes the seq-sorted concatenation
    #[test]
    fn prop_buffer_is_seq_ordered((fragments, order) in arb_shuffled_chunks()) {
        let mut session = streaming_session();
        let mut effects = Vec::new();

        for index in order {
            let seq = index as u64 + 1;
            let result = transition(&mut session, chunk(seq, &fragments[index])).unwrap();
            effects.extend(result.effects);
        }

        let expected: String = fragments.concat();
        prop_assert_eq!(session.buffer(), expected.clone());
        prop_assert_eq!(last_partial(&effects), Some(expected));
        prop_assert_eq!(session.last_chunk_seq(), fragments.len() as u64);
    }

    /// Re-delivering chunks never changes the buffer
    #[test]
    fn prop_duplicates_are_idempotent((fragments, order) in arb_shuffled_chunks()) {
        let mut session = streaming_session();
        for (index, fragment) in fragments.iter().enumerate() {
            transition(&mut session, chunk(index as u64 + 1, fragment)).unwrap();
        }
        let before = session.buffer();

        for index in order {
            let result = transition(&mut session, chunk(index as u64 + 1, "DUPLICATE")).unwrap();
            prop_assert!(result.is_ignored());
        }
        prop_assert_eq!(session.buffer(), before);
    }

    /// Final text equals the Complete content no matter which chunks arrived
    #[test]
    fn prop_complete_content_is_authoritative(
        (fragments, order) in arb_shuffled_chunks(),
        keep in 0usize..12,
        final_text in "[A-Za-z !.]{0,40}",
        follow_ups in arb_follow_ups(),
    ) {
        let mut session = streaming_session();
        for index in order.into_iter().take(keep) {
            transition(&mut session, chunk(index as u64 + 1, &fragments[index])).unwrap();
        }

        let result = transition(&mut session, SessionEvent::Complete {
            content: final_text.clone(),
            follow_up_questions: follow_ups.clone(),
            title: None,
        }).unwrap();

        prop_assert_eq!(&session.status, &StreamStatus::Completed);
        prop_assert_eq!(session.visible_content(), final_text.clone());
        prop_assert_eq!(&session.follow_up_questions, &follow_ups);
        prop_assert_eq!(
            result.effects.iter().filter(|e| **e == Effect::Reconcile).count(),
            1
        );
    }

    /// Once terminal, no event changes the session
    #[test]
    fn prop_terminal_states_absorb(
        terminal in arb_terminal_event(),
        later in proptest::collection::vec(arb_event(), 0..10),
    ) {
        let mut session = streaming_session();
        transition(&mut session, terminal).unwrap();
        prop_assert!(session.status.is_terminal());

        let snapshot = session.clone();
        for event in later {
            let result = transition(&mut session, event).unwrap();
            prop_assert!(result.is_ignored());
        }
        prop_assert_eq!(session, snapshot);
    }

    /// Any event sequence leaves at most one Reconcile effect per session
    #[test]
    fn prop_reconcile_at_most_once(events in proptest::collection::vec(arb_event(), 0..20)) {
        let mut session = streaming_session();
        let mut reconciles = 0;
        for event in events {
            if let Ok(result) = transition(&mut session, event) {
                reconciles += result.effects.iter().filter(|e| **e == Effect::Reconcile).count();
            }
        }
        prop_assert!(reconciles <= 1);
    }

    /// A stale token never reaches the newer session
    #[test]
    fn prop_stale_events_never_leak(events in proptest::collection::vec(arb_event(), 0..10)) {
        let mut registry = SessionRegistry::new();
        let stale = registry.start("c1", None).session_id.to_string();
        let current = registry.start("c1", None).session_id;
        let before = registry.get("c1").unwrap().clone();

        for event in events {
            prop_assert!(registry.apply("c1", Some(&stale), event).is_none());
        }
        let after = registry.get("c1").unwrap();
        prop_assert_eq!(&after.id, &current);
        prop_assert_eq!(after, &before);
    }
}

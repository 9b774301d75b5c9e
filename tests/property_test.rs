// tests/property_test.rs

//! Property-based tests for the order-independent election and scoring
//! invariants.

use prismd::core::cluster::{ElectionState, NodeRole};
use prismd::core::score::ResourceScore;
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    /// Terms never decrease, no matter what sequence of terms is observed.
    #[test]
    fn prop_terms_are_monotone(terms in prop::collection::vec(0u64..1_000, 1..50)) {
        let mut el = ElectionState::new(NodeRole::Worker, Duration::from_secs(10));
        let mut last = el.current_term;
        for term in terms {
            el.adopt_term(term);
            prop_assert!(el.current_term >= last);
            last = el.current_term;
        }
    }

    /// Adopting a higher term always clears the per-term vote; adopting an
    /// equal or lower term never does.
    #[test]
    fn prop_vote_cleared_only_on_term_increase(current in 0u64..100, observed in 0u64..200) {
        let mut el = ElectionState::new(NodeRole::Worker, Duration::from_secs(10));
        el.current_term = current;
        el.voted_for = Some("localhost:50054".to_string());
        el.adopt_term(observed);
        if observed > current {
            prop_assert!(el.voted_for.is_none());
        } else {
            prop_assert_eq!(el.voted_for.as_deref(), Some("localhost:50054"));
        }
    }

    /// The randomized election timeout always lands inside the documented
    /// backoff window for the current attempt count.
    #[test]
    fn prop_election_timeout_within_backoff_window(attempts in 0u32..12) {
        let base = Duration::from_secs(10);
        let mut el = ElectionState::new(NodeRole::Worker, base);
        el.election_attempts = attempts;
        el.reset_election_timer(base);

        let backoff = 1.5f64.powi((attempts + 1).min(5) as i32);
        let min = base.as_secs_f64() * backoff;
        let max = min * 1.5;
        let timeout = el.election_timeout.as_secs_f64();
        prop_assert!(timeout >= min && timeout <= max);
        prop_assert_eq!(el.election_attempts, attempts + 1);
    }

    /// The composite score stays within [0, 100] for sane telemetry and is
    /// monotone in the storage component up to its cap.
    #[test]
    fn prop_score_is_bounded(
        load in 0.0f64..1000.0,
        io in 0.0f64..100.0,
        net in 0.0f64..10_000.0,
        storage in 0.0f64..10_000.0,
    ) {
        let score = ResourceScore::from_telemetry("n".to_string(), load, io, net, storage).score;
        prop_assert!(score >= 0.0);
        prop_assert!(score <= 100.0 + 1e-9);

        let more_storage =
            ResourceScore::from_telemetry("n".to_string(), load, io, net, storage + 1.0).score;
        prop_assert!(more_storage >= score - 1e-9);
    }
}

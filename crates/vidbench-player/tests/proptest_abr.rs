//! Property-based tests for the ABR decision rule.

use std::collections::BTreeSet;
use std::time::Duration;

use proptest::prelude::*;
use vidbench_common::manifest::Manifest;
use vidbench_player::abr::{
    AbrConfig, AbrEngine, BufferState, SwitchReason, ThroughputHistory, ThroughputSample,
};

fn manifest(bitrates: &BTreeSet<u64>) -> Manifest {
    let names: Vec<String> = bitrates.iter().map(|b| format!("{b}bps")).collect();
    let ladder: Vec<(u64, &str)> = bitrates
        .iter()
        .zip(&names)
        .map(|(b, n)| (*b, n.as_str()))
        .collect();
    Manifest::from_ladder(Duration::from_secs(2), 10, &ladder).unwrap()
}

fn history(samples: &[(u64, u64)]) -> ThroughputHistory {
    let mut h = ThroughputHistory::new(5);
    for (i, (bytes, millis)) in samples.iter().enumerate() {
        h.push(ThroughputSample {
            at: Duration::from_secs(i as u64),
            bytes: *bytes,
            elapsed: Duration::from_millis(*millis),
        });
    }
    h
}

fn scenario() -> impl Strategy<Value = (BTreeSet<u64>, Vec<(u64, u64)>, u64, usize)> {
    (
        proptest::collection::btree_set(100_000u64..20_000_000, 1..6),
        proptest::collection::vec((1u64..5_000_000, 1u64..10_000), 0..8),
        0u64..40_000,
        0usize..6,
    )
}

proptest! {
    /// A level above the budget is only chosen when it is the lowest level.
    #[test]
    fn never_exceeds_budget((bitrates, samples, buffered_ms, current) in scenario()) {
        let m = manifest(&bitrates);
        let engine = AbrEngine::new(AbrConfig::default());
        let h = history(&samples);
        let current = &m.levels()[current % m.levels().len()];
        let buffer = BufferState { buffered: Duration::from_millis(buffered_ms), stalled: false };

        let d = engine.decide(&h, &buffer, &m, current);
        if let Some(budget) = engine.budget_bps(&h) {
            prop_assert!(
                d.level.id == m.lowest().id || d.level.nominal_bitrate_bps as f64 <= budget,
                "picked {} with budget {}", d.level.nominal_bitrate_bps, budget
            );
        } else {
            prop_assert_eq!(d.level.id, m.lowest().id);
        }
    }

    #[test]
    fn upward_moves_climb_one_level((bitrates, samples, buffered_ms, current) in scenario()) {
        let m = manifest(&bitrates);
        let engine = AbrEngine::default();
        let current = &m.levels()[current % m.levels().len()];
        let buffer = BufferState { buffered: Duration::from_millis(buffered_ms), stalled: false };

        let d = engine.decide(&history(&samples), &buffer, &m, current);
        let from = m.rank(current.id).unwrap();
        let to = m.rank(d.level.id).unwrap();
        prop_assert!(to <= from + 1, "jumped from rank {} to {}", from, to);
        if to > from {
            prop_assert_eq!(d.switch, Some(SwitchReason::BufferSurplus));
        }
    }

    #[test]
    fn starvation_forces_lowest(
        (bitrates, samples, _, current) in scenario(),
        buffered_ms in 0u64..4_000,
    ) {
        prop_assume!(!samples.is_empty());
        let m = manifest(&bitrates);
        let engine = AbrEngine::default();
        let current = &m.levels()[current % m.levels().len()];
        let buffer = BufferState { buffered: Duration::from_millis(buffered_ms), stalled: true };

        let d = engine.decide(&history(&samples), &buffer, &m, current);
        prop_assert_eq!(d.level.id, m.lowest().id);
        if current.id != m.lowest().id {
            prop_assert_eq!(d.switch, Some(SwitchReason::BufferStarvation));
        }
    }

    /// The decision is a pure function of its inputs.
    #[test]
    fn decide_is_deterministic((bitrates, samples, buffered_ms, current) in scenario()) {
        let m = manifest(&bitrates);
        let engine = AbrEngine::default();
        let h = history(&samples);
        let current = &m.levels()[current % m.levels().len()];
        let buffer = BufferState { buffered: Duration::from_millis(buffered_ms), stalled: false };
        prop_assert_eq!(
            engine.decide(&h, &buffer, &m, current),
            engine.decide(&h, &buffer, &m, current)
        );
    }
}

#[test]
fn one_megabit_history_picks_one_megabit_level() {
    let m = manifest(&[1_000_000, 3_000_000, 6_000_000].into_iter().collect());
    let engine = AbrEngine::default();
    let h = history(&[(125_000, 1000)]);
    for buffered in [0, 5, 12] {
        let buffer = BufferState {
            buffered: Duration::from_secs(buffered),
            stalled: false,
        };
        let d = engine.decide(&h, &buffer, &m, m.lowest());
        assert_eq!(d.level.nominal_bitrate_bps, 1_000_000, "buffer {buffered}s");
    }
}

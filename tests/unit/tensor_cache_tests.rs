//! Unit tests for the step-indexed tensor cache and its eviction policy.

use std::collections::BTreeSet;

use bytes::Bytes;
use proptest::prelude::*;

use tensorwatch::cache::tensor::{TensorCache, TensorLookup, PROTECTED_RECENT_STEPS};
use tensorwatch::models::tensor::{DType, Statistics, TensorKey, TensorRecord};
use tensorwatch::AppError;

/// Four f32 elements: 16 bytes per record.
const RECORD_BYTES: u64 = 16;

fn key(node: &str, step: u64) -> TensorKey {
    TensorKey {
        device: "dev0".into(),
        node: node.into(),
        output_index: 0,
        step,
    }
}

fn record(node: &str, step: u64, fill: f32) -> TensorRecord {
    #[allow(clippy::cast_precision_loss)]
    let values = [fill, fill + 1.0, fill + 2.0, step as f32];
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    TensorRecord {
        key: key(node, step),
        dtype: DType::F32,
        shape: vec![4],
        statistics: Statistics::from_buffer(DType::F32, &bytes).expect("stats"),
        buffer: Some(Bytes::from(bytes)),
    }
}

#[test]
fn put_and_get_full_record() {
    let mut cache = TensorCache::new(1024);
    let rec = record("fc/weight", 1, 0.5);
    cache.put(rec.clone());

    let lookup = cache.get(&key("fc/weight", 1)).expect("cached");
    assert_eq!(lookup, TensorLookup::Full(rec.into()));
    assert_eq!(cache.resident_bytes(), RECORD_BYTES);
}

#[test]
fn put_replaces_same_key() {
    let mut cache = TensorCache::new(1024);
    cache.put(record("fc/weight", 1, 0.5));
    cache.put(record("fc/weight", 1, 9.0));

    let stats = cache.get_stats(&key("fc/weight", 1)).expect("stats");
    assert_eq!(stats.min, Some(1.0));
    assert_eq!(stats.max, Some(11.0));
    assert_eq!(cache.resident_bytes(), RECORD_BYTES);
}

#[test]
fn unknown_record_is_not_found() {
    let cache = TensorCache::new(1024);
    assert!(matches!(cache.get(&key("x", 1)), Err(AppError::NotFound(_))));
    assert!(matches!(cache.get_stats(&key("x", 1)), Err(AppError::NotFound(_))));
}

#[test]
fn budget_of_two_steps_evicts_oldest_buffers_keeping_statistics() {
    let mut cache = TensorCache::new(2 * RECORD_BYTES);
    let mut originals = Vec::new();
    for step in 1..=5 {
        let rec = record("fc/weight", step, 0.25);
        originals.push(rec.statistics);
        cache.put(rec);
        cache.tick(&BTreeSet::new());
    }

    for step in 1..=3 {
        let lookup = cache.get(&key("fc/weight", step)).expect("stats retained");
        assert!(
            matches!(lookup, TensorLookup::PartiallyEvicted(ref r) if r.buffer.is_none()),
            "step {step} should be evicted, got {lookup:?}"
        );
    }
    for step in 4..=5 {
        assert!(matches!(
            cache.get(&key("fc/weight", step)),
            Ok(TensorLookup::Full(_))
        ));
    }
    for (step, original) in (1..=5).zip(originals) {
        assert_eq!(cache.get_stats(&key("fc/weight", step)).expect("stats"), original);
    }
    assert!(cache.resident_bytes() <= cache.byte_budget());
}

#[test]
fn recent_steps_stay_resident_over_budget() {
    let mut cache = TensorCache::new(1);
    for step in 1..=3 {
        cache.put(record("a", step, 0.0));
        cache.put(record("b", step, 0.0));
    }
    let evicted = cache.tick(&BTreeSet::new());
    assert_eq!(evicted, vec![1]);
    assert_eq!(
        cache.resident_bytes(),
        PROTECTED_RECENT_STEPS as u64 * 2 * RECORD_BYTES
    );
}

#[test]
fn protected_steps_are_skipped() {
    let mut cache = TensorCache::new(2 * RECORD_BYTES);
    for step in 1..=4 {
        cache.put(record("a", step, 0.0));
    }
    let protected: BTreeSet<u64> = [1].into_iter().collect();
    let evicted = cache.tick(&protected);

    assert_eq!(evicted, vec![2]);
    assert!(matches!(cache.get(&key("a", 1)), Ok(TensorLookup::Full(_))));
    assert!(matches!(cache.get(&key("a", 2)), Ok(TensorLookup::PartiallyEvicted(_))));
}

#[test]
fn published_view_is_unaffected_by_later_eviction() {
    let mut cache = TensorCache::new(RECORD_BYTES);
    for step in 1..=2 {
        cache.put(record("a", step, 0.0));
    }
    let before = cache.view();
    cache.put(record("a", 3, 0.0));
    cache.tick(&BTreeSet::new());

    assert!(matches!(before.get(&key("a", 1)), Ok(TensorLookup::Full(_))));
    assert!(matches!(cache.view().get(&key("a", 1)), Ok(TensorLookup::PartiallyEvicted(_))));
}

#[test]
fn release_buffers_keeps_every_statistic() {
    let mut cache = TensorCache::new(1024);
    cache.put(record("a", 1, 0.0));
    cache.put(record("a", 2, 0.0));
    cache.release_buffers();

    assert_eq!(cache.resident_bytes(), 0);
    assert!(matches!(cache.get(&key("a", 2)), Ok(TensorLookup::PartiallyEvicted(_))));
    assert!(cache.get_stats(&key("a", 1)).is_ok());
}

#[test]
fn prune_stats_keeps_most_recent_steps() {
    let mut cache = TensorCache::new(1024);
    for step in 1..=4 {
        cache.put(record("a", step, 0.0));
    }
    cache.prune_stats(2);
    assert_eq!(cache.oldest_step(), Some(3));
    assert!(matches!(cache.get_stats(&key("a", 1)), Err(AppError::NotFound(_))));
    assert_eq!(cache.resident_bytes(), 2 * RECORD_BYTES);
}

proptest! {
    #[test]
    fn eviction_never_loses_statistics(budget in 1u64..200, steps in 1u64..12, per_step in 1usize..4) {
        let mut cache = TensorCache::new(budget);
        let mut expected = Vec::new();
        for step in 1..=steps {
            for n in 0..per_step {
                let node = format!("n{n}");
                #[allow(clippy::cast_precision_loss)]
                let rec = record(&node, step, n as f32);
                expected.push((rec.key.clone(), rec.statistics));
                cache.put(rec);
            }
            cache.tick(&BTreeSet::new());
        }
        for (k, stats) in expected {
            prop_assert_eq!(cache.get_stats(&k).unwrap(), stats);
        }
        let recent = steps.min(PROTECTED_RECENT_STEPS as u64);
        let floor = recent * per_step as u64 * RECORD_BYTES;
        prop_assert!(cache.resident_bytes() <= budget.max(floor));
    }
}

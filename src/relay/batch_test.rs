use serde_json::json;

use super::*;
use crate::canvas::ChangeSource;

fn change(added: Vec<Value>, updated: Vec<Value>, removed: &[&str]) -> CanvasChange {
    CanvasChange {
        source: ChangeSource::User,
        added,
        updated,
        removed: removed.iter().map(|s| (*s).to_owned()).collect(),
    }
}

#[test]
fn empty_batch_flushes_nothing() {
    let mut batch = OutboundBatch::new();
    assert!(batch.is_empty());
    assert!(batch.flush(1).is_empty());
}

#[test]
fn added_and_updated_merge_into_one_put() {
    let mut batch = OutboundBatch::new();
    batch.record(&change(vec![json!({"id": "a", "x": 1})], vec![], &[]));
    batch.record(&change(vec![], vec![json!({"id": "a", "x": 2}), json!({"id": "b"})], &[]));

    let ops = batch.flush(42);

    assert_eq!(ops.len(), 1);
    let Operation::PutRecords { records, timestamp } = &ops[0] else {
        panic!("expected put_records, got {ops:?}");
    };
    assert_eq!(*timestamp, 42);
    assert_eq!(records, &vec![json!({"id": "a", "x": 2}), json!({"id": "b"})]);
    assert!(batch.is_empty());
}

#[test]
fn flush_emits_at_most_two_operations() {
    let mut batch = OutboundBatch::new();
    batch.record(&change(vec![json!({"id": "a"})], vec![], &["x"]));
    batch.record(&change(vec![json!({"id": "b"})], vec![], &["y"]));

    let ops = batch.flush(7);

    assert_eq!(ops.len(), 2);
    assert!(matches!(&ops[0], Operation::PutRecords { records, .. } if records.len() == 2));
    assert!(matches!(&ops[1], Operation::RemoveRecords { record_ids, .. } if record_ids == &["x", "y"]));
}

#[test]
fn remove_cancels_earlier_put() {
    let mut batch = OutboundBatch::new();
    batch.record(&change(vec![json!({"id": "a"})], vec![], &[]));
    batch.record(&change(vec![], vec![], &["a"]));

    let ops = batch.flush(1);

    assert_eq!(ops, vec![Operation::RemoveRecords { record_ids: vec!["a".into()], timestamp: 1 }]);
}

#[test]
fn put_revives_removed_record() {
    let mut batch = OutboundBatch::new();
    batch.record(&change(vec![], vec![], &["a"]));
    batch.record(&change(vec![json!({"id": "a", "v": 2})], vec![], &[]));

    let ops = batch.flush(1);

    assert_eq!(ops, vec![Operation::PutRecords { records: vec![json!({"id": "a", "v": 2})], timestamp: 1 }]);
}

#[test]
fn deadline_trails_latest_change() {
    let mut batch = OutboundBatch::new();
    let t0 = Instant::now();
    let window = Duration::from_millis(100);
    let cap = Duration::from_millis(500);

    assert_eq!(batch.deadline_at(t0, window, cap), t0 + window);
    let t1 = t0 + Duration::from_millis(60);
    assert_eq!(batch.deadline_at(t1, window, cap), t1 + window);
}

#[test]
fn deadline_is_capped_from_first_change() {
    let mut batch = OutboundBatch::new();
    let t0 = Instant::now();
    let window = Duration::from_millis(100);
    let cap = Duration::from_millis(500);
    batch.deadline_at(t0, window, cap);

    let late = t0 + Duration::from_millis(450);
    assert_eq!(batch.deadline_at(late, window, cap), t0 + cap);
}

#[test]
fn flush_starts_a_new_batch() {
    let mut batch = OutboundBatch::new();
    let t0 = Instant::now();
    let window = Duration::from_millis(100);
    let cap = Duration::from_millis(200);
    batch.record(&change(vec![json!({"id": "a"})], vec![], &[]));
    batch.deadline_at(t0, window, cap);
    batch.flush(1);

    let later = t0 + Duration::from_millis(1000);
    assert_eq!(batch.deadline_at(later, window, cap), later + window);
}

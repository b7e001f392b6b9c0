use super::{LogStore, PersistPolicy, PersistRule, PersistStrategy};
use crate::broker::message::{Message, MessageSource, PublishOptions};
use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::json;
use tempfile::tempdir;

fn message_at(message_type: &str, timestamp: i64) -> Message {
    Message::new(
        message_type,
        json!({"n": 1}),
        MessageSource::new("test"),
        PublishOptions::default(),
        timestamp,
    )
}

#[test]
fn test_append_and_read_back() {
    let dir = tempdir().unwrap();
    let store = LogStore::new(dir.path().join("log"));
    let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap().timestamp_millis();

    let batch = vec![message_at("A", ts), message_at("B", ts + 1)];
    assert_eq!(store.append(&batch).unwrap(), 2);

    let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    assert!(store.path_for(day).ends_with("messages-2026-03-01.jsonl"));
    let read = store.read_day(day).unwrap();
    assert_eq!(read, batch);
}

#[test]
fn test_batches_are_partitioned_by_date() {
    let dir = tempdir().unwrap();
    let store = LogStore::new(dir.path());
    let day1 = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 59).unwrap().timestamp_millis();
    let day2 = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 1).unwrap().timestamp_millis();

    store
        .append(&[message_at("A", day1), message_at("B", day2)])
        .unwrap();
    store.append(&[message_at("C", day2)]).unwrap();

    let first = store
        .read_day(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
        .unwrap();
    let second = store
        .read_day(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap())
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].message_type, "A");
    let types: Vec<_> = second.iter().map(|m| m.message_type.as_str()).collect();
    assert_eq!(types, vec!["B", "C"]);
}

#[test]
fn test_read_missing_day_is_empty() {
    let dir = tempdir().unwrap();
    let store = LogStore::new(dir.path());
    let day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    assert!(store.read_day(day).unwrap().is_empty());
}

#[test]
fn test_append_fails_when_directory_is_a_file() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();
    let store = LogStore::new(&blocker);
    let err = store.append(&[message_at("A", 0)]).unwrap_err();
    assert_eq!(err.written, 0);
    assert_eq!(err.unwritten.len(), 1);
}

#[test]
fn test_failed_day_returns_only_unwritten_records() {
    let dir = tempdir().unwrap();
    let store = LogStore::new(dir.path());
    let day1 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap().timestamp_millis();
    let day2 = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap().timestamp_millis();
    let first = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    let second = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

    // a directory where the second day's file should go
    std::fs::create_dir_all(store.path_for(second)).unwrap();

    let batch = vec![
        message_at("A", day1),
        message_at("B", day2),
        message_at("C", day2),
    ];
    let err = store.append(&batch).unwrap_err();
    assert_eq!(err.written, 1);
    let left: Vec<_> = err.unwritten.iter().map(|m| m.message_type.as_str()).collect();
    assert_eq!(left, vec!["B", "C"]);

    std::fs::remove_dir(store.path_for(second)).unwrap();
    assert_eq!(store.append(&err.unwritten).unwrap(), 2);

    let day_one = store.read_day(first).unwrap();
    assert_eq!(day_one.len(), 1);
    assert_eq!(day_one[0].message_type, "A");
    let day_two: Vec<_> = store
        .read_day(second)
        .unwrap()
        .into_iter()
        .map(|m| m.message_type)
        .collect();
    assert_eq!(day_two, vec!["B", "C"]);
}

#[test]
fn test_rule_reads_both_sample_rate_spellings() {
    let camel: PersistRule = serde_json::from_value(json!({
        "pattern": "*",
        "strategy": "sample",
        "sampleRate": 0.5
    }))
    .unwrap();
    let snake: PersistRule = serde_json::from_value(json!({
        "pattern": "*",
        "strategy": "sample",
        "sample_rate": 0.5
    }))
    .unwrap();
    assert_eq!(camel, snake);
    assert_eq!(camel.sample_rate, Some(0.5));
    assert_eq!(serde_json::to_value(&camel).unwrap()["sampleRate"], json!(0.5));
}

#[test]
fn test_earlier_rule_wins_over_catch_all() {
    let policy = PersistPolicy::compile(&[
        PersistRule::always("CONTAINER_*"),
        PersistRule::never("*"),
    ])
    .unwrap();

    assert!(policy.should_persist("CONTAINER_FOUND"));
    assert!(!policy.should_persist("DOM_CLICK"));
}

#[test]
fn test_list_order_is_the_tie_break() {
    let policy =
        PersistPolicy::compile(&[PersistRule::never("*"), PersistRule::always("CONTAINER_*")])
            .unwrap();
    assert!(!policy.should_persist("CONTAINER_FOUND"));
}

#[test]
fn test_no_matching_rule_means_not_persisted() {
    let policy = PersistPolicy::compile(&[PersistRule::always("A")]).unwrap();
    assert!(!policy.should_persist("B"));
    assert!(PersistPolicy::default().is_empty());
    assert!(!PersistPolicy::default().should_persist("A"));
}

#[test]
fn test_sample_rate_extremes() {
    let policy = PersistPolicy::compile(&[
        PersistRule::sample("ALL_*", 1.0),
        PersistRule::sample("NONE_*", 0.0),
        PersistRule::sample("CLAMPED_*", 7.0),
    ])
    .unwrap();

    for _ in 0..50 {
        assert!(policy.should_persist("ALL_X"));
        assert!(!policy.should_persist("NONE_X"));
        assert!(policy.should_persist("CLAMPED_X"));
    }
    assert_eq!(
        policy.strategy_for("CLAMPED_X"),
        Some((PersistStrategy::Sample, 1.0))
    );
}

#[test]
fn test_rule_with_empty_pattern_is_rejected() {
    assert!(PersistPolicy::compile(&[PersistRule::always("")]).is_err());
}

use super::{Broker, HistoryQuery, LifecycleEvent, MessageSource, PublishOptions, SubscribeOptions};
use crate::broker::message::{MESSAGE_VERSION, SYSTEM_ERROR};
use crate::config::{BrokerSettings, PersistenceSettings};
use crate::persistence::{LogStore, PersistRule};
use crate::utils::error::BrokerError;
use chrono::Utc;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};

fn source() -> MessageSource {
    MessageSource::new("test")
}

async fn running_broker() -> Arc<Broker> {
    let broker = Broker::for_tests();
    broker.start().await.unwrap();
    broker
}

fn persisting_broker(dir: &Path, rules: Vec<PersistRule>) -> Arc<Broker> {
    Broker::new(BrokerSettings {
        history_limit: 100,
        persistence: PersistenceSettings {
            enabled: true,
            directory: dir.to_path_buf(),
            // long enough that only explicit flushes run during the test
            flush_interval_ms: 60_000,
            rules,
        },
    })
    .unwrap()
}

/// Subscribe a handler that records `label` for every message it sees.
fn record(
    broker: &Broker,
    pattern: &str,
    label: &str,
    options: SubscribeOptions,
) -> (String, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let label = label.to_string();
    let id = broker
        .subscribe(
            pattern,
            move |message| {
                let sink = sink.clone();
                let label = label.clone();
                async move {
                    sink.lock().unwrap().push(format!("{label}:{}", message.message_type));
                    Ok(())
                }
            },
            options,
        )
        .unwrap();
    (id, seen)
}

#[tokio::test]
async fn test_publish_before_start_fails() {
    let broker = Broker::for_tests();
    let err = broker.publish("A", json!({}), source()).await.unwrap_err();
    assert_eq!(err, BrokerError::NotRunning);
}

#[tokio::test]
async fn test_start_twice_fails_and_stop_is_idempotent() {
    let broker = Broker::for_tests();
    broker.start().await.unwrap();
    assert_eq!(broker.start().await.unwrap_err(), BrokerError::AlreadyRunning);

    broker.stop().await;
    broker.stop().await;
    assert!(!broker.is_running());
    assert!(broker.publish("A", json!({}), source()).await.is_err());

    // restart after stop
    broker.start().await.unwrap();
    assert!(broker.publish("A", json!({}), source()).await.is_ok());
}

#[tokio::test]
async fn test_literal_pattern_matches_exactly() {
    let broker = running_broker().await;
    let (_, seen) = record(&broker, "CONTAINER_FOUND", "h", SubscribeOptions::default());

    broker.publish("CONTAINER_FOUND", json!({}), source()).await.unwrap();
    broker.publish("CONTAINER_FOUND_ALL", json!({}), source()).await.unwrap();
    broker.publish("CONTAINER_FOUN", json!({}), source()).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["h:CONTAINER_FOUND"]);
}

#[tokio::test]
async fn test_wildcard_subscriptions() {
    let broker = running_broker().await;
    let (_, prefixed) = record(&broker, "MSG_X_*", "x", SubscribeOptions::default());
    let (_, everything) = record(&broker, "*", "all", SubscribeOptions::default());

    for t in ["MSG_X_Y", "MSG_X_", "MSG_Y_Z"] {
        broker.publish(t, json!({}), source()).await.unwrap();
    }

    assert_eq!(*prefixed.lock().unwrap(), vec!["x:MSG_X_Y", "x:MSG_X_"]);
    assert_eq!(everything.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_priority_order_within_a_pattern() {
    let broker = running_broker().await;
    let order = Arc::new(Mutex::new(Vec::new()));

    for (label, priority) in [("low", 5), ("high", 10), ("low-2", 5), ("lowest", 0)] {
        let order = order.clone();
        broker
            .subscribe(
                "EVT",
                move |_| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(label);
                        Ok(())
                    }
                },
                SubscribeOptions::default().with_priority(priority),
            )
            .unwrap();
    }

    for _ in 0..3 {
        broker.publish("EVT", json!({}), source()).await.unwrap();
    }

    let order = order.lock().unwrap();
    for chunk in order.chunks(4) {
        assert_eq!(chunk, ["high", "low", "low-2", "lowest"]);
    }
    assert_eq!(order.len(), 12);
}

#[tokio::test]
async fn test_once_subscription_fires_exactly_once() {
    let broker = running_broker().await;
    let (id, seen) = record(&broker, "EVT", "once", SubscribeOptions::once());

    for _ in 0..5 {
        broker.publish("EVT", json!({}), source()).await.unwrap();
    }

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(!broker.unsubscribe(&id));
    assert_eq!(broker.stats().pattern_groups, 0);
}

#[tokio::test]
async fn test_once_subscription_under_concurrent_publishes() {
    let broker = running_broker().await;
    let (_, seen) = record(&broker, "EVT", "once", SubscribeOptions::once());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let broker = broker.clone();
        tasks.push(tokio::spawn(async move {
            broker.publish("EVT", json!({}), source()).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let broker = running_broker().await;
    let (id, seen) = record(&broker, "EVT", "h", SubscribeOptions::default());
    assert_eq!(broker.subscription_count(), 1);

    assert!(broker.unsubscribe(&id));
    assert!(!broker.unsubscribe(&id));
    assert!(!broker.unsubscribe("sub-does-not-exist"));

    broker.publish("EVT", json!({}), source()).await.unwrap();
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_by_pattern() {
    let broker = running_broker().await;
    let (_, a) = record(&broker, "EVT_*", "a", SubscribeOptions::default());
    let (_, b) = record(&broker, "EVT_*", "b", SubscribeOptions::default());
    let (_, c) = record(&broker, "EVT_ONE", "c", SubscribeOptions::default());

    assert!(broker.unsubscribe_by_pattern("EVT_*"));
    assert!(!broker.unsubscribe_by_pattern("EVT_*"));
    broker.publish("EVT_ONE", json!({}), source()).await.unwrap();

    assert!(a.lock().unwrap().is_empty());
    assert!(b.lock().unwrap().is_empty());
    assert_eq!(c.lock().unwrap().len(), 1);
    assert_eq!(broker.subscription_count(), 1);
}

#[tokio::test]
async fn test_empty_pattern_is_rejected() {
    let broker = Broker::for_tests();
    let result = broker.subscribe("", |_| async { Ok(()) }, SubscribeOptions::default());
    assert!(matches!(result, Err(BrokerError::InvalidPattern { .. })));
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn test_filter_skips_and_is_counted() {
    let broker = running_broker().await;
    let (_, seen) = record(
        &broker,
        "ORDER",
        "big",
        SubscribeOptions::default()
            .with_filter(|m| m.get("amount").and_then(|v| v.as_i64()).unwrap_or(0) > 100),
    );

    broker.publish("ORDER", json!({"amount": 5}), source()).await.unwrap();
    broker.publish("ORDER", json!({"amount": 500}), source()).await.unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    let stats = broker.stats();
    assert_eq!(stats.messages_filtered, 1);
    assert_eq!(stats.messages_delivered, 1);
}

#[tokio::test]
async fn test_transform_is_local_to_one_handler() {
    let broker = running_broker().await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    for (priority, transform) in [(10, true), (0, false)] {
        let seen = seen.clone();
        let mut options = SubscribeOptions::default().with_priority(priority);
        if transform {
            options = options.with_transform(|mut m| {
                m.payload.insert("name".into(), json!("changed"));
                m
            });
        }
        broker
            .subscribe(
                "USER",
                move |m| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(m.get_str("name").unwrap_or("").to_string());
                        Ok(())
                    }
                },
                options,
            )
            .unwrap();
    }

    broker.publish("USER", json!({"name": "original"}), source()).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["changed", "original"]);
    let stored = broker.history(&HistoryQuery::new().message_type("USER"));
    assert_eq!(stored[0].get_str("name"), Some("original"));
}

#[tokio::test]
async fn test_handler_error_is_isolated_and_reported() {
    let broker = running_broker().await;
    let failing = broker
        .subscribe(
            "EVT",
            |_| async { Err(anyhow::anyhow!("boom")) },
            SubscribeOptions::default().with_priority(10),
        )
        .unwrap();
    let (_, sibling) = record(&broker, "EVT", "sibling", SubscribeOptions::default());

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    broker
        .subscribe(
            SYSTEM_ERROR,
            move |m| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(m);
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();

    let id = broker.publish("EVT", json!({}), source()).await.unwrap();

    assert_eq!(sibling.lock().unwrap().len(), 1);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].get_str("subscriptionId"), Some(failing.as_str()));
    assert_eq!(errors[0].get_str("eventType"), Some("EVT"));
    assert_eq!(errors[0].get_str("messageId"), Some(id.as_str()));
    assert_eq!(errors[0].get_str("error"), Some("boom"));
    assert_eq!(errors[0].meta.parent_id.as_deref(), Some(id.as_str()));
    assert_eq!(broker.stats().handler_errors, 1);
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    let broker = running_broker().await;
    broker
        .subscribe(
            "EVT",
            |_| async {
                let explode = true;
                if explode {
                    panic!("handler blew up");
                }
                Ok(())
            },
            SubscribeOptions::default().with_priority(1),
        )
        .unwrap();
    let (_, sibling) = record(&broker, "EVT", "sibling", SubscribeOptions::default());
    let (_, errors) = record(&broker, SYSTEM_ERROR, "err", SubscribeOptions::default());

    broker.publish("EVT", json!({}), source()).await.unwrap();

    assert_eq!(sibling.lock().unwrap().len(), 1);
    assert_eq!(errors.lock().unwrap().len(), 1);
    let reported = broker.history(&HistoryQuery::new().message_type(SYSTEM_ERROR));
    assert!(
        reported[0]
            .get_str("error")
            .unwrap()
            .contains("handler blew up")
    );
}

#[tokio::test]
async fn test_failing_system_error_handler_does_not_loop() {
    let broker = running_broker().await;
    broker
        .subscribe(
            "*",
            |_| async { Err(anyhow::anyhow!("always fails")) },
            SubscribeOptions::default(),
        )
        .unwrap();

    broker.publish("EVT", json!({}), source()).await.unwrap();

    // the original message and one system.error, nothing more
    let stats = broker.stats();
    assert_eq!(stats.messages_sent, 2);
    assert_eq!(stats.handler_errors, 2);
}

#[tokio::test]
async fn test_handlers_can_publish_and_unsubscribe() {
    let broker = running_broker().await;
    let (_, downstream) = record(&broker, "STEP_TWO", "two", SubscribeOptions::default());

    let inner = broker.clone();
    broker
        .subscribe(
            "STEP_ONE",
            move |m| {
                let inner = inner.clone();
                async move {
                    inner.publish("STEP_TWO", json!({"from": m.id}), MessageSource::new("chain")).await?;
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();

    broker.publish("STEP_ONE", json!({}), source()).await.unwrap();
    // publish returns after nested dispatch settled
    assert_eq!(*downstream.lock().unwrap(), vec!["two:STEP_TWO"]);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let broker = Broker::new(BrokerSettings {
        history_limit: 3,
        ..BrokerSettings::default()
    })
    .unwrap();
    broker.start().await.unwrap();

    for i in 0..4 {
        broker.publish(&format!("EVT_{i}"), json!({}), source()).await.unwrap();
    }

    let history = broker.history(&HistoryQuery::new());
    let types: Vec<_> = history.iter().map(|m| m.message_type.as_str()).collect();
    assert_eq!(types, vec!["EVT_1", "EVT_2", "EVT_3"]);
    assert_eq!(broker.stats().history_size, 3);

    broker.clear_history();
    assert!(broker.history(&HistoryQuery::new()).is_empty());
}

#[tokio::test]
async fn test_history_query_filters() {
    let broker = running_broker().await;
    let before = Utc::now().timestamp_millis();
    for t in ["DOM_CLICK", "DOM_TYPE", "CONTAINER_FOUND", "DOM_SCROLL"] {
        broker.publish(t, json!({}), source()).await.unwrap();
    }
    let after = Utc::now().timestamp_millis();

    let dom = broker.history(&HistoryQuery::new().message_type("DOM_*"));
    assert_eq!(dom.len(), 3);

    let exact = broker.history(&HistoryQuery::new().message_type("DOM_TYPE"));
    assert_eq!(exact.len(), 1);

    let tail = broker.history(&HistoryQuery::new().message_type("DOM_*").limit(2));
    let types: Vec<_> = tail.iter().map(|m| m.message_type.as_str()).collect();
    assert_eq!(types, vec!["DOM_TYPE", "DOM_SCROLL"]);

    let in_range = broker.history(&HistoryQuery::new().since(before).until(after));
    assert_eq!(in_range.len(), 4);
    let future = broker.history(&HistoryQuery::new().since(after + 60_000));
    assert!(future.is_empty());
}

#[tokio::test]
async fn test_message_metadata() {
    let broker = running_broker().await;
    let source = MessageSource::new("container-discovery")
        .with_session("s1")
        .with_container("c1")
        .with_user("u1");

    let id = broker.publish("CONTAINER_FOUND", json!(42), source).await.unwrap();
    let anonymous = broker
        .publish_with(
            "ANON",
            json!({"a": 1}),
            MessageSource::default(),
            PublishOptions {
                priority: Some(3),
                ttl: Some(1000),
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap();
    assert_ne!(id, anonymous);

    let history = broker.history(&HistoryQuery::new());
    let found = &history[0];
    assert_eq!(found.id, id);
    assert_eq!(found.meta.version, MESSAGE_VERSION);
    assert!(found.meta.trace_id.starts_with("container-discovery-"));
    assert_eq!(found.source.session_id.as_deref(), Some("s1"));
    assert_eq!(found.get("value"), Some(&json!(42)));

    let anon = &history[1];
    assert!(!anon.meta.trace_id.is_empty());
    assert_eq!(anon.meta.priority, Some(3));
    assert_eq!(anon.meta.ttl, Some(1000));

    let record = serde_json::to_value(found).unwrap();
    assert_eq!(record["type"], "CONTAINER_FOUND");
    assert_eq!(record["source"]["containerId"], "c1");
    assert_eq!(record["source"]["userId"], "u1");
    assert_eq!(record["meta"]["traceId"], json!(found.meta.trace_id));
}

#[tokio::test]
async fn test_stats_counters_and_uptime() {
    let broker = Broker::for_tests();
    assert_eq!(broker.stats().uptime_ms, 0);
    broker.start().await.unwrap();
    record(&broker, "A", "a1", SubscribeOptions::default());
    record(&broker, "A", "a2", SubscribeOptions::default());
    record(&broker, "B*", "b", SubscribeOptions::default());

    broker.publish("A", json!({}), source()).await.unwrap();
    broker.publish("B1", json!({}), source()).await.unwrap();
    broker.publish("C", json!({}), source()).await.unwrap();

    let stats = broker.stats();
    assert_eq!(stats.messages_sent, 3);
    assert_eq!(stats.messages_delivered, 3);
    assert_eq!(stats.messages_persisted, 0);
    assert_eq!(stats.active_subscriptions, 3);
    assert_eq!(stats.pattern_groups, 2);
}

#[tokio::test]
async fn test_lifecycle_notifications() {
    let broker = Broker::for_tests();
    let mut events = broker.lifecycle();

    broker.start().await.unwrap();
    broker.stop().await;

    assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::Started { .. }));
    assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::Stopped { .. }));
}

#[tokio::test]
async fn test_persist_rules_and_stop_drains_queue() {
    let dir = tempfile::tempdir().unwrap();
    let broker = persisting_broker(
        dir.path(),
        vec![PersistRule::always("CONTAINER_*"), PersistRule::never("*")],
    );
    broker.start().await.unwrap();

    broker.publish("CONTAINER_FOUND", json!({"n": 1}), source()).await.unwrap();
    broker.publish("DOM_CLICK", json!({}), source()).await.unwrap();
    broker
        .publish_with(
            "DOM_TYPE",
            json!({}),
            source(),
            PublishOptions {
                persist: Some(true),
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(broker.stats().queued_for_persistence, 2);

    broker.stop().await;

    let store = LogStore::new(dir.path());
    let written = store.read_day(Utc::now().date_naive()).unwrap();
    let types: Vec<_> = written.iter().map(|m| m.message_type.as_str()).collect();
    assert_eq!(types, vec!["CONTAINER_FOUND", "DOM_TYPE"]);
    let stats = broker.stats();
    assert_eq!(stats.messages_persisted, 2);
    assert_eq!(stats.queued_for_persistence, 0);
}

#[tokio::test]
async fn test_periodic_flush_writes_batches() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::new(BrokerSettings {
        history_limit: 10,
        persistence: PersistenceSettings {
            enabled: true,
            directory: dir.path().to_path_buf(),
            flush_interval_ms: 20,
            rules: vec![PersistRule::always("*")],
        },
    })
    .unwrap();
    broker.start().await.unwrap();

    broker.publish("TICK", json!({}), source()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(broker.stats().messages_persisted, 1);
    broker.stop().await;
}

#[tokio::test]
async fn test_persistence_failure_requeues_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocked");
    std::fs::write(&blocker, "not a directory").unwrap();

    let broker = persisting_broker(&blocker, vec![PersistRule::always("AUDIT_*")]);
    let mut lifecycle = broker.lifecycle();
    broker.start().await.unwrap();
    let (_, errors) = record(&broker, SYSTEM_ERROR, "err", SubscribeOptions::default());

    broker.publish("AUDIT_ONE", json!({}), source()).await.unwrap();
    broker.publish("AUDIT_TWO", json!({}), source()).await.unwrap();

    assert!(broker.flush().await.is_err());
    // failure is reported but the broker keeps running
    assert!(broker.is_running());
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert_eq!(broker.stats().queued_for_persistence, 2);

    broker.publish("AUDIT_THREE", json!({}), source()).await.unwrap();
    assert!(broker.flush().await.is_err());
    assert_eq!(broker.stats().queued_for_persistence, 3);

    let _started = lifecycle.recv().await.unwrap();
    assert!(matches!(
        lifecycle.recv().await.unwrap(),
        LifecycleEvent::PersistenceFailed { batch_size: 2, .. }
    ));

    let error_messages = broker.history(&HistoryQuery::new().message_type(SYSTEM_ERROR));
    assert_eq!(error_messages[0].get_str("kind"), Some("persistence"));
    assert_eq!(error_messages[0].get("batchSize"), Some(&json!(2)));
    assert_eq!(error_messages[0].get("written"), Some(&json!(0)));

    // once the directory can be created the failed batch lands ahead of newer messages
    std::fs::remove_file(&blocker).unwrap();
    assert_eq!(broker.flush().await.unwrap(), 3);
    assert_eq!(broker.stats().queued_for_persistence, 0);
    assert_eq!(broker.stats().messages_persisted, 3);

    let written = LogStore::new(&blocker)
        .read_day(Utc::now().date_naive())
        .unwrap();
    let types: Vec<_> = written.iter().map(|m| m.message_type.as_str()).collect();
    assert_eq!(types, vec!["AUDIT_ONE", "AUDIT_TWO", "AUDIT_THREE"]);
}

#[tokio::test]
async fn test_slow_group_does_not_hold_up_other_groups() {
    let broker = running_broker().await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let slow = order.clone();
    broker
        .subscribe(
            "SLOW_*",
            move |_| {
                let slow = slow.clone();
                async move {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    slow.lock().unwrap().push("slow");
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();
    let fast = order.clone();
    broker
        .subscribe(
            "*",
            move |_| {
                let fast = fast.clone();
                async move {
                    fast.lock().unwrap().push("fast");
                    Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();

    let started = std::time::Instant::now();
    broker.publish("SLOW_X", json!({}), source()).await.unwrap();

    // publish waits for both groups, but the fast one is not queued behind the slow one
    assert!(started.elapsed() >= std::time::Duration::from_millis(100));
    assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use bunnybus::{
    channel::{DEFAULT_CHANNEL_NAME, MANAGEMENT_CHANNEL_NAME},
    envelope::{HEADER_CREATED_AT, HEADER_ERRORED_AT, HEADER_RETRY_COUNT, HEADER_ROUTE_KEY, HEADER_TRANSACTION_ID},
    handler,
    logger::{LogCallback, REQUIRED_LEVELS},
    retry::{poll_until, timeout_bound},
    BunnyBus, BunnyConfig, BunnyError, BusEvent, CallbackLogger, GetAllOptions, Handler, Handlers, HeaderValue,
    Incoming, Level, MemoryBroker, Payload, PublishOptions, QueueOptions, SubscribeOptions,
};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::broadcast;

async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout_bound(
        poll_until(|| std::future::ready(Ok(condition())), Duration::from_millis(10)),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
}

async fn next_event<F>(events: &mut broadcast::Receiver<BusEvent>, wanted: F) -> BusEvent
where
    F: Fn(&BusEvent) -> bool,
{
    let wait = async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return Ok(event);
            }
        }
    };
    timeout_bound(wait, Duration::from_secs(5)).await.unwrap()
}

fn counting(calls: Arc<AtomicUsize>) -> Handler {
    handler(move |incoming: Incoming| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            incoming.ack().await
        }
    })
}

fn bus() -> (MemoryBroker, BunnyBus) {
    let broker = MemoryBroker::new();
    let bus = BunnyBus::with_connector(BunnyConfig::default(), Arc::new(broker.clone()));
    (broker, bus)
}

#[tokio::test]
async fn published_messages_reach_matching_handlers() {
    let (_broker, bus) = bus();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let other = Arc::new(AtomicUsize::new(0));

    let sink = seen.clone();
    let handlers = Handlers::new()
        .on(
            "a",
            handler(move |incoming: Incoming| {
                let sink = sink.clone();
                async move {
                    let headers = incoming.metadata().map(|m| m.envelope());
                    sink.lock().unwrap().push((incoming.message().clone(), headers));
                    incoming.ack().await
                }
            }),
        )
        .on("z", counting(other.clone()));
    let options = SubscribeOptions {
        meta: true,
        ..Default::default()
    };
    bus.subscribe("subscription-test", handlers, options).await.unwrap();

    bus.publish(json!({"event": "a", "name": "bunnybus"}), PublishOptions::default())
        .await
        .unwrap();
    eventually(|| !seen.lock().unwrap().is_empty()).await;

    let (payload, headers) = seen.lock().unwrap()[0].clone();
    let headers = headers.unwrap();
    assert_eq!(payload, Payload::Json(json!({"event": "a", "name": "bunnybus"})));
    assert_eq!(headers.route_key.as_deref(), Some("a"));
    let transaction_id = headers.transaction_id.unwrap();
    assert_eq!(transaction_id.len(), 40);
    assert!(transaction_id.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(headers.created_at.is_some());
    assert_eq!(other.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_handler_is_retried_up_to_the_ceiling() {
    let broker = MemoryBroker::new();
    let config = BunnyConfig {
        max_retry_count: 3,
        ..Default::default()
    };
    let bus = BunnyBus::with_connector(config, Arc::new(broker.clone()));
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let handlers = Handlers::new().on(
        "a",
        handler(move |_incoming: Incoming| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BunnyError::Handler("always failing".into()))
            }
        }),
    );
    bus.subscribe("retry-test", handlers, SubscribeOptions::default()).await.unwrap();

    bus.publish(
        json!({"event": "a"}),
        PublishOptions {
            transaction_id: Some("tx-1".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    eventually(|| broker.queue_depth("error-bus") == Some(1)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let dead = &broker.messages("error-bus")[0];
    let headers = &dead.properties.headers;
    assert_eq!(headers.get(HEADER_RETRY_COUNT), Some(&HeaderValue::Int(3)));
    assert_eq!(headers.get(HEADER_TRANSACTION_ID), Some(&HeaderValue::from("tx-1")));
    assert!(headers.contains_key(HEADER_ERRORED_AT));
    assert_eq!(broker.queue_depth("retry-test"), Some(0));
}

#[tokio::test]
async fn duplicate_subscription_is_refused() {
    let (_broker, bus) = bus();
    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = Handlers::new().on("a", counting(calls));

    bus.subscribe("dup", handlers.clone(), SubscribeOptions::default())
        .await
        .unwrap();
    assert_eq!(
        bus.subscribe("dup", handlers, SubscribeOptions::default()).await,
        Err(BunnyError::SubscriptionExists("dup".into()))
    );
}

#[tokio::test]
async fn blocked_queues_refuse_subscriptions_until_unblocked() {
    let (broker, bus) = bus();
    let handlers = Handlers::new().on("a", counting(Arc::new(AtomicUsize::new(0))));

    bus.block_queue("blocked").await.unwrap();
    assert_eq!(
        bus.subscribe("blocked", handlers.clone(), SubscribeOptions::default()).await,
        Err(BunnyError::SubscriptionBlocked("blocked".into()))
    );

    bus.unblock_queue("blocked").await.unwrap();
    bus.subscribe("blocked", handlers, SubscribeOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.consumer_count("blocked"), Some(1));

    bus.block_queue("blocked").await.unwrap();
    assert_eq!(broker.consumer_count("blocked"), Some(0));
    assert!(bus.subscriptions().contains("blocked", false));

    bus.unblock_queue("blocked").await.unwrap();
    assert_eq!(broker.consumer_count("blocked"), Some(1));
}

#[tokio::test]
async fn channel_contexts_are_shared() {
    let (broker, bus) = bus();

    let (first, second) = tokio::join!(
        bus.auto_build_channel_context(DEFAULT_CHANNEL_NAME),
        bus.auto_build_channel_context(DEFAULT_CHANNEL_NAME),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(broker.connect_count(), 1);

    let management = bus
        .auto_build_channel_context(MANAGEMENT_CHANNEL_NAME)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &management));
    assert_eq!(broker.connect_count(), 1);
}

#[tokio::test]
async fn subscriptions_recover_after_connection_loss() {
    let (broker, bus) = bus();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut events = bus.events();

    bus.subscribe(
        "recovery-test",
        Handlers::new().on("a", counting(calls.clone())),
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    broker.drop_connections();
    next_event(&mut events, |e| matches!(e, BusEvent::Recovering { .. })).await;
    let recovered = next_event(&mut events, |e| {
        matches!(e, BusEvent::Recovered { .. } | BusEvent::RecoveryFailed { .. })
    })
    .await;
    assert_eq!(
        recovered,
        BusEvent::Recovered {
            queue: "recovery-test".into()
        }
    );
    assert!(bus.subscriptions().contains("recovery-test", true));
    assert_eq!(broker.connect_count(), 2);

    bus.publish(json!({"event": "a"}), PublishOptions::default())
        .await
        .unwrap();
    eventually(|| calls.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn unsubscribe_stops_consumption_without_recovery() {
    let (broker, bus) = bus();
    let mut events = bus.events();
    bus.subscribe(
        "leaving",
        Handlers::new().on("a", counting(Arc::new(AtomicUsize::new(0)))),
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(bus.unsubscribe("leaving", true).await, Ok(true));
    assert_eq!(broker.consumer_count("leaving"), Some(0));
    assert!(!bus.subscriptions().contains("leaving", false));
    assert_eq!(bus.unsubscribe("leaving", true).await, Ok(false));

    next_event(&mut events, |e| matches!(e, BusEvent::Unsubscribed { .. })).await;
    tokio::task::yield_now().await;
    assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
}

#[tokio::test]
async fn get_all_drains_the_queue() {
    let (broker, bus) = bus();
    for id in 0..3 {
        bus.send(json!({"event": "item", "id": id}), "drain", PublishOptions::default())
            .await
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let drained = bus
        .get_all(
            "drain",
            handler(move |incoming: Incoming| {
                let sink = sink.clone();
                async move {
                    let id = incoming.message().as_json().and_then(|v| v["id"].as_i64());
                    sink.lock().unwrap().push(id);
                    incoming.ack().await
                }
            }),
            GetAllOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(drained, 3);
    assert_eq!(*seen.lock().unwrap(), vec![Some(0), Some(1), Some(2)]);
    assert_eq!(broker.queue_depth("drain"), Some(0));
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn requeue_keeps_the_envelope_identity() {
    let (broker, bus) = bus();
    bus.send(json!({"event": "a"}), "requeue-test", PublishOptions::default())
        .await
        .unwrap();

    let first = bus.get("requeue-test").await.unwrap().unwrap();
    bus.requeue(&first, None, "requeue-test").await.unwrap();
    let second = bus.get("requeue-test").await.unwrap().unwrap();

    let (before, after) = (&first.properties.headers, &second.properties.headers);
    assert_eq!(after.get(HEADER_TRANSACTION_ID), before.get(HEADER_TRANSACTION_ID));
    assert_eq!(after.get(HEADER_CREATED_AT), before.get(HEADER_CREATED_AT));
    assert_eq!(after.get(HEADER_ROUTE_KEY), Some(&HeaderValue::from("a")));
    assert_eq!(after.get(HEADER_RETRY_COUNT), Some(&HeaderValue::Int(1)));

    bus.ack(&second, None).await.unwrap();
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("requeue-test"), Some(0));
}

#[tokio::test]
async fn reject_without_dead_letter_queue_fails() {
    let broker = MemoryBroker::new();
    let config = BunnyConfig {
        error_queue: None,
        ..Default::default()
    };
    let bus = BunnyBus::with_connector(config, Arc::new(broker.clone()));
    bus.send(json!({"event": "a"}), "q", PublishOptions::default())
        .await
        .unwrap();
    let message = bus.get("q").await.unwrap().unwrap();

    assert_eq!(
        bus.reject(&message, None, None).await,
        Err(BunnyError::NoDeadLetterQueue)
    );
    bus.reject(&message, None, Some("q-errors")).await.unwrap();
    assert_eq!(broker.queue_depth("q-errors"), Some(1));
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn stop_closes_everything() {
    let (broker, bus) = bus();
    bus.subscribe(
        "stopping",
        Handlers::new().on("a", counting(Arc::new(AtomicUsize::new(0)))),
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    bus.stop().await.unwrap();

    assert_eq!(broker.open_connections(), 0);
    assert!(bus.subscriptions().contains("stopping", false));
    assert!(!bus.subscriptions().contains("stopping", true));
}

#[tokio::test]
async fn requeueing_handler_runs_max_retry_count_times() {
    let broker = MemoryBroker::new();
    let config = BunnyConfig {
        max_retry_count: 3,
        ..Default::default()
    };
    let bus = BunnyBus::with_connector(config, Arc::new(broker.clone()));
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let handlers = Handlers::new().on(
        "a",
        handler(move |incoming: Incoming| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                incoming.requeue().await
            }
        }),
    );
    bus.subscribe("requeue-loop", handlers, SubscribeOptions::default())
        .await
        .unwrap();

    bus.publish(json!({"event": "a"}), PublishOptions::default())
        .await
        .unwrap();
    eventually(|| broker.queue_depth("error-bus") == Some(1)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let dead = &broker.messages("error-bus")[0];
    assert_eq!(
        dead.properties.headers.get(HEADER_RETRY_COUNT),
        Some(&HeaderValue::Int(3))
    );
    assert!(dead.properties.headers.contains_key(HEADER_ERRORED_AT));
    assert_eq!(broker.queue_depth("requeue-loop"), Some(0));
}

#[tokio::test]
async fn requeue_works_on_queues_with_custom_options() {
    let (broker, bus) = bus();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let handlers = Handlers::new().on(
        "a",
        handler(move |incoming: Incoming| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    incoming.requeue().await
                } else {
                    incoming.ack().await
                }
            }
        }),
    );
    let options = SubscribeOptions {
        queue: Some(QueueOptions::default().transient().ttl(60_000)),
        ..Default::default()
    };
    bus.subscribe("transient", handlers, options).await.unwrap();

    bus.publish(json!({"event": "a"}), PublishOptions::default())
        .await
        .unwrap();
    eventually(|| calls.load(Ordering::SeqCst) == 2).await;
    eventually(|| broker.unacked_count() == 0).await;

    assert_eq!(broker.queue_depth("transient"), Some(0));
    assert_eq!(broker.queue_depth("error-bus"), Some(0));
    assert!(bus.subscriptions().contains("transient", true));
}

#[tokio::test]
async fn replaced_logger_reaches_running_subscriptions() {
    let broker = MemoryBroker::new();
    let config = BunnyConfig {
        max_retry_count: 1,
        ..Default::default()
    };
    let bus = BunnyBus::with_connector(config, Arc::new(broker.clone()));
    bus.subscribe(
        "logged",
        Handlers::new().on(
            "a",
            handler(|_incoming: Incoming| async { Err(BunnyError::Handler("boom".into())) }),
        ),
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let mut levels: HashMap<Level, LogCallback> = HashMap::new();
    for level in REQUIRED_LEVELS {
        let sink = errors.clone();
        levels.insert(
            level,
            Box::new(move |message: &str| {
                if level == Level::Error {
                    sink.lock().unwrap().push(message.to_owned());
                }
            }),
        );
    }
    bus.set_logger(Arc::new(CallbackLogger::from_levels(levels).unwrap()));

    bus.publish(json!({"event": "a"}), PublishOptions::default())
        .await
        .unwrap();
    eventually(|| {
        errors
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.contains("handler failed on queue logged"))
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn subscription_removed_during_recovery_is_not_reported_recovered() {
    let broker = MemoryBroker::new();
    let config = BunnyConfig {
        max_connection_retry_count: 3,
        ..Default::default()
    };
    let bus = BunnyBus::with_connector(config, Arc::new(broker.clone()));
    let mut events = bus.events();
    bus.subscribe(
        "short-lived",
        Handlers::new().on("a", counting(Arc::new(AtomicUsize::new(0)))),
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    broker.refuse_connections(3);
    broker.drop_connections();
    next_event(&mut events, |e| matches!(e, BusEvent::Recovering { .. })).await;
    assert_eq!(bus.unsubscribe("short-lived", true).await, Ok(true));

    tokio::time::sleep(Duration::from_secs(60)).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(!seen
        .iter()
        .any(|e| matches!(e, BusEvent::Recovered { .. } | BusEvent::RecoveryFailed { .. })));
    assert!(!bus.subscriptions().contains("short-lived", false));
}

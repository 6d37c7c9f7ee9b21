//! Correlation engine behavior against the in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use usermgmt_harness::bus::{InMemoryBus, MessageBus, SubscribeOptions};
use usermgmt_harness::correlation::{
    CorrelationEngine, MatchPredicate, Subscription, match_channel,
};
use usermgmt_harness::error::HarnessError;
use usermgmt_harness::events::{SUBJECT_USER_CREATED, encode_message};

use crate::common::{self, ORG, TestEnv};

fn engine() -> (Arc<InMemoryBus>, CorrelationEngine<InMemoryBus>) {
    let bus = Arc::new(InMemoryBus::new());
    let engine = CorrelationEngine::new(Arc::clone(&bus));
    (bus, engine)
}

fn student_message(name: &str) -> Vec<u8> {
    let event = common::student_event(&format!("id-{}", name), name);
    encode_message(&event, ORG, "publisher").unwrap()
}

/// Wait until the subscription's handler has seen `count` messages.
async fn settle(subscription: &Subscription, count: u64) {
    for _ in 0..500 {
        if subscription.stats().received >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!(
        "subscription saw {} of {} message(s)",
        subscription.stats().received,
        count
    );
}

#[tokio::test]
async fn test_messages_before_watermark_are_never_delivered() {
    common::init_logging();
    let (bus, engine) = engine();
    let (sender, mut receiver) = match_channel(4);

    let stale = Utc::now() - chrono::Duration::hours(1);
    bus.publish_at(SUBJECT_USER_CREATED, student_message("user-old"), stale)
        .unwrap();

    let subscription = engine
        .subscribe(
            SUBJECT_USER_CREATED,
            SubscribeOptions::new().start_time(Utc::now()),
            MatchPredicate::student_named("user-old"),
            &sender,
        )
        .await
        .unwrap();

    let err = receiver
        .await_match(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(subscription.stats().received, 0);

    let ack = bus
        .publish(SUBJECT_USER_CREATED, student_message("user-old"))
        .await
        .unwrap();
    let matched = receiver.await_match(Duration::from_secs(2)).await.unwrap();
    assert_eq!(matched.sequence, ack.sequence);
    assert!(matched.published_at >= subscription.watermark());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    common::init_logging();
    let (bus, engine) = engine();
    let (sender, _receiver) = match_channel(1);

    let subscription = engine
        .subscribe(
            SUBJECT_USER_CREATED,
            SubscribeOptions::new(),
            MatchPredicate::student_named("user-1"),
            &sender,
        )
        .await
        .unwrap();
    assert_eq!(bus.subscriber_count(SUBJECT_USER_CREATED), 1);

    subscription.close().unwrap();
    subscription.close().unwrap();
    assert!(subscription.is_closed());
    assert_eq!(bus.subscriber_count(SUBJECT_USER_CREATED), 0);
}

#[tokio::test]
async fn test_predicate_panic_is_reported_to_the_waiter() {
    common::init_logging();
    let (bus, engine) = engine();
    let (sender, mut receiver) = match_channel(1);

    let _subscription = engine
        .subscribe(
            SUBJECT_USER_CREATED,
            SubscribeOptions::new(),
            MatchPredicate::new("exploding predicate", |_| panic!("boom")),
            &sender,
        )
        .await
        .unwrap();
    bus.publish(SUBJECT_USER_CREATED, student_message("user-1"))
        .await
        .unwrap();

    match receiver.await_match(Duration::from_secs(2)).await {
        Err(HarnessError::PredicatePanicked {
            subject,
            predicate,
            message,
        }) => {
            assert_eq!(subject, SUBJECT_USER_CREATED);
            assert_eq!(predicate, "exploding predicate");
            assert!(message.contains("boom"));
        }
        other => panic!("expected PredicatePanicked, got {:?}", other),
    }
}

#[tokio::test]
async fn test_undecodable_message_does_not_end_the_subscription() {
    common::init_logging();
    let (bus, engine) = engine();
    let (sender, mut receiver) = match_channel(1);

    let subscription = engine
        .subscribe(
            SUBJECT_USER_CREATED,
            SubscribeOptions::new(),
            MatchPredicate::student_named("user-7"),
            &sender,
        )
        .await
        .unwrap();

    bus.publish(SUBJECT_USER_CREATED, b"definitely not an envelope".to_vec())
        .await
        .unwrap();
    bus.publish(SUBJECT_USER_CREATED, student_message("user-7"))
        .await
        .unwrap();

    let matched = receiver.await_match(Duration::from_secs(2)).await.unwrap();
    assert_eq!(matched.event.student_name(), "user-7");
    assert_eq!(receiver.decode_failures(), 1);
    assert_eq!(subscription.stats().decode_failures, 1);
}

#[tokio::test]
async fn test_timeout_counts_undecodable_messages() {
    common::init_logging();
    let (bus, engine) = engine();
    let (sender, mut receiver) = match_channel(1);

    let subscription = engine
        .subscribe(
            SUBJECT_USER_CREATED,
            SubscribeOptions::new(),
            MatchPredicate::student_named("user-8"),
            &sender,
        )
        .await
        .unwrap();
    bus.publish(SUBJECT_USER_CREATED, b"{}".to_vec()).await.unwrap();
    settle(&subscription, 1).await;

    match receiver.await_match(Duration::from_millis(100)).await {
        Err(HarnessError::Timeout {
            decode_failures, ..
        }) => assert_eq!(decode_failures, 1),
        other => panic!("expected Timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_reports_matches_dropped_on_a_full_channel() {
    common::init_logging();
    let (bus, engine) = engine();
    let (sender, mut receiver) = match_channel(1);
    let mut subscriptions = Vec::new();
    for name in ["user-a", "user-b"] {
        let subscription = engine
            .subscribe(
                SUBJECT_USER_CREATED,
                SubscribeOptions::new(),
                MatchPredicate::student_named(name),
                &sender,
            )
            .await
            .unwrap();
        subscriptions.push(subscription);
    }

    bus.publish(SUBJECT_USER_CREATED, student_message("user-a"))
        .await
        .unwrap();
    bus.publish(SUBJECT_USER_CREATED, student_message("user-b"))
        .await
        .unwrap();
    for subscription in &subscriptions {
        settle(subscription, 2).await;
    }
    for _ in 0..500 {
        if receiver.dropped_matches() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(receiver.dropped_matches(), 1);

    let err = receiver
        .await_matches(2, Duration::from_millis(100))
        .await
        .unwrap_err();
    match &err {
        HarnessError::Timeout {
            dropped_matches, ..
        } => assert_eq!(*dropped_matches, 1),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert!(err.to_string().contains("1 match(es) dropped"), "{}", err);
}

#[tokio::test(start_paused = true)]
async fn test_wait_gives_up_exactly_at_the_deadline() {
    let (_bus, engine) = engine();
    let (sender, mut receiver) = match_channel(1);
    let _subscription = engine
        .subscribe(
            SUBJECT_USER_CREATED,
            SubscribeOptions::new(),
            MatchPredicate::student_named("user-never"),
            &sender,
        )
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let err = receiver
        .await_match(Duration::from_secs(3))
        .await
        .unwrap_err();

    assert_eq!(started.elapsed(), Duration::from_secs(3));
    match err {
        HarnessError::Timeout {
            subjects, elapsed, ..
        } => {
            assert_eq!(subjects, vec![SUBJECT_USER_CREATED.to_string()]);
            assert_eq!(elapsed, Duration::from_secs(3));
        }
        other => panic!("expected Timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rejected_subscription_stops_the_step_before_the_rpc() {
    common::init_logging();
    let env = TestEnv::new();
    let mut state = env.signed_in();
    env.bus.reject_subscriptions(Some("consumer limit reached".to_string()));

    let err = env
        .harness
        .create_student(&mut state, None)
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Subscribe { .. }), "{:?}", err);
    assert!(state.request.is_none());
    assert!(env.bus.messages(SUBJECT_USER_CREATED).is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_a_subscription_delivers_at_most_one_match(count in 1u64..12) {
        tokio_test::block_on(async move {
            let (bus, engine) = engine();
            let (sender, mut receiver) = match_channel(16);
            let subscription = engine
                .subscribe(
                    SUBJECT_USER_CREATED,
                    SubscribeOptions::new(),
                    MatchPredicate::student_named("user-dup"),
                    &sender,
                )
                .await
                .unwrap();

            for _ in 0..count {
                bus.publish(SUBJECT_USER_CREATED, student_message("user-dup"))
                    .await
                    .unwrap();
            }
            settle(&subscription, count).await;

            receiver.await_match(Duration::from_secs(1)).await.unwrap();
            assert!(receiver.try_next().is_none());
            assert!(subscription.is_matched());

            let stats = subscription.stats();
            assert_eq!(stats.matched, 1);
            assert_eq!(stats.received, count);
            assert_eq!(stats.dropped, 0);
        });
    }
}

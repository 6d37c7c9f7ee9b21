//! End-to-end workflow scenarios.

use futures::future::join_all;

use usermgmt_harness::api::{StatusCode, WorkflowResponse};
use usermgmt_harness::bus::MessageBus;
use usermgmt_harness::error::HarnessError;
use usermgmt_harness::events::{EventKind, SUBJECT_USER_CREATED, UserEvent, encode_message};
use usermgmt_harness::steps::builders;

use usermgmt_harness::config::HarnessConfig;

use crate::common::{self, ORG, TestEnv};

#[tokio::test]
async fn test_create_student_event_and_rows_agree() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    harness.create_student(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();

    let matched = harness.await_event(&mut state).await.unwrap();
    let Some(WorkflowResponse::CreateStudent(response)) = &state.response else {
        panic!("expected a CreateStudent response, got {:?}", state.response);
    };
    assert_eq!(matched.event.kind(), EventKind::CreateStudent);
    assert_eq!(matched.event.student_id(), response.student_id);
    assert_eq!(matched.resource_path, ORG);
    assert_eq!(matched.subject, SUBJECT_USER_CREATED);

    harness.verify_event(&matched).await.unwrap();
    harness.verify_persisted(&state).await.unwrap();

    harness.finish_scenario(&mut state).unwrap();
    assert_eq!(env.bus.subscriber_count(SUBJECT_USER_CREATED), 0);
}

#[tokio::test]
async fn test_lost_event_times_out_naming_subject_and_student() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();
    env.service.set_publish_events(false);

    let request = builders::student_request_named(harness.defaults(), "user-42");
    harness.create_student(&mut state, Some(request)).await.unwrap();
    harness.assert_success(&state).unwrap();

    // Somebody else's student lands on the subject while we wait
    let other = common::student_event("student-99", "user-99");
    let data = encode_message(&other, ORG, "someone-else").unwrap();
    env.bus.publish(SUBJECT_USER_CREATED, data).await.unwrap();

    let err = harness.await_event(&mut state).await.unwrap_err();
    assert!(err.is_timeout(), "expected a timeout, got {:?}", err);
    match &err {
        HarnessError::Timeout {
            subjects,
            expectation,
            decode_failures,
            ..
        } => {
            assert!(subjects.iter().any(|s| s == SUBJECT_USER_CREATED));
            assert!(expectation.contains("user-42"), "{}", expectation);
            assert!(!expectation.contains("user-99"), "{}", expectation);
            assert_eq!(*decode_failures, 0);
        }
        other => panic!("expected Timeout, got {:?}", other),
    }
    let text = err.to_string();
    assert!(text.contains(SUBJECT_USER_CREATED));
    assert!(text.contains("user-42"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_scenarios_only_see_their_own_events() {
    common::init_logging();
    let env = TestEnv::new();

    let runs = (0..2).map(|i| {
        let harness = env.harness.clone();
        let name = format!("user-concurrent-{}-{}", i, builders::new_id());
        async move {
            let mut state = harness.begin_scenario(ORG);
            state.auth_token = Some(format!("token-{}", i));
            let request = builders::student_request_named(harness.defaults(), &name);
            harness.create_student(&mut state, Some(request)).await?;
            harness.assert_success(&state)?;
            let matched = harness.await_event(&mut state).await?;
            harness.verify_event(&matched).await?;
            harness.verify_persisted(&state).await?;
            harness.finish_scenario(&mut state)?;
            Ok::<_, HarnessError>((name, matched))
        }
    });

    let results = join_all(runs).await;
    for result in results {
        let (name, matched) = result.unwrap();
        assert_eq!(matched.event.student_name(), name);
    }
    assert_eq!(env.bus.messages(SUBJECT_USER_CREATED).len(), 2);
}

#[tokio::test]
async fn test_more_parents_than_channel_capacity_are_all_matched() {
    common::init_logging();
    let config = HarnessConfig::builder()
        .with_event_deadline(std::time::Duration::from_millis(500))
        .with_match_channel_capacity(4)
        .build()
        .unwrap();
    let env = TestEnv::with_config(config);
    let harness = &env.harness;
    let mut state = env.signed_in();

    harness.create_student(&mut state, None).await.unwrap();
    harness.await_event(&mut state).await.unwrap();
    let student_id = state.current_student_id.clone().unwrap();

    let mut request = builders::parents_request(harness.defaults(), &student_id);
    request.parent_profiles = (0..6)
        .map(|_| builders::parent_profile(harness.defaults()))
        .collect();
    harness.create_parents(&mut state, Some(request)).await.unwrap();
    harness.assert_success(&state).unwrap();
    assert_eq!(state.parent_ids.len(), 6);

    let events = harness.await_events(&mut state).await.unwrap();
    assert_eq!(events.len(), 6);
    for event in &events {
        assert_eq!(event.event.kind(), EventKind::CreateParent);
        harness.verify_event(event).await.unwrap();
    }
    harness.verify_persisted(&state).await.unwrap();
}

#[tokio::test]
async fn test_parents_of_a_new_student_are_announced_and_stored() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    harness.create_parents(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    assert!(state.current_student_id.is_some());
    assert_eq!(state.parent_ids.len(), 1);

    let events = harness.await_events(&mut state).await.unwrap();
    assert_eq!(events.len(), 1);
    match &events[0].event {
        UserEvent::CreateParent(parent) => {
            assert_eq!(Some(&parent.student_id), state.current_student_id.as_ref());
            assert_eq!(parent.parent_id, state.parent_ids[0]);
        }
        other => panic!("expected CreateParent, got {:?}", other),
    }
    harness.verify_event(&events[0]).await.unwrap();
    harness.verify_persisted(&state).await.unwrap();

    harness.update_parents(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    let updated = harness.await_events(&mut state).await.unwrap();
    assert_eq!(updated[0].event.kind(), EventKind::UpdateParent);
    harness.verify_persisted(&state).await.unwrap();
}

#[tokio::test]
async fn test_update_student_after_create() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    harness.create_student(&mut state, None).await.unwrap();
    harness.await_event(&mut state).await.unwrap();

    harness.update_student(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    let matched = harness.await_event(&mut state).await.unwrap();
    assert_eq!(matched.event.kind(), EventKind::UpdateStudent);
    harness.verify_event(&matched).await.unwrap();
    harness.verify_persisted(&state).await.unwrap();
}

#[tokio::test]
async fn test_invalid_request_is_rejected_without_an_event() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    let mut request = builders::student_request(harness.defaults());
    request.student_profile.location_ids = vec!["unknown-location".to_string()];
    harness.create_student(&mut state, Some(request)).await.unwrap();

    harness
        .assert_status(&state, StatusCode::InvalidArgument)
        .unwrap();
    assert!(env.bus.messages(SUBJECT_USER_CREATED).is_empty());
    assert!(harness.await_event(&mut state).await.unwrap_err().is_timeout());
}

#[tokio::test]
async fn test_tampered_row_is_reported_as_mismatch() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    harness.create_student(&mut state, None).await.unwrap();
    let student_id = state.current_student_id.clone().unwrap();

    let mut row = harness.verifier().user(ORG, &student_id).await.unwrap();
    row.name = "someone else".to_string();
    usermgmt_harness::storage::put_row(&*env.storage, row.key(), &row)
        .await
        .unwrap();

    let err = harness.verify_persisted(&state).await.unwrap_err();
    assert!(
        matches!(err, HarnessError::VerificationMismatch { .. }),
        "expected mismatch, got {:?}",
        err
    );
}

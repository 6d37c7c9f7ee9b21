//! Staff, user group and parent import workflows.

use usermgmt_harness::api::{StatusCode, WorkflowResponse};
use usermgmt_harness::error::HarnessError;
use usermgmt_harness::events::{EventKind, SUBJECT_USER_CREATED};
use usermgmt_harness::steps::{BuilderDefaults, builders};
use usermgmt_harness::storage::rows::{StaffRow, tables};
use usermgmt_harness::storage::{StorageKey, find_rows};

use crate::common::{self, ORG, TestEnv};

#[tokio::test]
async fn test_user_group_create_then_update() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    harness.create_user_group(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    harness.verify_persisted(&state).await.unwrap();
    let group_id = state.current_user_group_id.clone().unwrap();

    harness.update_user_group(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    harness.verify_persisted(&state).await.unwrap();
    assert_eq!(state.current_user_group_id.as_deref(), Some(group_id.as_str()));
}

#[tokio::test]
async fn test_user_group_with_unknown_role_is_rejected() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    let mut request = builders::user_group_request(harness.defaults());
    request.role_with_locations[0].role_name = "Wizard".to_string();
    harness.create_user_group(&mut state, Some(request)).await.unwrap();
    harness
        .assert_status(&state, StatusCode::InvalidArgument)
        .unwrap();
}

#[tokio::test]
async fn test_system_group_cannot_be_renamed() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    // Creating a student brings the student system group into existence
    harness.create_student(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();

    let request = builders::update_user_group_request(harness.defaults(), "system-student");
    harness.update_user_group(&mut state, Some(request)).await.unwrap();
    harness
        .assert_status(&state, StatusCode::PermissionDenied)
        .unwrap();
}

#[tokio::test]
async fn test_staff_create_then_update() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    harness.create_staff(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    harness.verify_persisted(&state).await.unwrap();

    harness.update_staff(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    harness.verify_persisted(&state).await.unwrap();
}

#[tokio::test]
async fn test_staff_in_unknown_group_is_rejected() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    let request = builders::staff_request(harness.defaults(), vec!["no-such-group".to_string()]);
    harness.create_staff(&mut state, Some(request)).await.unwrap();
    harness
        .assert_status(&state, StatusCode::InvalidArgument)
        .unwrap();
    assert!(state.current_staff_id.is_none());
}

#[tokio::test]
async fn test_failed_prerequisite_skips_the_parents_rpc() {
    common::init_logging();
    let env = TestEnv::new();
    // Students need a location; these defaults have none
    let harness = env.harness.clone().with_defaults(BuilderDefaults::default());
    let mut state = env.signed_in();

    let err = harness.create_parents(&mut state, None).await.unwrap_err();
    match &err {
        HarnessError::Prerequisite { what, source } => {
            assert_eq!(what, "student");
            match source.as_ref() {
                HarnessError::Rpc { method, status } => {
                    assert_eq!(method, "CreateStudent");
                    assert_eq!(status.code, StatusCode::InvalidArgument);
                }
                other => panic!("expected Rpc source, got {:?}", other),
            }
        }
        other => panic!("expected Prerequisite, got {:?}", other),
    }
    assert!(state.request.is_none());
    assert!(state.current_student_id.is_none());
    assert!(env.bus.messages(SUBJECT_USER_CREATED).is_empty());
}

#[tokio::test]
async fn test_failed_user_group_prerequisite_skips_the_staff_rpc() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = env.harness.clone().with_defaults(BuilderDefaults {
        role: "Wizard".to_string(),
        ..common::defaults()
    });
    let mut state = env.signed_in();

    let err = harness.create_staff(&mut state, None).await.unwrap_err();
    match &err {
        HarnessError::Prerequisite { what, source } => {
            assert_eq!(what, "user group");
            match source.as_ref() {
                HarnessError::Rpc { method, status } => {
                    assert_eq!(method, "CreateUserGroup");
                    assert_eq!(status.code, StatusCode::InvalidArgument);
                }
                other => panic!("expected Rpc source, got {:?}", other),
            }
        }
        other => panic!("expected Prerequisite, got {:?}", other),
    }
    assert!(state.request.is_none());
    assert!(state.current_staff_id.is_none());
    assert!(state.current_user_group_id.is_none());

    let staff: Vec<StaffRow> = find_rows(
        env.storage.as_ref(),
        StorageKey::prefix(ORG, tables::STAFF),
        "resource_path",
        ORG,
    )
    .await
    .unwrap();
    assert!(staff.is_empty());
}

#[tokio::test]
async fn test_import_assigns_parents_to_the_current_student() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    harness.create_student(&mut state, None).await.unwrap();
    harness.await_event(&mut state).await.unwrap();

    harness.import_parents(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    assert_eq!(state.parent_ids.len(), 1);

    let events = harness.await_events(&mut state).await.unwrap();
    assert_eq!(events[0].event.kind(), EventKind::CreateParent);
    harness.verify_event(&events[0]).await.unwrap();
    harness.verify_persisted(&state).await.unwrap();
}

#[tokio::test]
async fn test_import_with_a_bad_row_creates_nothing() {
    common::init_logging();
    let env = TestEnv::new();
    let harness = &env.harness;
    let mut state = env.signed_in();

    harness.create_student(&mut state, None).await.unwrap();
    let student_id = state.current_student_id.clone().unwrap();
    let published_before = env.bus.messages(SUBJECT_USER_CREATED).len();

    let rows = vec![
        builders::import_parent_row(&student_id),
        builders::import_parent_row("no-such-student"),
    ];
    harness.import_parents(&mut state, Some(rows)).await.unwrap();
    harness.assert_success(&state).unwrap();

    let Some(WorkflowResponse::ImportParents(response)) = &state.response else {
        panic!("expected an import response, got {:?}", state.response);
    };
    assert!(response.parent_ids.is_empty());
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].row_number, 2);
    assert!(state.parent_ids.is_empty());

    assert_eq!(env.bus.messages(SUBJECT_USER_CREATED).len(), published_before);
    assert!(harness.await_events(&mut state).await.unwrap_err().is_timeout());
}

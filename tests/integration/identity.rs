//! Identity bootstrap: tenant resolution, provisioning, login and token
//! exchange, and what the service does with the resulting token.

use std::sync::Arc;

use usermgmt_harness::api::{StatusCode, WorkflowRequest};
use usermgmt_harness::error::HarnessError;
use usermgmt_harness::identity::{
    AuthStep, Authenticator, IdentityError, SubjectIdentity, TenantSelector,
};

use crate::common::{self, IdentityEnv, ORG, TENANT};

fn assert_failed_at(err: HarnessError, expected: AuthStep) -> IdentityError {
    match err {
        HarnessError::Authentication { step, source, .. } => {
            assert_eq!(step, expected, "failed at {} ({})", step, source);
            source
        }
        other => panic!("expected Authentication error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_signed_in_scenario_calls_with_exchanged_token() {
    common::init_logging();
    let id = IdentityEnv::new().await;
    let harness = &id.env.harness;
    let mut state = id.signed_in().await;

    let credential = state.credential().unwrap().clone();
    assert_eq!(credential.tenant_id, TENANT);
    assert_eq!(state.auth_token.as_deref(), Some(credential.exchanged_token.as_str()));
    let claims = id.exchanger.validate(&credential.exchanged_token).await.unwrap();
    assert_eq!(claims.user_id, credential.user_id);
    assert_eq!(claims.applicant, common::APPLICANT);

    harness.create_student(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    let matched = harness.await_event(&mut state).await.unwrap();
    assert_eq!(matched.user_id, credential.user_id);

    // The admin and the new student
    assert_eq!(id.provider.user_count(TENANT).await, 2);
}

#[tokio::test]
async fn test_forged_token_is_unauthenticated() {
    common::init_logging();
    let id = IdentityEnv::new().await;
    let harness = &id.env.harness;
    let mut state = harness.begin_scenario(ORG);
    state.auth_token = Some("forged".to_string());

    harness.create_student(&mut state, None).await.unwrap();
    harness
        .assert_status(&state, StatusCode::Unauthenticated)
        .unwrap();
}

#[tokio::test]
async fn test_unknown_organization_fails_tenant_resolution() {
    common::init_logging();
    let id = IdentityEnv::new().await;
    id.directory.remove_tenant(ORG).await;

    let err = id
        .authenticator
        .authenticate(&TenantSelector::new(ORG), &SubjectIdentity::generate("admin"))
        .await
        .unwrap_err();
    let source = assert_failed_at(err, AuthStep::ResolveTenant);
    assert!(matches!(source, IdentityError::TenantNotFound { .. }));
}

#[tokio::test]
async fn test_provisioning_outage_fails_provision_step() {
    common::init_logging();
    let id = IdentityEnv::new().await;
    id.provider
        .fail_provisioning(Some(IdentityError::Unavailable {
            message: "identity platform down".to_string(),
        }))
        .await;

    let mut state = id.env.harness.begin_scenario(ORG);
    let err = id
        .env
        .harness
        .sign_in(&mut state, &id.authenticator, &SubjectIdentity::generate("admin"))
        .await
        .unwrap_err();
    assert_failed_at(err, AuthStep::ProvisionUser);
    assert!(state.auth_token.is_none());
    assert_eq!(id.provider.user_count(TENANT).await, 0);
}

#[tokio::test]
async fn test_wrong_password_fails_provider_login() {
    common::init_logging();
    let id = IdentityEnv::new().await;
    let selector = TenantSelector::new(ORG);
    let admin = SubjectIdentity::generate("admin");
    id.authenticator.authenticate(&selector, &admin).await.unwrap();

    let impostor = SubjectIdentity {
        password: "not-the-password".to_string(),
        ..admin.clone()
    };
    let err = id
        .authenticator
        .authenticate(&selector, &impostor)
        .await
        .unwrap_err();
    let source = assert_failed_at(err, AuthStep::ProviderLogin);
    assert!(matches!(source, IdentityError::InvalidCredentials { .. }));
}

#[tokio::test]
async fn test_unknown_applicant_fails_token_exchange() {
    common::init_logging();
    let id = IdentityEnv::new().await;
    let stranger = Authenticator::new(
        Arc::clone(&id.directory),
        Arc::clone(&id.provider),
        Arc::clone(&id.exchanger),
        "stranger-app",
    );

    let err = stranger
        .authenticate(&TenantSelector::new(ORG), &SubjectIdentity::generate("admin"))
        .await
        .unwrap_err();
    let source = assert_failed_at(err, AuthStep::TokenExchange);
    assert!(matches!(source, IdentityError::ApplicantRejected { .. }));
}

#[tokio::test]
async fn test_refresh_issues_a_new_exchanged_token() {
    common::init_logging();
    let id = IdentityEnv::new().await;
    let state = id.signed_in().await;
    let mut credential = state.credential().unwrap().clone();
    let before = credential.exchanged_token.clone();

    id.authenticator.refresh(&mut credential).await.unwrap();

    assert_ne!(credential.exchanged_token, before);
    assert!(id.exchanger.validate(&credential.exchanged_token).await.is_some());
}

#[tokio::test]
async fn test_reissued_password_replaces_the_old_one() {
    common::init_logging();
    let id = IdentityEnv::new().await;
    let harness = &id.env.harness;
    let mut state = id.signed_in().await;

    harness.create_student(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    let Some(WorkflowRequest::CreateStudent(created)) = state.request.clone() else {
        panic!("expected a CreateStudent request");
    };
    let student_id = state.current_student_id.clone().unwrap();

    harness.reissue_password(&mut state, None).await.unwrap();
    harness.assert_success(&state).unwrap();
    harness.verify_persisted(&state).await.unwrap();
    harness
        .verify_reissued_password(&state, &id.authenticator)
        .await
        .unwrap();

    let old = SubjectIdentity {
        user_id: student_id,
        email: created.student_profile.email.clone(),
        password: created.student_profile.password.clone(),
        display_name: created.student_profile.full_name(),
    };
    let err = id
        .authenticator
        .authenticate(&TenantSelector::new(ORG), &old)
        .await
        .unwrap_err();
    assert_failed_at(err, AuthStep::ProviderLogin);
}

#[tokio::test]
async fn test_reissue_for_unknown_user_is_not_found() {
    common::init_logging();
    let id = IdentityEnv::new().await;
    let harness = &id.env.harness;
    let mut state = id.signed_in().await;

    let request = usermgmt_harness::steps::builders::reissue_password_request("no-such-user");
    harness.reissue_password(&mut state, Some(request)).await.unwrap();
    harness.assert_status(&state, StatusCode::NotFound).unwrap();
}

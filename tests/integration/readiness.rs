//! Readiness waits before a scenario runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use usermgmt_harness::error::HarnessError;
use usermgmt_harness::readiness::ConnectivityState;

use crate::common::{self, TestEnv};

#[tokio::test(start_paused = true)]
async fn test_ready_bus_passes_immediately() {
    let env = TestEnv::new();
    let started = Instant::now();
    env.harness.ensure_ready(&*env.bus).await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_shut_down_bus_exhausts_the_budget() {
    common::init_logging();
    let env = TestEnv::new();
    env.bus.set_connectivity_state(ConnectivityState::Shutdown);

    let started = Instant::now();
    let err = env.harness.ensure_ready(&*env.bus).await.unwrap_err();

    // Three checks, two 10ms sleeps between them
    assert_eq!(started.elapsed(), Duration::from_millis(20));
    match err {
        HarnessError::NotReady {
            attempts,
            last_state,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_state, ConnectivityState::Shutdown);
        }
        other => panic!("expected NotReady, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_bus_that_comes_up_is_waited_for() {
    common::init_logging();
    let env = TestEnv::new();
    env.bus.set_connectivity_state(ConnectivityState::Connecting);

    let bus = Arc::clone(&env.bus);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(15)).await;
        bus.set_connectivity_state(ConnectivityState::Ready);
    });

    let started = Instant::now();
    env.harness.ensure_ready(&*env.bus).await.unwrap();
    assert_eq!(started.elapsed(), Duration::from_millis(20));
}

#[tokio::test]
async fn test_steps_fail_while_the_bus_is_down() {
    common::init_logging();
    let env = TestEnv::new();
    let mut state = env.signed_in();
    env.bus
        .set_connectivity_state(ConnectivityState::TransientFailure);

    let err = env
        .harness
        .create_student(&mut state, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Subscribe { .. }), "{:?}", err);
}

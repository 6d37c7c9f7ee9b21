//! Shared fixtures for integration tests.

use std::sync::Arc;
use std::time::Duration;

use usermgmt_harness::api::InMemoryUserService;
use usermgmt_harness::bus::InMemoryBus;
use usermgmt_harness::config::HarnessConfig;
use usermgmt_harness::events::{StudentEvent, UserEvent};
use usermgmt_harness::identity::{
    Authenticator, InMemoryIdentityProvider, InMemoryTokenExchanger, StaticTenantDirectory,
    SubjectIdentity,
};
use usermgmt_harness::state::ScenarioState;
use usermgmt_harness::steps::{BuilderDefaults, Harness};
use usermgmt_harness::storage::InMemoryStorage;

pub const ORG: &str = "org-1";
pub const TENANT: &str = "tenant-1";
pub const LOCATION: &str = "loc-1";
pub const TAG: &str = "tag-1";
pub const APPLICANT: &str = "usermgmt-harness";

pub type TestService = InMemoryUserService<InMemoryBus, InMemoryStorage>;
pub type TestHarness = Harness<InMemoryBus, TestService, InMemoryStorage>;
pub type TestAuthenticator =
    Authenticator<StaticTenantDirectory, InMemoryIdentityProvider, InMemoryTokenExchanger>;

/// Route `log` output through the test harness. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

/// A short deadline so negative cases fail fast.
pub fn test_config() -> HarnessConfig {
    HarnessConfig::builder()
        .with_event_deadline(Duration::from_millis(500))
        .with_ack_wait(Duration::from_millis(100))
        .with_readiness(3, Duration::from_millis(10))
        .build()
        .expect("test config is valid")
}

pub fn defaults() -> BuilderDefaults {
    BuilderDefaults {
        location_ids: vec![LOCATION.to_string()],
        tag_ids: vec![TAG.to_string()],
        ..BuilderDefaults::default()
    }
}

/// Everything one test needs, sharing a single bus and store.
pub struct TestEnv {
    pub bus: Arc<InMemoryBus>,
    pub storage: Arc<InMemoryStorage>,
    pub service: Arc<TestService>,
    pub harness: TestHarness,
}

impl TestEnv {
    /// Service and harness without an identity platform; any non-empty
    /// token is accepted.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: HarnessConfig) -> Self {
        let bus = Arc::new(InMemoryBus::new());
        let storage = Arc::new(InMemoryStorage::new());
        let service = Arc::new(
            InMemoryUserService::new(Arc::clone(&bus), Arc::clone(&storage))
                .with_locations([LOCATION])
                .with_tags([TAG]),
        );
        let harness = Harness::new(
            Arc::clone(&bus),
            Arc::clone(&service),
            Arc::clone(&storage),
            config,
        )
        .expect("harness config is valid")
        .with_defaults(defaults());
        Self {
            bus,
            storage,
            service,
            harness,
        }
    }

    /// A scenario in [`ORG`] holding a placeholder token.
    pub fn signed_in(&self) -> ScenarioState {
        let mut state = self.harness.begin_scenario(ORG);
        state.auth_token = Some(format!("token-{}", state.scenario_id()));
        state
    }
}

/// The identity platform and a service that only accepts exchanged tokens.
pub struct IdentityEnv {
    pub directory: Arc<StaticTenantDirectory>,
    pub provider: Arc<InMemoryIdentityProvider>,
    pub exchanger: Arc<InMemoryTokenExchanger>,
    pub authenticator: TestAuthenticator,
    pub env: TestEnv,
}

impl IdentityEnv {
    pub async fn new() -> Self {
        let directory = Arc::new(StaticTenantDirectory::new());
        directory.add_tenant(ORG, TENANT).await;

        let provider = Arc::new(InMemoryIdentityProvider::new());
        let exchanger = Arc::new(InMemoryTokenExchanger::new(Arc::clone(&provider)));
        exchanger.allow_applicant(APPLICANT).await;

        let authenticator = Authenticator::new(
            Arc::clone(&directory),
            Arc::clone(&provider),
            Arc::clone(&exchanger),
            APPLICANT,
        );

        let bus = Arc::new(InMemoryBus::new());
        let storage = Arc::new(InMemoryStorage::new());
        let service = Arc::new(
            InMemoryUserService::new(Arc::clone(&bus), Arc::clone(&storage))
                .with_locations([LOCATION])
                .with_tags([TAG])
                .with_identity_provider(Arc::clone(&provider), TENANT)
                .with_token_validator(Arc::clone(&exchanger)),
        );
        let harness = Harness::new(
            Arc::clone(&bus),
            Arc::clone(&service),
            Arc::clone(&storage),
            test_config(),
        )
        .expect("harness config is valid")
        .with_defaults(defaults());

        Self {
            directory,
            provider,
            exchanger,
            authenticator,
            env: TestEnv {
                bus,
                storage,
                service,
                harness,
            },
        }
    }

    /// A scenario in [`ORG`] signed in as a freshly generated school admin.
    pub async fn signed_in(&self) -> ScenarioState {
        let mut state = self.env.harness.begin_scenario(ORG);
        let admin = SubjectIdentity::generate("school-admin");
        self.env
            .harness
            .sign_in(&mut state, &self.authenticator, &admin)
            .await
            .expect("sign in succeeds");
        state
    }
}

pub fn student_event(student_id: &str, name: &str) -> UserEvent {
    UserEvent::CreateStudent(StudentEvent {
        student_id: student_id.to_string(),
        student_name: name.to_string(),
        student_first_name: String::new(),
        student_last_name: String::new(),
        location_ids: vec![LOCATION.to_string()],
        tag_ids: Vec::new(),
    })
}

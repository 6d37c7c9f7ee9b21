//! Scenario steps.
//!
//! [`Harness`] bundles the shared collaborators (bus, API client, store) and
//! exposes one async method per scenario step. Every step takes the
//! scenario's `&mut ScenarioState`, so steps of one scenario are sequential
//! while a cloned `Harness` can drive many scenarios at once.
//!
//! A workflow step follows the same shape each time:
//!
//! 1. build the request, or take the caller's;
//! 2. subscribe predicates keyed on the request's identifying fields, with
//!    the watermark set to now;
//! 3. invoke the RPC and record the request and its outcome in the state.
//!
//! RPC failures are recorded, not returned: a later step asserts on them
//! with [`Harness::assert_success`] or [`Harness::assert_status`].
//!
//! ```rust
//! use std::sync::Arc;
//! use usermgmt_harness::api::InMemoryUserService;
//! use usermgmt_harness::bus::InMemoryBus;
//! use usermgmt_harness::config::HarnessConfig;
//! use usermgmt_harness::steps::{BuilderDefaults, Harness};
//! use usermgmt_harness::storage::InMemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(InMemoryBus::new());
//! let storage = Arc::new(InMemoryStorage::new());
//! let api = Arc::new(
//!     InMemoryUserService::new(Arc::clone(&bus), Arc::clone(&storage)).with_locations(["loc-1"]),
//! );
//! let defaults = BuilderDefaults {
//!     location_ids: vec!["loc-1".to_string()],
//!     ..BuilderDefaults::default()
//! };
//! let harness = Harness::new(bus, api, storage, HarnessConfig::default())?.with_defaults(defaults);
//!
//! let mut state = harness.begin_scenario("org-1");
//! state.auth_token = Some("token".to_string());
//! harness.create_student(&mut state, None).await?;
//! harness.assert_success(&state)?;
//! let event = harness.await_event(&mut state).await?;
//! harness.verify_event(&event).await?;
//! harness.verify_persisted(&state).await?;
//! harness.finish_scenario(&mut state)?;
//! # Ok(())
//! # }
//! ```

pub mod builders;

pub use builders::BuilderDefaults;

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};

use crate::api::{
    CreateParentsRequest, CreateStaffRequest, CreateStudentRequest, CreateUserGroupRequest,
    ImportParentRow, ImportParentsRequest, ReissueUserPasswordRequest, StatusCode,
    UpdateParentsRequest, UpdateStaffRequest, UpdateStudentRequest, UpdateUserGroupRequest,
    UserManagementApi, WorkflowRequest, WorkflowResponse,
};
use crate::bus::MessageBus;
use crate::config::HarnessConfig;
use crate::correlation::{CorrelationEngine, MatchPredicate, MatchedEvent};
use crate::error::{HarnessError, HarnessResult};
use crate::events::EventKind;
use crate::identity::{
    Authenticator, IdentityProvider, SubjectIdentity, TenantDirectory, TenantSelector,
    TokenExchanger,
};
use crate::readiness::{ReadinessProbe, wait_until_ready};
use crate::state::ScenarioState;
use crate::storage::StorageProvider;
use crate::verification::Verifier;

/// Shared scenario driver.
pub struct Harness<B, A, S> {
    engine: CorrelationEngine<B>,
    api: Arc<A>,
    verifier: Verifier<S>,
    config: HarnessConfig,
    defaults: BuilderDefaults,
}

impl<B, A, S> Clone for Harness<B, A, S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            api: Arc::clone(&self.api),
            verifier: self.verifier.clone(),
            config: self.config.clone(),
            defaults: self.defaults.clone(),
        }
    }
}

impl<B, A, S> Harness<B, A, S>
where
    B: MessageBus,
    A: UserManagementApi,
    S: StorageProvider,
{
    /// # Errors
    /// Returns [`HarnessError::InvalidConfiguration`] if `config` is invalid.
    pub fn new(bus: Arc<B>, api: Arc<A>, storage: Arc<S>, config: HarnessConfig) -> HarnessResult<Self> {
        config.validate()?;
        Ok(Self {
            engine: CorrelationEngine::new(bus),
            api,
            verifier: Verifier::new(storage),
            config,
            defaults: BuilderDefaults::default(),
        })
    }

    pub fn with_defaults(mut self, defaults: BuilderDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub fn engine(&self) -> &CorrelationEngine<B> {
        &self.engine
    }

    pub fn verifier(&self) -> &Verifier<S> {
        &self.verifier
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn defaults(&self) -> &BuilderDefaults {
        &self.defaults
    }

    pub fn begin_scenario(&self, organization: impl Into<String>) -> ScenarioState {
        ScenarioState::new(organization)
    }

    /// Block until `peer` is usable, within the configured readiness budget.
    pub async fn ensure_ready<P: ReadinessProbe>(&self, peer: &P) -> HarnessResult<()> {
        let policy = self.config.retry_policy()?;
        wait_until_ready(peer, &policy).await
    }

    /// Sign `identity` into the scenario's organization.
    pub async fn sign_in<T, P, X>(
        &self,
        state: &mut ScenarioState,
        authenticator: &Authenticator<T, P, X>,
        identity: &SubjectIdentity,
    ) -> HarnessResult<()>
    where
        T: TenantDirectory,
        P: IdentityProvider,
        X: TokenExchanger,
    {
        let selector = TenantSelector::new(state.organization.clone());
        let credential = authenticator.authenticate(&selector, identity).await?;
        state.sign_in(credential);
        Ok(())
    }

    /// Replace the scenario's match channel and subscribe one predicate per
    /// expected event on every configured subject.
    ///
    /// Each predicate is scoped to `kind` and to the scenario's organization.
    /// The channel holds at least one match per predicate, since matches
    /// arrive while the RPC is still running.
    pub async fn expect_events(
        &self,
        state: &mut ScenarioState,
        kind: EventKind,
        predicates: Vec<MatchPredicate>,
    ) -> HarnessResult<()> {
        let capacity = self.config.match_channel_capacity.max(predicates.len());
        let sender = state.reset_match_channel(capacity);
        let options = self.config.subscribe_options(Utc::now());
        state.expected_events = predicates.len();

        for predicate in predicates {
            let predicate = MatchPredicate::kind(kind)
                .and(predicate)
                .in_resource_path(state.organization.clone());
            for subject in &self.config.subjects {
                let subscription = self
                    .engine
                    .subscribe(subject, options.clone(), predicate.clone(), &sender)
                    .await?;
                state.add_subscription(subscription);
            }
        }
        Ok(())
    }

    /// Wait for the single expected event.
    pub async fn await_event(&self, state: &mut ScenarioState) -> HarnessResult<MatchedEvent> {
        let deadline = self.config.event_deadline;
        state.match_channel_mut()?.await_match(deadline).await
    }

    /// Wait for every expected event under one deadline.
    pub async fn await_events(&self, state: &mut ScenarioState) -> HarnessResult<Vec<MatchedEvent>> {
        let deadline = self.config.event_deadline;
        let count = state.expected_events;
        state
            .match_channel_mut()?
            .await_matches(count, deadline)
            .await
    }

    fn sent(&self, state: &mut ScenarioState, method: &str) {
        state.request_sent_at = Some(Utc::now());
        debug!("Scenario {} calling {}", state.scenario_id(), method);
    }

    pub async fn create_student(
        &self,
        state: &mut ScenarioState,
        request: Option<CreateStudentRequest>,
    ) -> HarnessResult<()> {
        let ctx = state.call_context()?;
        let request = request.unwrap_or_else(|| builders::student_request(&self.defaults));
        let predicate = MatchPredicate::student_named(request.student_profile.full_name());
        self.expect_events(state, EventKind::CreateStudent, vec![predicate])
            .await?;

        self.sent(state, "CreateStudent");
        let result = self.api.create_student(&ctx, request.clone()).await;
        if let Ok(response) = &result {
            state.current_student_id = Some(response.student_id.clone());
        }
        state.record(
            WorkflowRequest::CreateStudent(request),
            result.map(WorkflowResponse::CreateStudent),
        );
        Ok(())
    }

    /// Update the given student, or the scenario's current student with a
    /// default request.
    pub async fn update_student(
        &self,
        state: &mut ScenarioState,
        request: Option<UpdateStudentRequest>,
    ) -> HarnessResult<()> {
        let ctx = state.call_context()?;
        let request = match request {
            Some(request) => request,
            None => {
                let student_id = current(&state.current_student_id, "current student")?;
                builders::update_student_request(&self.defaults, &student_id)
            }
        };
        let predicate = MatchPredicate::student_id(request.student_profile.student_id.clone());
        self.expect_events(state, EventKind::UpdateStudent, vec![predicate])
            .await?;

        self.sent(state, "UpdateStudent");
        let result = self.api.update_student(&ctx, request.clone()).await;
        state.record(
            WorkflowRequest::UpdateStudent(request),
            result.map(WorkflowResponse::UpdateStudent),
        );
        Ok(())
    }

    /// Create parents. Without a request, a student is created first and one
    /// default parent is assigned to it.
    ///
    /// # Errors
    /// Returns [`HarnessError::Prerequisite`] if the student cannot be
    /// created; the parents RPC is not invoked then.
    pub async fn create_parents(
        &self,
        state: &mut ScenarioState,
        request: Option<CreateParentsRequest>,
    ) -> HarnessResult<()> {
        let ctx = state.call_context()?;
        let request = match request {
            Some(request) => request,
            None => {
                let student_id = self.prerequisite_student(state).await?;
                builders::parents_request(&self.defaults, &student_id)
            }
        };
        let predicates = request
            .parent_profiles
            .iter()
            .map(|profile| {
                MatchPredicate::student_id(request.student_id.clone())
                    .and(MatchPredicate::parent_named(profile.full_name()))
            })
            .collect();
        self.expect_events(state, EventKind::CreateParent, predicates)
            .await?;

        self.sent(state, "CreateParentsAndAssignToStudent");
        let result = self.api.create_parents(&ctx, request.clone()).await;
        if let Ok(response) = &result {
            state.parent_ids = response.parents.iter().map(|p| p.parent_id.clone()).collect();
        }
        state.record(
            WorkflowRequest::CreateParents(request),
            result.map(WorkflowResponse::CreateParents),
        );
        Ok(())
    }

    pub async fn update_parents(
        &self,
        state: &mut ScenarioState,
        request: Option<UpdateParentsRequest>,
    ) -> HarnessResult<()> {
        let ctx = state.call_context()?;
        let request = match request {
            Some(request) => request,
            None => {
                let student_id = current(&state.current_student_id, "current student")?;
                if state.parent_ids.is_empty() {
                    return Err(HarnessError::missing_state("parent ids"));
                }
                builders::update_parents_request(&student_id, &state.parent_ids)
            }
        };
        let predicates = request
            .parent_profiles
            .iter()
            .map(|profile| MatchPredicate::parent_id(profile.parent_id.clone()))
            .collect();
        self.expect_events(state, EventKind::UpdateParent, predicates)
            .await?;

        self.sent(state, "UpdateParentsAndFamilyRelationship");
        let result = self.api.update_parents(&ctx, request.clone()).await;
        state.record(
            WorkflowRequest::UpdateParents(request),
            result.map(WorkflowResponse::UpdateParents),
        );
        Ok(())
    }

    pub async fn create_user_group(
        &self,
        state: &mut ScenarioState,
        request: Option<CreateUserGroupRequest>,
    ) -> HarnessResult<()> {
        let ctx = state.call_context()?;
        let request = request.unwrap_or_else(|| builders::user_group_request(&self.defaults));

        self.sent(state, "CreateUserGroup");
        let result = self.api.create_user_group(&ctx, request.clone()).await;
        if let Ok(response) = &result {
            state.current_user_group_id = Some(response.user_group_id.clone());
        }
        state.record(
            WorkflowRequest::CreateUserGroup(request),
            result.map(WorkflowResponse::CreateUserGroup),
        );
        Ok(())
    }

    pub async fn update_user_group(
        &self,
        state: &mut ScenarioState,
        request: Option<UpdateUserGroupRequest>,
    ) -> HarnessResult<()> {
        let ctx = state.call_context()?;
        let request = match request {
            Some(request) => request,
            None => {
                let group_id = current(&state.current_user_group_id, "current user group")?;
                builders::update_user_group_request(&self.defaults, &group_id)
            }
        };

        self.sent(state, "UpdateUserGroup");
        let result = self.api.update_user_group(&ctx, request.clone()).await;
        state.record(
            WorkflowRequest::UpdateUserGroup(request),
            result.map(WorkflowResponse::UpdateUserGroup),
        );
        Ok(())
    }

    /// Create a staff member. Without a request, a user group is created
    /// first and the staff member joins it.
    ///
    /// # Errors
    /// Returns [`HarnessError::Prerequisite`] if the user group cannot be
    /// created; the staff RPC is not invoked then.
    pub async fn create_staff(
        &self,
        state: &mut ScenarioState,
        request: Option<CreateStaffRequest>,
    ) -> HarnessResult<()> {
        let ctx = state.call_context()?;
        let request = match request {
            Some(request) => request,
            None => {
                let group_id = self.prerequisite_user_group(state).await?;
                builders::staff_request(&self.defaults, vec![group_id])
            }
        };

        self.sent(state, "CreateStaff");
        let result = self.api.create_staff(&ctx, request.clone()).await;
        if let Ok(response) = &result {
            state.current_staff_id = Some(response.staff_id.clone());
        }
        state.record(
            WorkflowRequest::CreateStaff(request),
            result.map(WorkflowResponse::CreateStaff),
        );
        Ok(())
    }

    pub async fn update_staff(
        &self,
        state: &mut ScenarioState,
        request: Option<UpdateStaffRequest>,
    ) -> HarnessResult<()> {
        let ctx = state.call_context()?;
        let request = match request {
            Some(request) => request,
            None => {
                let staff_id = current(&state.current_staff_id, "current staff")?;
                let groups = state.current_user_group_id.iter().cloned().collect();
                builders::update_staff_request(&self.defaults, &staff_id, groups)
            }
        };

        self.sent(state, "UpdateStaff");
        let result = self.api.update_staff(&ctx, request.clone()).await;
        state.record(
            WorkflowRequest::UpdateStaff(request),
            result.map(WorkflowResponse::UpdateStaff),
        );
        Ok(())
    }

    /// Reissue the password of the given user, or of the current student.
    pub async fn reissue_password(
        &self,
        state: &mut ScenarioState,
        request: Option<ReissueUserPasswordRequest>,
    ) -> HarnessResult<()> {
        let ctx = state.call_context()?;
        let request = match request {
            Some(request) => request,
            None => {
                let student_id = current(&state.current_student_id, "current student")?;
                builders::reissue_password_request(&student_id)
            }
        };

        self.sent(state, "ReissueUserPassword");
        let result = self.api.reissue_user_password(&ctx, request.clone()).await;
        state.record(
            WorkflowRequest::ReissueUserPassword(request),
            result.map(WorkflowResponse::ReissueUserPassword),
        );
        Ok(())
    }

    /// Import parents from rows, or one default row for the current student.
    pub async fn import_parents(
        &self,
        state: &mut ScenarioState,
        rows: Option<Vec<ImportParentRow>>,
    ) -> HarnessResult<()> {
        let ctx = state.call_context()?;
        let rows = match rows {
            Some(rows) => rows,
            None => {
                let student_id = current(&state.current_student_id, "current student")?;
                vec![builders::import_parent_row(&student_id)]
            }
        };
        let predicates = rows
            .iter()
            .flat_map(|row| {
                row.student_ids.iter().map(|student_id| {
                    MatchPredicate::student_id(student_id.clone())
                        .and(MatchPredicate::parent_named(row.name.clone()))
                })
            })
            .collect();
        self.expect_events(state, EventKind::CreateParent, predicates)
            .await?;

        let request = ImportParentsRequest::from_rows(&rows)?;
        self.sent(state, "ImportParentsAndAssignToStudent");
        let result = self
            .api
            .import_parents_and_assign_to_student(&ctx, request.clone())
            .await;
        if let Ok(response) = &result {
            state.parent_ids = response.parent_ids.clone();
        }
        state.record(
            WorkflowRequest::ImportParents(request),
            result.map(WorkflowResponse::ImportParents),
        );
        Ok(())
    }

    /// The last RPC succeeded.
    ///
    /// # Errors
    /// [`HarnessError::Rpc`] carrying the recorded status otherwise.
    pub fn assert_success(&self, state: &ScenarioState) -> HarnessResult<()> {
        let method = recorded_method(state)?;
        match &state.response_error {
            Some(status) => Err(HarnessError::rpc(method, status.clone())),
            None => Ok(()),
        }
    }

    /// The last RPC failed with `expected`.
    pub fn assert_status(&self, state: &ScenarioState, expected: StatusCode) -> HarnessResult<()> {
        recorded_method(state)?;
        match &state.response_error {
            None if expected == StatusCode::Ok => Ok(()),
            None => Err(HarnessError::UnexpectedSuccess { expected }),
            Some(status) if status.code == expected => Ok(()),
            Some(status) => Err(HarnessError::StatusMismatch {
                expected,
                actual: status.code,
                message: status.message.clone(),
            }),
        }
    }

    /// Compare what the store holds with the last request.
    pub async fn verify_persisted(&self, state: &ScenarioState) -> HarnessResult<()> {
        let org = state.organization.as_str();
        let (request, response) = match (&state.request, &state.response) {
            (Some(request), Some(response)) => (request, response),
            (None, _) => return Err(HarnessError::missing_state("request")),
            (Some(_), None) => return Err(HarnessError::missing_state("response")),
        };

        match (request, response) {
            (WorkflowRequest::CreateStudent(req), WorkflowResponse::CreateStudent(resp)) => {
                self.verifier.verify_student_created(org, req, resp).await
            }
            (WorkflowRequest::UpdateStudent(req), WorkflowResponse::UpdateStudent(_)) => {
                self.verifier.verify_student_updated(org, req).await
            }
            (WorkflowRequest::CreateParents(req), WorkflowResponse::CreateParents(resp)) => {
                self.verifier.verify_parents_created(org, req, resp).await
            }
            (WorkflowRequest::UpdateParents(req), WorkflowResponse::UpdateParents(_)) => {
                self.verifier.verify_parents_updated(org, req).await
            }
            (WorkflowRequest::CreateStaff(req), WorkflowResponse::CreateStaff(resp)) => {
                self.verifier.verify_staff_created(org, req, resp).await
            }
            (WorkflowRequest::UpdateStaff(req), WorkflowResponse::UpdateStaff(_)) => {
                self.verifier.verify_staff_updated(org, req).await
            }
            (WorkflowRequest::CreateUserGroup(req), WorkflowResponse::CreateUserGroup(resp)) => {
                self.verifier
                    .verify_user_group(
                        org,
                        &resp.user_group_id,
                        &req.user_group_name,
                        &req.role_with_locations,
                    )
                    .await
            }
            (WorkflowRequest::UpdateUserGroup(req), WorkflowResponse::UpdateUserGroup(_)) => {
                self.verifier
                    .verify_user_group(
                        org,
                        &req.user_group_id,
                        &req.user_group_name,
                        &req.role_with_locations,
                    )
                    .await
            }
            (WorkflowRequest::ImportParents(req), WorkflowResponse::ImportParents(resp)) => {
                self.verifier.verify_parents_imported(org, req, resp).await
            }
            // Nothing in the store records a password
            (WorkflowRequest::ReissueUserPassword(_), WorkflowResponse::ReissueUserPassword(_)) => {
                Ok(())
            }
            (request, _) => Err(HarnessError::missing_state(format!(
                "{} response",
                request.method()
            ))),
        }
    }

    /// The matched event agrees with the store.
    pub async fn verify_event(&self, event: &MatchedEvent) -> HarnessResult<()> {
        self.verifier.verify_event_matches_store(event).await
    }

    /// Sign in as the user whose password was just reissued, with the new
    /// password.
    pub async fn verify_reissued_password<T, P, X>(
        &self,
        state: &ScenarioState,
        authenticator: &Authenticator<T, P, X>,
    ) -> HarnessResult<()>
    where
        T: TenantDirectory,
        P: IdentityProvider,
        X: TokenExchanger,
    {
        let Some(WorkflowRequest::ReissueUserPassword(request)) = &state.request else {
            return Err(HarnessError::missing_state("reissue password request"));
        };
        let user = self
            .verifier
            .user(&state.organization, &request.user_id)
            .await?;
        let identity = SubjectIdentity {
            user_id: user.user_id,
            email: user.email,
            password: request.new_password.clone(),
            display_name: user.name,
        };
        authenticator
            .authenticate(&TenantSelector::new(state.organization.clone()), &identity)
            .await?;
        Ok(())
    }

    /// Close the scenario's subscriptions.
    pub fn finish_scenario(&self, state: &mut ScenarioState) -> HarnessResult<()> {
        info!("Scenario {} finished", state.scenario_id());
        state.teardown()
    }

    async fn prerequisite_student(&self, state: &mut ScenarioState) -> HarnessResult<String> {
        let ctx = state.call_context()?;
        let request = builders::student_request(&self.defaults);
        let response = self
            .api
            .create_student(&ctx, request)
            .await
            .map_err(|status| {
                HarnessError::prerequisite("student", HarnessError::rpc("CreateStudent", status))
            })?;
        debug!("Created prerequisite student {}", response.student_id);
        state.current_student_id = Some(response.student_id.clone());
        Ok(response.student_id)
    }

    async fn prerequisite_user_group(&self, state: &mut ScenarioState) -> HarnessResult<String> {
        let ctx = state.call_context()?;
        let request = builders::user_group_request(&self.defaults);
        let response = self
            .api
            .create_user_group(&ctx, request)
            .await
            .map_err(|status| {
                HarnessError::prerequisite(
                    "user group",
                    HarnessError::rpc("CreateUserGroup", status),
                )
            })?;
        debug!("Created prerequisite user group {}", response.user_group_id);
        state.current_user_group_id = Some(response.user_group_id.clone());
        Ok(response.user_group_id)
    }
}

fn current(value: &Option<String>, what: &str) -> HarnessResult<String> {
    value
        .clone()
        .ok_or_else(|| HarnessError::missing_state(what))
}

fn recorded_method(state: &ScenarioState) -> HarnessResult<&'static str> {
    state
        .request
        .as_ref()
        .map(WorkflowRequest::method)
        .ok_or_else(|| HarnessError::missing_state("request"))
}

//! Per-scenario step state.
//!
//! One [`ScenarioState`] is created when a scenario starts and passed by
//! `&mut` into every step, so steps of one scenario run strictly in sequence
//! while scenarios run concurrently with disjoint states. It owns the
//! scenario's subscriptions and match channel; [`ScenarioState::teardown`]
//! closes them, and dropping the state does the same.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use uuid::Uuid;

use crate::api::{CallContext, RpcStatus, WorkflowRequest, WorkflowResponse};
use crate::correlation::{MatchReceiver, MatchSender, Subscription, match_channel};
use crate::error::{HarnessError, HarnessResult};
use crate::identity::TenantCredential;

#[derive(Debug)]
pub struct ScenarioState {
    scenario_id: Uuid,
    started_at: DateTime<Utc>,
    /// Resource path the scenario acts in.
    pub organization: String,
    pub auth_token: Option<String>,
    credential: Option<TenantCredential>,
    pub request: Option<WorkflowRequest>,
    pub response: Option<WorkflowResponse>,
    pub response_error: Option<RpcStatus>,
    pub request_sent_at: Option<DateTime<Utc>>,
    subscriptions: Vec<Subscription>,
    match_channel: Option<MatchReceiver>,
    /// Matches the current match channel is expected to deliver.
    pub expected_events: usize,
    pub current_student_id: Option<String>,
    pub current_staff_id: Option<String>,
    pub current_user_group_id: Option<String>,
    pub parent_ids: Vec<String>,
    torn_down: bool,
}

impl ScenarioState {
    pub fn new(organization: impl Into<String>) -> Self {
        let state = Self {
            scenario_id: Uuid::new_v4(),
            started_at: Utc::now(),
            organization: organization.into(),
            auth_token: None,
            credential: None,
            request: None,
            response: None,
            response_error: None,
            request_sent_at: None,
            subscriptions: Vec::new(),
            match_channel: None,
            expected_events: 0,
            current_student_id: None,
            current_staff_id: None,
            current_user_group_id: None,
            parent_ids: Vec::new(),
            torn_down: false,
        };
        debug!(
            "Scenario {} started in '{}'",
            state.scenario_id, state.organization
        );
        state
    }

    pub fn scenario_id(&self) -> Uuid {
        self.scenario_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Use `credential` for every following call.
    pub fn sign_in(&mut self, credential: TenantCredential) {
        self.auth_token = Some(credential.exchanged_token.clone());
        self.credential = Some(credential);
    }

    pub fn credential(&self) -> Option<&TenantCredential> {
        self.credential.as_ref()
    }

    /// Call metadata for the signed-in user.
    pub fn call_context(&self) -> HarnessResult<CallContext> {
        let token = self
            .auth_token
            .clone()
            .ok_or_else(|| HarnessError::missing_state("auth token"))?;
        Ok(CallContext::new(token, self.organization.clone()))
    }

    /// Replace the match channel with a fresh one and return its sender.
    ///
    /// Subscriptions still feeding the previous channel keep running until
    /// teardown, but their matches go nowhere.
    pub fn reset_match_channel(&mut self, capacity: usize) -> MatchSender {
        let (sender, receiver) = match_channel(capacity);
        self.match_channel = Some(receiver);
        sender
    }

    pub fn match_channel_mut(&mut self) -> HarnessResult<&mut MatchReceiver> {
        self.match_channel
            .as_mut()
            .ok_or_else(|| HarnessError::missing_state("match channel"))
    }

    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Record the outcome of the scenario's RPC.
    pub fn record(&mut self, request: WorkflowRequest, result: Result<WorkflowResponse, RpcStatus>) {
        self.request = Some(request);
        match result {
            Ok(response) => {
                self.response = Some(response);
                self.response_error = None;
            }
            Err(status) => {
                self.response = None;
                self.response_error = Some(status);
            }
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Close every subscription. Safe to call more than once.
    ///
    /// All subscriptions are closed even if one fails; the first failure is
    /// returned.
    pub fn teardown(&mut self) -> HarnessResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let mut first_error = None;
        for subscription in self.subscriptions.drain(..) {
            if let Err(e) = subscription.close() {
                warn!("Scenario {}: {}", self.scenario_id, e);
                first_error.get_or_insert(e);
            }
        }
        self.match_channel = None;
        debug!("Scenario {} torn down", self.scenario_id);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ScenarioState {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("Scenario {} teardown on drop failed: {}", self.scenario_id, e);
        }
    }
}

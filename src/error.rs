//! Error types for harness operations.
//!
//! Every failure a scenario can report maps to one variant of [`HarnessError`].
//! Component-level errors ([`BusError`], [`IdentityError`], storage errors) are
//! wrapped with the context needed to diagnose a failing run without
//! re-running it: the subject, the tenant, the field.

use std::time::Duration;

use crate::api::{RpcStatus, StatusCode};
use crate::bus::BusError;
use crate::identity::{AuthStep, IdentityError};
use crate::readiness::ConnectivityState;

/// Main error type for harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// A downstream peer never became usable within the attempt budget
    #[error("Peer '{peer}' not ready after {attempts} attempt(s), last state: {last_state}")]
    NotReady {
        peer: String,
        attempts: u32,
        last_state: ConnectivityState,
    },

    /// The bus rejected a subscription request
    #[error("Failed to subscribe to subject '{subject}': {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: BusError,
    },

    /// The bus failed to tear down a subscription
    #[error("Failed to unsubscribe from subject '{subject}': {source}")]
    Unsubscribe {
        subject: String,
        #[source]
        source: BusError,
    },

    /// Publishing to the bus failed
    #[error("Failed to publish to subject '{subject}': {source}")]
    Publish {
        subject: String,
        #[source]
        source: BusError,
    },

    /// A received message could not be decoded. Logged and skipped by the
    /// correlation engine, never fatal to a subscription.
    #[error("Failed to decode message {sequence} on subject '{subject}': {message}")]
    Decode {
        subject: String,
        sequence: u64,
        message: String,
    },

    /// No matching message arrived before the deadline
    #[error(
        "Timed out after {elapsed:?} waiting for {expectation} on subject(s) {subjects:?} ({decode_failures} undecodable message(s) seen, {dropped_matches} match(es) dropped on a full channel)"
    )]
    Timeout {
        subjects: Vec<String>,
        elapsed: Duration,
        expectation: String,
        decode_failures: u64,
        dropped_matches: u64,
    },

    /// Every sender of a match channel went away before a match arrived
    #[error("Match channel closed while waiting for {expectation} on subject(s) {subjects:?}")]
    MatchChannelClosed {
        subjects: Vec<String>,
        expectation: String,
    },

    /// A match predicate panicked on the delivery task
    #[error("Predicate '{predicate}' panicked on subject '{subject}': {message}")]
    PredicatePanicked {
        subject: String,
        predicate: String,
        message: String,
    },

    /// One of the identity bootstrap steps failed
    #[error("Authentication failed at step '{step}' for tenant '{tenant}': {source}")]
    Authentication {
        step: AuthStep,
        tenant: String,
        #[source]
        source: IdentityError,
    },

    /// Persisted state disagrees with the request
    #[error("Verification mismatch on {entity}.{field}: expected '{expected}', actual '{actual}'")]
    VerificationMismatch {
        entity: String,
        field: String,
        expected: String,
        actual: String,
    },

    /// A row the verification expected is absent
    #[error("Row not found: {table} with id {id}")]
    RowNotFound { table: String, id: String },

    /// The RPC failed where success was expected
    #[error("RPC {method} failed: {status}")]
    Rpc { method: String, status: RpcStatus },

    /// The RPC succeeded where a failure was expected
    #[error("Expected RPC to fail with {expected}, but it succeeded")]
    UnexpectedSuccess { expected: StatusCode },

    /// The RPC failed with a different status code than expected
    #[error("Expected status {expected}, got {actual}: {message}")]
    StatusMismatch {
        expected: StatusCode,
        actual: StatusCode,
        message: String,
    },

    /// A default builder could not create a prerequisite entity
    #[error("Prerequisite '{what}' failed: {source}")]
    Prerequisite {
        what: String,
        #[source]
        source: Box<HarnessError>,
    },

    /// A step needed something an earlier step should have stored
    #[error("Scenario state is missing {0}")]
    MissingState(String),

    /// Errors from the relational store
    #[error("Storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid harness configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },
}

impl HarnessError {
    /// Create a decode error for a message on a subject
    pub fn decode(subject: impl Into<String>, sequence: u64, message: impl Into<String>) -> Self {
        Self::Decode {
            subject: subject.into(),
            sequence,
            message: message.into(),
        }
    }

    /// Create a verification mismatch error
    pub fn mismatch(
        entity: impl Into<String>,
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::VerificationMismatch {
            entity: entity.into(),
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a row not found error
    pub fn row_not_found(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::RowNotFound {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Create an RPC failure error
    pub fn rpc(method: impl Into<String>, status: RpcStatus) -> Self {
        Self::Rpc {
            method: method.into(),
            status,
        }
    }

    /// Wrap the failure of a prerequisite entity
    pub fn prerequisite(what: impl Into<String>, source: HarnessError) -> Self {
        Self::Prerequisite {
            what: what.into(),
            source: Box::new(source),
        }
    }

    /// Create a missing state error
    pub fn missing_state(what: impl Into<String>) -> Self {
        Self::MissingState(what.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Wrap a storage error
    pub fn storage<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage(Box::new(error))
    }

    /// True for the eventual-consistency failure: the RPC went through but the
    /// event never showed up.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;

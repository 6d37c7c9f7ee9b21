//! Acceptance-test harness for a multi-tenant user-management API.
//!
//! Drives API calls, then verifies both their synchronous effects in the
//! relational store and their asynchronous publications on a durable message
//! bus. Scenarios run concurrently against a shared bus; each one owns its
//! state and isolates itself with a start-time watermark plus predicates on
//! the request's identifying fields.
//!
//! # Core Components
//!
//! - [`CorrelationEngine`] - Subscribes predicates to bus subjects and
//!   delivers at most one match per subscription
//! - [`MatchReceiver`] - Deadline-bounded wait for matches
//! - [`wait_until_ready`] - Bounded readiness wait before authenticating
//! - [`ScenarioState`] - Per-scenario state threaded through steps
//! - [`Harness`] - Scenario steps over any bus, API and store
//!
//! The bus, API, identity platform and store are traits, each with an
//! in-memory implementation.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use usermgmt_harness::bus::{InMemoryBus, SubscribeOptions};
//! use usermgmt_harness::correlation::{CorrelationEngine, MatchPredicate, match_channel};
//! use usermgmt_harness::events::SUBJECT_USER_CREATED;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(InMemoryBus::new());
//! let engine = CorrelationEngine::new(Arc::clone(&bus));
//! let (sender, mut receiver) = match_channel(4);
//!
//! let subscription = engine
//!     .subscribe(
//!         SUBJECT_USER_CREATED,
//!         SubscribeOptions::new(),
//!         MatchPredicate::student_named("user-42"),
//!         &sender,
//!     )
//!     .await?;
//!
//! // ... invoke the API ...
//! let matched = receiver.await_match(Duration::from_secs(2)).await?;
//! println!("matched message {}", matched.sequence);
//! subscription.close()?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod bus;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod identity;
pub mod readiness;
pub mod state;
pub mod steps;
pub mod storage;
pub mod verification;

// Re-export commonly used types for convenience
pub use api::{CallContext, InMemoryUserService, RpcStatus, StatusCode, UserManagementApi};
pub use bus::{InMemoryBus, MessageBus, SubscribeOptions};
pub use config::{HarnessConfig, HarnessConfigBuilder};
pub use correlation::{
    CorrelationEngine, MatchPredicate, MatchReceiver, MatchSender, MatchedEvent, Subscription,
    match_channel,
};
pub use error::{HarnessError, HarnessResult};
pub use events::{EventKind, UserEvent};
pub use identity::{Authenticator, SubjectIdentity, TenantCredential, TenantSelector};
pub use readiness::{ConnectivityState, ReadinessProbe, RetryPolicy, wait_until_ready};
pub use state::ScenarioState;
pub use steps::{BuilderDefaults, Harness};
pub use storage::{InMemoryStorage, StorageProvider};
pub use verification::Verifier;

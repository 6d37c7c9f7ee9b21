//! Integration tests for the acceptance harness.
//!
//! Every test builds its own bus, store and service through
//! [`crate::common`], so tests never share published events.
//!
//! ## Test Organization
//!
//! - `scenarios`: create/update workflows end to end, a lost event, and
//!   concurrent scenarios on one bus
//! - `correlation`: watermark, at-most-once delivery, idempotent close,
//!   predicate panics, undecodable messages and deadlines
//! - `readiness`: waiting for the bus before a run
//! - `identity`: each identity bootstrap step failing, and password reissue
//! - `workflows`: user groups, staff, prerequisites and parent import

pub mod correlation;
pub mod identity;
pub mod readiness;
pub mod scenarios;
pub mod workflows;

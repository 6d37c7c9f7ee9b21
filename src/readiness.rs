//! Bounded readiness wait for downstream connections.
//!
//! Before a scenario can authenticate, the connections it depends on (the
//! message bus, the RPC channel) must be usable. [`wait_until_ready`] polls a
//! [`ReadinessProbe`] with a fixed backoff and gives up after a bounded number
//! of attempts, so a permanently failed peer surfaces as [`HarnessError::NotReady`]
//! instead of hanging the suite.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

/// Connectivity state reported by a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    /// Only a ready connection can carry calls.
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectivityState::Ready)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// A peer whose connectivity can be observed.
pub trait ReadinessProbe: Send + Sync {
    /// Name used in logs and in [`HarnessError::NotReady`].
    fn name(&self) -> &str;

    /// Current connectivity state. Must not block.
    fn connectivity_state(&self) -> ConnectivityState;
}

/// Attempt ceiling and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: Duration,
}

impl RetryPolicy {
    /// Create a retry policy.
    ///
    /// # Errors
    /// Returns [`HarnessError::InvalidConfiguration`] if `max_attempts` is zero.
    pub fn new(max_attempts: u32, interval: Duration) -> HarnessResult<Self> {
        if max_attempts == 0 {
            return Err(HarnessError::invalid_configuration(
                "readiness max_attempts must be at least 1",
            ));
        }
        Ok(Self {
            max_attempts,
            interval,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

/// Block until `peer` reports a usable state.
///
/// Returns immediately when the peer is already ready. Otherwise sleeps
/// `policy.interval()` between checks, for at most `policy.max_attempts()`
/// checks in total.
///
/// # Errors
/// Returns [`HarnessError::NotReady`] carrying the last observed state once
/// the attempts are exhausted.
pub async fn wait_until_ready<P>(peer: &P, policy: &RetryPolicy) -> HarnessResult<()>
where
    P: ReadinessProbe + ?Sized,
{
    let mut state = peer.connectivity_state();
    let mut attempts = 1;

    while !state.is_usable() {
        if attempts >= policy.max_attempts {
            warn!(
                "Peer '{}' still {} after {} attempt(s), giving up",
                peer.name(),
                state,
                attempts
            );
            return Err(HarnessError::NotReady {
                peer: peer.name().to_string(),
                attempts,
                last_state: state,
            });
        }

        debug!(
            "Peer '{}' is {} (attempt {}/{}), retrying in {:?}",
            peer.name(),
            state,
            attempts,
            policy.max_attempts,
            policy.interval
        );
        tokio::time::sleep(policy.interval).await;

        state = peer.connectivity_state();
        attempts += 1;
    }

    info!("Peer '{}' ready after {} attempt(s)", peer.name(), attempts);
    Ok(())
}

//! Message bus abstraction.
//!
//! The harness only needs a small slice of a durable pub/sub log: publish to a
//! subject, and subscribe to a subject starting from a point in time with an
//! acknowledgment policy. [`MessageBus`] captures that slice so the
//! correlation engine works against any backend; [`InMemoryBus`] is a
//! complete in-process implementation used by the test suites.
//!
//! Delivery contract:
//!
//! * Messages published before `start_time` are never delivered.
//! * Per subscription, messages are handed to the handler one at a time in
//!   publish order.
//! * The handler's [`HandlerOutcome`] decides acknowledgment. Under
//!   [`AckMode::Manual`] a [`HandlerOutcome::Retry`] leaves the message
//!   unacknowledged and the bus redelivers it once `ack_wait` has elapsed, up
//!   to `max_deliver` attempts.

pub mod in_memory;

pub use in_memory::InMemoryBus;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Errors raised by a message bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The bus connection is not usable
    #[error("bus disconnected: {message}")]
    Disconnected { message: String },

    /// The bus refused the subscription
    #[error("subscription to '{subject}' rejected: {reason}")]
    SubscriptionRejected { subject: String, reason: String },

    /// Subject name is empty or malformed
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),
}

/// Acknowledgment policy of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Messages are acknowledged on delivery; the handler outcome is ignored.
    Auto,
    /// The handler outcome is the acknowledgment. An unacknowledged message
    /// becomes eligible for redelivery after `ack_wait`.
    Manual { ack_wait: Duration },
}

/// Options of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub start_time: DateTime<Utc>,
    pub ack_mode: AckMode,
    pub max_deliver: u32,
    pub skip_older_than: Option<Duration>,
}

impl SubscribeOptions {
    /// Options starting now, with manual acknowledgment and a 2 second ack wait.
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            ack_mode: AckMode::Manual {
                ack_wait: Duration::from_secs(2),
            },
            max_deliver: 5,
            skip_older_than: None,
        }
    }

    /// Only deliver messages published at or after `start_time`.
    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn manual_ack(mut self, ack_wait: Duration) -> Self {
        self.ack_mode = AckMode::Manual { ack_wait };
        self
    }

    pub fn auto_ack(mut self) -> Self {
        self.ack_mode = AckMode::Auto;
        self
    }

    pub fn max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver.max(1);
        self
    }

    /// Drop messages whose publish time is further than `max_age` in the past
    /// at delivery time.
    pub fn skip_older_than(mut self, max_age: Duration) -> Self {
        self.skip_older_than = Some(max_age);
        self
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A message as delivered to a subscription handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    /// Stream sequence, unique across subjects of one bus.
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    pub data: Vec<u8>,
    /// 1 on first delivery, incremented on each redelivery.
    pub delivery_attempt: u32,
}

/// What the handler wants done with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Acknowledge: the message is done and will not be redelivered.
    Ack,
    /// Leave unacknowledged so the bus redelivers it after the ack wait.
    Retry,
}

/// Callback invoked on the bus delivery task for each message.
pub type MessageHandler = Arc<dyn Fn(&BusMessage) -> HandlerOutcome + Send + Sync>;

/// Acknowledgment returned by a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub subject: String,
    pub sequence: u64,
}

/// Live registration against a subject.
pub trait BusSubscription: Send + Sync {
    fn subject(&self) -> &str;

    /// Stop delivery. Calling it again is a no-op.
    fn unsubscribe(&self) -> Result<(), BusError>;

    fn is_active(&self) -> bool;
}

/// Durable pub/sub log.
pub trait MessageBus: Send + Sync {
    type Subscription: BusSubscription + 'static;

    /// Register `handler` for messages on `subject`.
    fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> impl Future<Output = Result<Self::Subscription, BusError>> + Send;

    /// Append `data` to the log of `subject`.
    fn publish(
        &self,
        subject: &str,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<PublishAck, BusError>> + Send;
}

fn validate_subject(subject: &str) -> Result<(), BusError> {
    if subject.is_empty() || subject.contains(char::is_whitespace) {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

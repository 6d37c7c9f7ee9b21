//! Event correlation engine.
//!
//! The engine subscribes to a subject with a start-time watermark, decodes
//! every delivered message into a [`UserEvent`], evaluates a
//! [`MatchPredicate`] against it and pushes the first match into a bounded
//! match channel. Everything after the first match is acknowledged and
//! ignored, so a subscription delivers at most one outcome.
//!
//! # Dispatch path
//!
//! For each message, on the bus delivery task:
//!
//! 1. If the subscription is closed or already matched, acknowledge.
//! 2. Decode the envelope and payload. A failure is logged, counted and
//!    acknowledged; the subscription keeps listening.
//! 3. Evaluate the predicate under `catch_unwind`. A panic is forwarded to the
//!    waiting step as [`MatchOutcome::PredicateFailed`].
//! 4. On a match, `try_send` into the channel. A full channel is a harness
//!    configuration bug: it is logged and counted as dropped.
//!
//! The delivery task never blocks on the match channel.

pub mod channel;
pub mod predicate;

pub use channel::{MatchReceiver, MatchSender, match_channel};
pub use predicate::{EventContext, MatchPredicate};

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc::error::TrySendError;

use crate::bus::{
    AckMode, BusMessage, BusSubscription, HandlerOutcome, MessageBus, MessageHandler,
    SubscribeOptions,
};
use crate::error::{HarnessError, HarnessResult};
use crate::events::{UserEvent, decode_message};

/// A decoded event that satisfied a predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedEvent {
    pub subject: String,
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    pub resource_path: String,
    pub user_id: String,
    pub event: UserEvent,
    pub matched_at: DateTime<Utc>,
}

/// What a subscription delivers into the match channel.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(MatchedEvent),
    PredicateFailed {
        subject: String,
        predicate: String,
        message: String,
    },
}

/// Counters of one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub received: u64,
    pub decode_failures: u64,
    pub rejected: u64,
    pub matched: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Gate {
    closed: bool,
    matched: bool,
}

#[derive(Default)]
struct SubscriptionShared {
    gate: Mutex<Gate>,
    received: AtomicU64,
    decode_failures: AtomicU64,
    rejected: AtomicU64,
    matched: AtomicU64,
    dropped: AtomicU64,
}

impl SubscriptionShared {
    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            received: self.received.load(Ordering::SeqCst),
            decode_failures: self.decode_failures.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            matched: self.matched.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
        }
    }
}

/// Subscribes predicates to a message bus.
pub struct CorrelationEngine<B> {
    bus: Arc<B>,
}

impl<B> Clone for CorrelationEngine<B> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
        }
    }
}

impl<B: MessageBus> CorrelationEngine<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    /// Register `predicate` on `subject`. Matches are pushed into `sender`.
    ///
    /// # Errors
    /// Returns [`HarnessError::Subscribe`] if the bus refuses the subscription.
    pub async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        predicate: MatchPredicate,
        sender: &MatchSender,
    ) -> HarnessResult<Subscription> {
        let shared = Arc::new(SubscriptionShared::default());
        let watermark = options.start_time;
        let ack_mode = options.ack_mode;
        let description = predicate.description().to_string();

        let handler = dispatch_handler(predicate, sender.clone(), Arc::clone(&shared));
        let inner = self
            .bus
            .subscribe(subject, options, handler)
            .await
            .map_err(|source| HarnessError::Subscribe {
                subject: subject.to_string(),
                source,
            })?;

        sender.register(subject, &description);
        info!(
            "Subscribed to '{}' from {} waiting for {}",
            subject, watermark, description
        );

        Ok(Subscription {
            subject: subject.to_string(),
            watermark,
            predicate: description,
            ack_mode,
            shared,
            inner: Box::new(inner),
        })
    }
}

fn dispatch_handler(
    predicate: MatchPredicate,
    sender: MatchSender,
    shared: Arc<SubscriptionShared>,
) -> MessageHandler {
    Arc::new(move |message: &BusMessage| {
        shared.received.fetch_add(1, Ordering::SeqCst);

        // Held until the outcome is handed off so close() cannot interleave
        let mut gate = shared.lock_gate();
        if gate.closed || gate.matched {
            return HandlerOutcome::Ack;
        }

        let (envelope, event) = match decode_message(&message.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                let error = HarnessError::decode(&message.subject, message.sequence, e.to_string());
                warn!("{}", error);
                shared.decode_failures.fetch_add(1, Ordering::SeqCst);
                sender.record_decode_failure();
                return HandlerOutcome::Ack;
            }
        };

        let context = EventContext {
            subject: &message.subject,
            sequence: message.sequence,
            published_at: message.published_at,
            resource_path: &envelope.resource_path,
            user_id: &envelope.user_id,
            event: &event,
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| predicate.evaluate(&context))) {
            Ok(false) => {
                trace!(
                    "Message {} on '{}' does not satisfy {}",
                    message.sequence,
                    message.subject,
                    predicate.description()
                );
                shared.rejected.fetch_add(1, Ordering::SeqCst);
                return HandlerOutcome::Ack;
            }
            Ok(true) => MatchOutcome::Matched(MatchedEvent {
                subject: message.subject.clone(),
                sequence: message.sequence,
                published_at: message.published_at,
                resource_path: envelope.resource_path.clone(),
                user_id: envelope.user_id.clone(),
                event: event.clone(),
                matched_at: Utc::now(),
            }),
            Err(payload) => {
                let message_text = panic_message(payload.as_ref());
                error!(
                    "Predicate '{}' panicked on message {} of '{}': {}",
                    predicate.description(),
                    message.sequence,
                    message.subject,
                    message_text
                );
                MatchOutcome::PredicateFailed {
                    subject: message.subject.clone(),
                    predicate: predicate.description().to_string(),
                    message: message_text,
                }
            }
        };

        gate.matched = true;
        match sender.try_send(outcome) {
            Ok(()) => {
                shared.matched.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "Message {} on '{}' matched {}",
                    message.sequence,
                    message.subject,
                    predicate.description()
                );
            }
            Err(TrySendError::Full(_)) => {
                shared.dropped.fetch_add(1, Ordering::SeqCst);
                sender.record_dropped_match();
                error!(
                    "Match channel full, dropping match of message {} on '{}'; channel capacity {} is too small",
                    message.sequence,
                    message.subject,
                    sender.capacity()
                );
            }
            Err(TrySendError::Closed(_)) => {
                shared.dropped.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "Nobody waiting for match of message {} on '{}'",
                    message.sequence, message.subject
                );
            }
        }

        HandlerOutcome::Ack
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A live correlation subscription, owned by the scenario that created it.
///
/// Dropping it closes it.
pub struct Subscription {
    subject: String,
    watermark: DateTime<Utc>,
    predicate: String,
    ack_mode: AckMode,
    shared: Arc<SubscriptionShared>,
    inner: Box<dyn BusSubscription>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Messages published before this instant are never delivered.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn predicate_description(&self) -> &str {
        &self.predicate
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.shared.stats()
    }

    pub fn is_matched(&self) -> bool {
        self.shared.lock_gate().matched
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_gate().closed
    }

    /// Unsubscribe from the bus.
    ///
    /// Idempotent. Once it returns, no further outcome from this subscription
    /// reaches the match channel.
    ///
    /// # Errors
    /// Returns [`HarnessError::Unsubscribe`] if the bus reports a failure. The
    /// subscription is still considered closed.
    pub fn close(&self) -> HarnessResult<()> {
        {
            let mut gate = self.shared.lock_gate();
            if gate.closed {
                return Ok(());
            }
            gate.closed = true;
        }

        self.inner
            .unsubscribe()
            .map_err(|source| HarnessError::Unsubscribe {
                subject: self.subject.clone(),
                source,
            })?;

        let stats = self.stats();
        debug!(
            "Closed subscription on '{}' ({} received, {} matched, {} undecodable)",
            self.subject, stats.received, stats.matched, stats.decode_failures
        );
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}", e);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("watermark", &self.watermark)
            .field("predicate", &self.predicate)
            .field("ack_mode", &self.ack_mode)
            .field("stats", &self.stats())
            .finish()
    }
}

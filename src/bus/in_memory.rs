//! In-process durable message bus.
//!
//! [`InMemoryBus`] keeps every published message in a per-subject log, so a
//! subscription whose start time lies in the past replays the matching part of
//! the log before receiving live messages, the way a durable stream consumer
//! with a start-time deliver policy behaves.
//!
//! Each subscription gets its own delivery task. The task pulls from an
//! unbounded queue and runs the handler one message at a time, which keeps
//! per-subscription delivery in publish order. Publishing never waits on a
//! slow handler.

use super::{
    AckMode, BusError, BusMessage, BusSubscription, HandlerOutcome, MessageBus, MessageHandler,
    PublishAck, SubscribeOptions, validate_subject,
};
use crate::readiness::{ConnectivityState, ReadinessProbe};
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{Notify, mpsc};

/// Thread-safe in-memory message bus.
///
/// Cloning is cheap and every clone shares the same log and subscribers.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    name: String,
    state: Mutex<BusState>,
    connectivity: Mutex<ConnectivityState>,
    rejection: Mutex<Option<String>>,
    next_subscription_id: AtomicU64,
}

#[derive(Default)]
struct BusState {
    log: HashMap<String, Vec<StoredMessage>>,
    next_sequence: u64,
    subscribers: Vec<Subscriber>,
}

#[derive(Clone)]
struct StoredMessage {
    sequence: u64,
    published_at: DateTime<Utc>,
    data: Vec<u8>,
}

impl StoredMessage {
    fn to_message(&self, subject: &str) -> BusMessage {
        BusMessage {
            subject: subject.to_string(),
            sequence: self.sequence,
            published_at: self.published_at,
            data: self.data.clone(),
            delivery_attempt: 1,
        }
    }
}

struct Subscriber {
    id: u64,
    subject: String,
    start_time: DateTime<Utc>,
    sender: mpsc::UnboundedSender<BusMessage>,
}

struct SubscriptionControl {
    active: AtomicBool,
    shutdown: Notify,
}

impl InMemoryBus {
    /// Create a new, connected, empty bus.
    pub fn new() -> Self {
        Self::named("nats-jetstream")
    }

    /// Create a bus with the name it reports as a readiness probe.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                state: Mutex::new(BusState::default()),
                connectivity: Mutex::new(ConnectivityState::Ready),
                rejection: Mutex::new(None),
                next_subscription_id: AtomicU64::new(1),
            }),
        }
    }

    /// Change the reported connectivity state. Anything but `Ready` makes
    /// publish and subscribe fail with [`BusError::Disconnected`].
    pub fn set_connectivity_state(&self, state: ConnectivityState) {
        *self
            .inner
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Make every subsequent subscribe fail with `reason`, or accept again
    /// with `None`.
    pub fn reject_subscriptions(&self, reason: Option<String>) {
        *self
            .inner
            .rejection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = reason;
    }

    /// Publish with an explicit publish timestamp.
    ///
    /// Live subscribers whose start time is later than `published_at` do not
    /// receive the message.
    pub fn publish_at(
        &self,
        subject: &str,
        data: Vec<u8>,
        published_at: DateTime<Utc>,
    ) -> Result<PublishAck, BusError> {
        validate_subject(subject)?;
        self.ensure_connected()?;

        let mut state = self.inner.lock_state();
        state.next_sequence += 1;
        let stored = StoredMessage {
            sequence: state.next_sequence,
            published_at,
            data,
        };

        state.subscribers.retain(|s| !s.sender.is_closed());
        for subscriber in state
            .subscribers
            .iter()
            .filter(|s| s.subject == subject && published_at >= s.start_time)
        {
            // A closed receiver only means the subscription is going away
            let _ = subscriber.sender.send(stored.to_message(subject));
        }

        let sequence = stored.sequence;
        state
            .log
            .entry(subject.to_string())
            .or_default()
            .push(stored);

        trace!("Published message {} on '{}'", sequence, subject);
        Ok(PublishAck {
            subject: subject.to_string(),
            sequence,
        })
    }

    /// All messages ever published on `subject`, in publish order.
    pub fn messages(&self, subject: &str) -> Vec<BusMessage> {
        self.inner
            .lock_state()
            .log
            .get(subject)
            .map(|messages| messages.iter().map(|m| m.to_message(subject)).collect())
            .unwrap_or_default()
    }

    /// Number of live subscriptions on `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .lock_state()
            .subscribers
            .iter()
            .filter(|s| s.subject == subject && !s.sender.is_closed())
            .count()
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        let state = *self
            .inner
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.is_usable() {
            Ok(())
        } else {
            Err(BusError::Disconnected {
                message: format!("connection is {}", state),
            })
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusInner {
    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReadinessProbe for InMemoryBus {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn connectivity_state(&self) -> ConnectivityState {
        *self
            .inner
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageBus for InMemoryBus {
    type Subscription = InMemorySubscription;

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> Result<Self::Subscription, BusError> {
        validate_subject(subject)?;
        self.ensure_connected()?;

        if let Some(reason) = self
            .inner
            .rejection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(BusError::SubscriptionRejected {
                subject: subject.to_string(),
                reason,
            });
        }

        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        let control = Arc::new(SubscriptionControl {
            active: AtomicBool::new(true),
            shutdown: Notify::new(),
        });

        // Replay and registration happen under one lock so no message
        // published concurrently is either missed or delivered twice.
        {
            let mut state = self.inner.lock_state();
            let mut replayed = 0;
            if let Some(messages) = state.log.get(subject) {
                for stored in messages
                    .iter()
                    .filter(|m| m.published_at >= options.start_time)
                {
                    let _ = sender.send(stored.to_message(subject));
                    replayed += 1;
                }
            }
            state.subscribers.push(Subscriber {
                id,
                subject: subject.to_string(),
                start_time: options.start_time,
                sender: sender.clone(),
            });
            debug!(
                "Subscription {} on '{}' starting at {} ({} message(s) replayed)",
                id, subject, options.start_time, replayed
            );
        }

        tokio::spawn(dispatch(
            subject.to_string(),
            receiver,
            sender,
            handler,
            options,
            Arc::clone(&control),
        ));

        Ok(InMemorySubscription {
            id,
            subject: subject.to_string(),
            control,
            bus: Arc::downgrade(&self.inner),
        })
    }

    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<PublishAck, BusError> {
        self.publish_at(subject, data, Utc::now())
    }
}

async fn dispatch(
    subject: String,
    mut receiver: mpsc::UnboundedReceiver<BusMessage>,
    redelivery: mpsc::UnboundedSender<BusMessage>,
    handler: MessageHandler,
    options: SubscribeOptions,
    control: Arc<SubscriptionControl>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = control.shutdown.notified() => break,
            message = receiver.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if !control.active.load(Ordering::SeqCst) {
            break;
        }

        if let Some(max_age) = options.skip_older_than {
            let too_old = Utc::now()
                .signed_duration_since(message.published_at)
                .to_std()
                .map(|age| age > max_age)
                .unwrap_or(false);
            if too_old {
                debug!(
                    "Skipping message {} on '{}' published at {}",
                    message.sequence, subject, message.published_at
                );
                continue;
            }
        }

        let outcome = handler(&message);

        if let (AckMode::Manual { ack_wait }, HandlerOutcome::Retry) = (options.ack_mode, outcome) {
            if message.delivery_attempt < options.max_deliver {
                let mut message = message;
                message.delivery_attempt += 1;
                let redelivery = redelivery.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(ack_wait).await;
                    let _ = redelivery.send(message);
                });
            } else {
                warn!(
                    "Message {} on '{}' not acknowledged after {} deliveries, dropping",
                    message.sequence, subject, message.delivery_attempt
                );
            }
        }
    }

    debug!("Delivery task for '{}' stopped", subject);
}

/// Subscription handle returned by [`InMemoryBus`].
pub struct InMemorySubscription {
    id: u64,
    subject: String,
    control: Arc<SubscriptionControl>,
    bus: Weak<BusInner>,
}

impl BusSubscription for InMemorySubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn unsubscribe(&self) -> Result<(), BusError> {
        if !self.control.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.control.shutdown.notify_one();
        if let Some(bus) = self.bus.upgrade() {
            bus.lock_state().subscribers.retain(|s| s.id != self.id);
        }

        debug!("Subscription {} on '{}' closed", self.id, self.subject);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.control.active.load(Ordering::SeqCst)
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        let _ = self.unsubscribe();
    }
}

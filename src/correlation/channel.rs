//! Bounded match channel and the deadline-bounded wait on it.
//!
//! A [`MatchSender`] is handed to every subscription of one expectation. The
//! paired [`MatchReceiver`] is kept by the scenario and awaited after the RPC
//! returns. Both halves share a registry of what was subscribed, so a timeout
//! can name every subject and predicate that was waiting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use super::{MatchOutcome, MatchedEvent};
use crate::error::{HarnessError, HarnessResult};

#[derive(Default)]
struct Registry {
    expectations: Mutex<Vec<(String, String)>>,
    decode_failures: AtomicU64,
    dropped_matches: AtomicU64,
}

/// Create a bounded match channel. A capacity of zero is raised to one.
pub fn match_channel(capacity: usize) -> (MatchSender, MatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let registry = Arc::new(Registry::default());
    (
        MatchSender {
            tx,
            registry: Arc::clone(&registry),
        },
        MatchReceiver { rx, registry },
    )
}

/// Sending half, cloned into each subscription's delivery handler.
#[derive(Clone)]
pub struct MatchSender {
    tx: mpsc::Sender<MatchOutcome>,
    registry: Arc<Registry>,
}

impl MatchSender {
    pub(crate) fn register(&self, subject: &str, predicate: &str) {
        self.registry
            .expectations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((subject.to_string(), predicate.to_string()));
    }

    pub(crate) fn record_decode_failure(&self) {
        self.registry.decode_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_dropped_match(&self) {
        self.registry.dropped_matches.fetch_add(1, Ordering::SeqCst);
    }

    /// Never blocks; a full or closed channel is returned to the caller.
    pub(crate) fn try_send(&self, outcome: MatchOutcome) -> Result<(), TrySendError<MatchOutcome>> {
        self.tx.try_send(outcome)
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Receiving half, awaited by the scenario.
pub struct MatchReceiver {
    rx: mpsc::Receiver<MatchOutcome>,
    registry: Arc<Registry>,
}

impl fmt::Debug for MatchReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchReceiver")
            .field("expectation", &self.expectation())
            .field("decode_failures", &self.decode_failures())
            .field("dropped_matches", &self.dropped_matches())
            .finish()
    }
}

impl MatchReceiver {
    /// Wait for one match, for at most `deadline`.
    ///
    /// # Errors
    /// * [`HarnessError::Timeout`] when nothing matched in time. It names every
    ///   subject and predicate registered on this channel.
    /// * [`HarnessError::PredicatePanicked`] when a predicate panicked on the
    ///   delivery task.
    /// * [`HarnessError::MatchChannelClosed`] when every subscription feeding
    ///   this channel is gone.
    pub async fn await_match(&mut self, deadline: Duration) -> HarnessResult<MatchedEvent> {
        let started = Instant::now();
        self.next_before(started, started + deadline).await
    }

    /// Wait for `count` matches under one shared deadline.
    pub async fn await_matches(
        &mut self,
        count: usize,
        deadline: Duration,
    ) -> HarnessResult<Vec<MatchedEvent>> {
        let started = Instant::now();
        let until = started + deadline;
        let mut matched = Vec::with_capacity(count);
        while matched.len() < count {
            matched.push(self.next_before(started, until).await?);
        }
        Ok(matched)
    }

    /// Take an already-delivered outcome without waiting.
    pub fn try_next(&mut self) -> Option<MatchOutcome> {
        self.rx.try_recv().ok()
    }

    /// Subjects registered on this channel, deduplicated, in registration
    /// order.
    pub fn subjects(&self) -> Vec<String> {
        let expectations = self
            .registry
            .expectations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut subjects: Vec<String> = Vec::new();
        for (subject, _) in expectations.iter() {
            if !subjects.contains(subject) {
                subjects.push(subject.clone());
            }
        }
        subjects
    }

    /// Human-readable summary of the registered predicates. A predicate
    /// registered on several subjects is listed once with all of them.
    pub fn expectation(&self) -> String {
        let expectations = self
            .registry
            .expectations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if expectations.is_empty() {
            return "a matching event".to_string();
        }
        let mut grouped: Vec<(&str, Vec<&str>)> = Vec::new();
        for (subject, predicate) in expectations.iter() {
            match grouped.iter_mut().find(|(p, _)| *p == predicate.as_str()) {
                Some((_, subjects)) => {
                    if !subjects.contains(&subject.as_str()) {
                        subjects.push(subject.as_str());
                    }
                }
                None => grouped.push((predicate.as_str(), vec![subject.as_str()])),
            }
        }
        grouped
            .iter()
            .map(|(predicate, subjects)| format!("{} on {}", predicate, subjects.join(", ")))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Undecodable messages seen by any subscription feeding this channel.
    pub fn decode_failures(&self) -> u64 {
        self.registry.decode_failures.load(Ordering::SeqCst)
    }

    /// Matches thrown away because this channel was full.
    pub fn dropped_matches(&self) -> u64 {
        self.registry.dropped_matches.load(Ordering::SeqCst)
    }

    async fn next_before(&mut self, started: Instant, until: Instant) -> HarnessResult<MatchedEvent> {
        match tokio::time::timeout_at(until, self.rx.recv()).await {
            Ok(Some(MatchOutcome::Matched(event))) => {
                debug!(
                    "Matched message {} on '{}' after {:?}",
                    event.sequence,
                    event.subject,
                    started.elapsed()
                );
                Ok(event)
            }
            Ok(Some(MatchOutcome::PredicateFailed {
                subject,
                predicate,
                message,
            })) => Err(HarnessError::PredicatePanicked {
                subject,
                predicate,
                message,
            }),
            Ok(None) => Err(HarnessError::MatchChannelClosed {
                subjects: self.subjects(),
                expectation: self.expectation(),
            }),
            Err(_) => {
                let error = HarnessError::Timeout {
                    subjects: self.subjects(),
                    elapsed: started.elapsed(),
                    expectation: self.expectation(),
                    decode_failures: self.decode_failures(),
                    dropped_matches: self.dropped_matches(),
                };
                warn!("{}", error);
                Err(error)
            }
        }
    }
}

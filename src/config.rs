//! Harness configuration.
//!
//! [`HarnessConfig`] holds the knobs shared by every scenario of a run:
//! the token-exchange applicant, subscription timing, the readiness budget
//! and match-channel sizing. It deserializes from JSON with every field
//! optional, and can be assembled with [`HarnessConfigBuilder`].
//!
//! Durations are written as milliseconds:
//!
//! ```rust
//! use usermgmt_harness::config::HarnessConfig;
//! use std::time::Duration;
//!
//! let config = HarnessConfig::from_json(r#"{"event_deadline": 2000}"#).unwrap();
//! assert_eq!(config.event_deadline, Duration::from_secs(2));
//! assert_eq!(config.ack_wait, Duration::from_secs(2));
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::SubscribeOptions;
use crate::error::{HarnessError, HarnessResult};
use crate::events::{SUBJECT_USER_CREATED, SUBJECT_USER_UPDATED};
use crate::readiness::RetryPolicy;

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// How long to wait for the API to become usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Applicant id presented to the token exchanger.
    pub applicant: String,
    /// Redelivery delay of unacknowledged messages.
    #[serde(with = "millis")]
    pub ack_wait: Duration,
    /// Upper bound on waiting for a matching event.
    #[serde(with = "millis")]
    pub event_deadline: Duration,
    pub readiness: ReadinessConfig,
    pub match_channel_capacity: usize,
    pub max_deliver: u32,
    /// Subjects a workflow subscribes to.
    pub subjects: Vec<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            applicant: "usermgmt-harness".to_string(),
            ack_wait: Duration::from_secs(2),
            event_deadline: Duration::from_secs(10),
            readiness: ReadinessConfig::default(),
            match_channel_capacity: 4,
            max_deliver: 5,
            subjects: vec![
                SUBJECT_USER_CREATED.to_string(),
                SUBJECT_USER_UPDATED.to_string(),
            ],
        }
    }
}

impl HarnessConfig {
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::new()
    }

    /// Parse and validate a JSON document. Missing fields take their
    /// defaults.
    pub fn from_json(json: &str) -> HarnessResult<Self> {
        let config: HarnessConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.applicant.is_empty() {
            return Err(HarnessError::invalid_configuration(
                "applicant cannot be empty",
            ));
        }
        if self.readiness.max_attempts == 0 {
            return Err(HarnessError::invalid_configuration(
                "readiness.max_attempts must be at least 1",
            ));
        }
        if self.match_channel_capacity == 0 {
            return Err(HarnessError::invalid_configuration(
                "match_channel_capacity must be at least 1",
            ));
        }
        if self.max_deliver == 0 {
            return Err(HarnessError::invalid_configuration(
                "max_deliver must be at least 1",
            ));
        }
        if self.event_deadline.is_zero() {
            return Err(HarnessError::invalid_configuration(
                "event_deadline cannot be zero",
            ));
        }
        if self.subjects.is_empty() || self.subjects.iter().any(|s| s.trim().is_empty()) {
            return Err(HarnessError::invalid_configuration(
                "subjects must be a non-empty list of subject names",
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> HarnessResult<RetryPolicy> {
        RetryPolicy::new(self.readiness.max_attempts, self.readiness.interval)
    }

    /// Manual-ack subscription options watermarked at `start_time`.
    pub fn subscribe_options(&self, start_time: DateTime<Utc>) -> SubscribeOptions {
        SubscribeOptions::new()
            .start_time(start_time)
            .manual_ack(self.ack_wait)
            .max_deliver(self.max_deliver)
    }
}

/// Builder for [`HarnessConfig`].
#[derive(Debug, Clone, Default)]
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_applicant(mut self, applicant: impl Into<String>) -> Self {
        self.config.applicant = applicant.into();
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.config.ack_wait = ack_wait;
        self
    }

    pub fn with_event_deadline(mut self, deadline: Duration) -> Self {
        self.config.event_deadline = deadline;
        self
    }

    pub fn with_readiness(mut self, max_attempts: u32, interval: Duration) -> Self {
        self.config.readiness = ReadinessConfig {
            max_attempts,
            interval,
        };
        self
    }

    pub fn with_match_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.match_channel_capacity = capacity;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.config.max_deliver = max_deliver;
        self
    }

    pub fn with_subjects<I, T>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.config.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> HarnessResult<HarnessConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

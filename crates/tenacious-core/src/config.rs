//! Queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::queue::RetryPolicy;

/// Settings for one [`QueueCore`](crate::queue::QueueCore) instance.
///
/// On the wire the retry period is expressed in milliseconds:
///
/// ```toml
/// name = "billing"
/// concurrency = 4
/// retry_period_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Label used in logs for the dispatcher, scheduler and workers.
    pub name: String,

    /// Number of worker tasks.
    pub concurrency: usize,

    /// Fixed delay between a failed attempt and the request's return to the pending list.
    #[serde(rename = "retry_period_ms", with = "duration_ms")]
    pub retry_period: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "queue".to_string(),
            concurrency: 1,
            retry_period: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry_period(mut self, retry_period: Duration) -> Self {
        self.retry_period = retry_period;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry_period)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::Configuration("empty queue name".to_string()));
        }
        if self.concurrency == 0 {
            return Err(QueueError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, QueueError> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| QueueError::Configuration(format!("toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

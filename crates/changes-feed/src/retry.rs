//! Reconnect backoff policy.
//!
//! Delays grow exponentially from `min_delay`, capped at `max_delay`, with
//! up to 50% additive jitter. The jitter never exceeds the gap to the next
//! exponential step, so consecutive delays never shrink.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff policy for one failure episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    #[serde(rename = "min_delay_ms", with = "millis")]
    pub min_delay: Duration,
    /// Upper bound for any delay.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Retries allowed per episode before giving up.
    pub retries: u32,
    /// Randomize delays.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            retries: 5,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the first delay.
    #[must_use]
    pub const fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    /// Builder: set the delay cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Builder: set retries per episode.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Builder: enable/disable jitter.
    #[must_use]
    pub const fn with_jitter_enabled(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Un-jittered delay for a 0-indexed attempt.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(30);
        let base_ms = duration_ms(self.min_delay).saturating_mul(1u64 << exp);
        Duration::from_millis(base_ms).min(self.max_delay)
    }

    /// Delay for a 0-indexed attempt with a jitter factor in `[0, 1)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }

        let spread = duration_ms(base) as f64 * 0.5 * jitter_factor.clamp(0.0, 1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let extra = Duration::from_millis(spread as u64);
        (base + extra).min(self.max_delay)
    }

    /// Delay for a 0-indexed attempt, or `None` once the budget is spent.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.retries {
            return None;
        }
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.0..1.0)
        } else {
            0.0
        };
        Some(self.delay_for_attempt(attempt, factor))
    }
}

/// Progress through the current failure episode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    /// Fresh episode.
    #[must_use]
    pub const fn new() -> Self {
        Self { attempts: 0 }
    }

    /// Retries scheduled so far in this episode.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether a failure episode is in progress.
    #[must_use]
    pub const fn is_recovering(&self) -> bool {
        self.attempts > 0
    }

    /// Record a failure and return the delay before the next attempt.
    ///
    /// Returns `None` when the policy allows no further retries.
    pub fn record_failure(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        let delay = policy.next_delay(self.attempts)?;
        self.attempts += 1;
        Some(delay)
    }

    /// Data is flowing again; the next failure starts a new episode.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(super::duration_ms(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Backoff policies: pure functions from retry attempt to wait duration.
//!
//! Every policy returns [`Duration::ZERO`] for attempt 0 and is monotonically
//! non-decreasing in the attempt number. Growth constants are configuration,
//! never hard-coded at call sites.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maps a retry attempt (1 = first retry) to the delay before it.
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;

    /// Maximum number of retries after the initial attempt.
    fn max_retry(&self) -> u32;
}

/// Shared knobs of the growing policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffState {
    /// Starting exponent (exponential) or multiplier (multiplicative).
    pub counter: u32,
    /// Retry ceiling.
    pub max_retry: u32,
    /// Base delay unit in milliseconds.
    pub seed_ms: u64,
}

fn capped(ms: f64, max_delay: Option<Duration>) -> Duration {
    let ceiling = max_delay.map(|d| d.as_millis() as f64).unwrap_or(u64::MAX as f64);
    let ms = if ms.is_finite() { ms.min(ceiling) } else { ceiling };
    Duration::from_millis(ms.max(0.0) as u64)
}

// ── Exponential ──────────────────────────────────────────────────────

/// `seed * base^(counter + attempt - 1)`, optionally capped.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    state: BackoffState,
    base: f64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    /// `base` below 1.0 would shrink delays, so it is clamped to 1.0.
    pub fn new(state: BackoffState, base: f64) -> Self {
        let base = if base.is_finite() { base.max(1.0) } else { 2.0 };
        Self { state, base, max_delay: None }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = self.state.counter.saturating_add(attempt - 1);
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let ms = self.state.seed_ms as f64 * self.base.powi(exponent);
        capped(ms, self.max_delay)
    }

    fn max_retry(&self) -> u32 {
        self.state.max_retry
    }
}

// ── Multiplicative ───────────────────────────────────────────────────

/// `seed * counter * attempt`: linear growth, optionally capped.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplicativeBackoff {
    state: BackoffState,
    max_delay: Option<Duration>,
}

impl MultiplicativeBackoff {
    /// A zero counter would flatten every delay to zero, so it is raised to 1.
    pub fn new(mut state: BackoffState) -> Self {
        state.counter = state.counter.max(1);
        Self { state, max_delay: None }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }
}

impl BackoffPolicy for MultiplicativeBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let ms = self.state.seed_ms as f64 * self.state.counter as f64 * attempt as f64;
        capped(ms, self.max_delay)
    }

    fn max_retry(&self) -> u32 {
        self.state.max_retry
    }
}

// ── Fixed ────────────────────────────────────────────────────────────

/// Constant delay between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedBackoff {
    delay: Duration,
    max_retry: u32,
}

impl FixedBackoff {
    pub fn new(delay: Duration, max_retry: u32) -> Self {
        Self { delay, max_retry }
    }
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 { Duration::ZERO } else { self.delay }
    }

    fn max_retry(&self) -> u32 {
        self.max_retry
    }
}

// ── Settings (config-facing) ─────────────────────────────────────────

/// Serializable policy selection, as written in job definitions.
///
/// ```toml
/// [backoff]
/// kind = "exponential"
/// seed_ms = 500
/// base = 2.0
/// max_retry = 5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffSettings {
    Exponential {
        seed_ms: u64,
        #[serde(default = "default_base")]
        base: f64,
        #[serde(default)]
        counter: u32,
        max_retry: u32,
        max_delay_ms: Option<u64>,
    },
    Multiplicative {
        seed_ms: u64,
        #[serde(default = "default_multiplier")]
        counter: u32,
        max_retry: u32,
        max_delay_ms: Option<u64>,
    },
    Fixed {
        delay_ms: u64,
        max_retry: u32,
    },
}

fn default_base() -> f64 {
    2.0
}

fn default_multiplier() -> u32 {
    1
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self::Exponential {
            seed_ms: 1_000,
            base: default_base(),
            counter: 0,
            max_retry: 3,
            max_delay_ms: Some(60_000),
        }
    }
}

impl BackoffSettings {
    pub fn max_retry(&self) -> u32 {
        match self {
            Self::Exponential { max_retry, .. }
            | Self::Multiplicative { max_retry, .. }
            | Self::Fixed { max_retry, .. } => *max_retry,
        }
    }

    pub fn build(&self) -> Arc<dyn BackoffPolicy> {
        match *self {
            Self::Exponential { seed_ms, base, counter, max_retry, max_delay_ms } => {
                let policy =
                    ExponentialBackoff::new(BackoffState { counter, max_retry, seed_ms }, base);
                match max_delay_ms {
                    Some(ms) => Arc::new(policy.with_max_delay(Duration::from_millis(ms))),
                    None => Arc::new(policy),
                }
            }
            Self::Multiplicative { seed_ms, counter, max_retry, max_delay_ms } => {
                let policy = MultiplicativeBackoff::new(BackoffState {
                    counter,
                    max_retry,
                    seed_ms,
                });
                match max_delay_ms {
                    Some(ms) => Arc::new(policy.with_max_delay(Duration::from_millis(ms))),
                    None => Arc::new(policy),
                }
            }
            Self::Fixed { delay_ms, max_retry } => {
                Arc::new(FixedBackoff::new(Duration::from_millis(delay_ms), max_retry))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(counter: u32, seed_ms: u64) -> BackoffState {
        BackoffState { counter, max_retry: 5, seed_ms }
    }

    fn assert_monotonic(policy: &dyn BackoffPolicy) {
        let mut prev = Duration::ZERO;
        for attempt in 0..40 {
            let d = policy.delay(attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            prev = d;
        }
    }

    #[test]
    fn exponential_grows_from_seed() {
        let policy = ExponentialBackoff::new(state(0, 100), 2.0);
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_monotonic(&policy);
    }

    #[test]
    fn exponential_counter_shifts_exponent() {
        let policy = ExponentialBackoff::new(state(2, 100), 2.0);
        assert_eq!(policy.delay(1), Duration::from_millis(400));
    }

    #[test]
    fn exponential_respects_cap_and_huge_attempts() {
        let policy =
            ExponentialBackoff::new(state(0, 1_000), 3.0).with_max_delay(Duration::from_secs(30));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
        assert_monotonic(&policy);
    }

    #[test]
    fn exponential_base_below_one_is_clamped() {
        let policy = ExponentialBackoff::new(state(0, 100), 0.5);
        assert_monotonic(&policy);
    }

    #[test]
    fn multiplicative_is_linear() {
        let policy = MultiplicativeBackoff::new(state(3, 100));
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(300));
        assert_eq!(policy.delay(4), Duration::from_millis(1_200));
        assert_monotonic(&policy);
    }

    #[test]
    fn multiplicative_zero_counter_still_waits() {
        let policy = MultiplicativeBackoff::new(state(0, 100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
    }

    #[test]
    fn fixed_is_flat_after_zero() {
        let policy = FixedBackoff::new(Duration::from_secs(5), 2);
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(9), Duration::from_secs(5));
        assert_eq!(policy.max_retry(), 2);
    }

    #[test]
    fn settings_build_matching_policy() {
        let settings: BackoffSettings = serde_json::from_str(
            r#"{"kind":"multiplicative","seed_ms":250,"counter":2,"max_retry":4}"#,
        )
        .unwrap();
        let policy = settings.build();
        assert_eq!(policy.max_retry(), 4);
        assert_eq!(policy.delay(2), Duration::from_millis(1_000));

        let default = BackoffSettings::default().build();
        assert_eq!(default.delay(1), Duration::from_secs(1));
        assert_eq!(default.max_retry(), 3);
    }
}

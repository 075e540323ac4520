use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay used when a job carries no backoff policy at all.
pub const DEFAULT_DELAY_SECONDS: f64 = 10.0;
/// Initial delay of a structured policy when none is given.
pub const DEFAULT_INITIAL_DELAY_SECONDS: f64 = 1.0;
/// Cap of a structured policy when none is given.
pub const DEFAULT_MAX_DELAY_SECONDS: f64 = 3600.0;
/// Upper bound of any delay, whatever the policy says: one year.
pub const MAX_DELAY_SECONDS: f64 = 365.0 * 24.0 * 3600.0;

/// Growth rule of a structured backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always wait `initial_delay`
    Fixed,
    /// `initial_delay * factor^(attempt - 1)`
    Exponential,
    /// `initial_delay + factor * (attempt - 1)`
    Linear,
}

/// A structured policy `{ strategy, initialDelay, factor, maxDelay }`, all values in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<f64>,
}

impl BackoffPolicy {
    pub fn fixed(delay: f64) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            initial_delay: Some(delay),
            factor: None,
            max_delay: None,
        }
    }

    pub fn exponential(initial_delay: f64, factor: f64, max_delay: f64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay: Some(initial_delay),
            factor: Some(factor),
            max_delay: Some(max_delay),
        }
    }

    pub fn linear(initial_delay: f64, step: f64, max_delay: f64) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            initial_delay: Some(initial_delay),
            factor: Some(step),
            max_delay: Some(max_delay),
        }
    }

    fn delay_seconds(&self, attempt: u32) -> f64 {
        let initial = self.initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY_SECONDS);
        let max = self.max_delay.unwrap_or(DEFAULT_MAX_DELAY_SECONDS);
        let n = f64::from(attempt.max(1) - 1);

        match self.strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Exponential => {
                let factor = self.factor.unwrap_or(2.0);
                (initial * factor.powf(n)).min(max)
            }
            BackoffStrategy::Linear => {
                let factor = self.factor.unwrap_or(1.0);
                (initial + factor * n).min(max)
            }
        }
    }
}

/// Retry backoff attached to a job when it is dispatched.
///
/// Serialized untagged so a payload can carry any of `5`, `[1, 2, 4]` or
/// `{"strategy": "exponential", "initialDelay": 1, "factor": 2, "maxDelay": 60}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Backoff {
    /// Same delay for every attempt
    Flat(f64),
    /// Per-attempt delays, the last one repeats once the list is exhausted
    List(Vec<f64>),
    Policy(BackoffPolicy),
}

impl From<f64> for Backoff {
    fn from(value: f64) -> Self {
        Backoff::Flat(value)
    }
}

impl From<u64> for Backoff {
    fn from(value: u64) -> Self {
        Backoff::Flat(value as f64)
    }
}

impl From<Vec<f64>> for Backoff {
    fn from(value: Vec<f64>) -> Self {
        Backoff::List(value)
    }
}

impl From<BackoffPolicy> for Backoff {
    fn from(value: BackoffPolicy) -> Self {
        Backoff::Policy(value)
    }
}

impl Backoff {
    /// Raw delay for this policy, before sanitizing
    fn raw_delay_seconds(&self, attempt: u32) -> f64 {
        match self {
            Backoff::Flat(seconds) => *seconds,
            Backoff::List(delays) => {
                let index = (attempt.max(1) as usize - 1).min(delays.len().saturating_sub(1));
                delays.get(index).copied().unwrap_or(DEFAULT_DELAY_SECONDS)
            }
            Backoff::Policy(policy) => policy.delay_seconds(attempt),
        }
    }
}

/// Computes how many seconds to wait before retrying a job that just failed its `attempt`-th try
///
/// # Arguments
///
/// * `attempt` - The attempt that failed, starting at 1. `0` is treated as `1`.
/// * `backoff` - The retry policy snapshotted on the job, if any.
///
/// # Returns
///
/// A finite number of seconds between `0` and [`MAX_DELAY_SECONDS`]. Negative, NaN or
/// infinite delays come out as `0`, larger ones are capped.
///
/// ```rust
/// use jobqueue_backoff::{delay_seconds, Backoff};
///
/// let backoff = Backoff::List(vec![1.0, 2.0, 4.0]);
/// assert_eq!(delay_seconds(1, Some(&backoff)), 1.0);
/// assert_eq!(delay_seconds(5, Some(&backoff)), 4.0);
/// assert_eq!(delay_seconds(1, None), 10.0);
/// ```
pub fn delay_seconds(attempt: u32, backoff: Option<&Backoff>) -> f64 {
    let raw = match backoff {
        Some(backoff) => backoff.raw_delay_seconds(attempt),
        None => DEFAULT_DELAY_SECONDS,
    };

    if raw.is_finite() && raw > 0.0 {
        raw.min(MAX_DELAY_SECONDS)
    } else {
        0.0
    }
}

/// Same as [`delay_seconds`] as a [`Duration`]
pub fn delay(attempt: u32, backoff: Option<&Backoff>) -> Duration {
    Duration::from_secs_f64(delay_seconds(attempt, backoff))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_number_is_used_for_every_attempt() {
        let backoff = Backoff::Flat(5.0);
        for attempt in 1..10 {
            assert_eq!(delay_seconds(attempt, Some(&backoff)), 5.0);
        }
    }

    #[test]
    fn list_is_indexed_then_clamped_to_last() {
        let backoff = Backoff::List(vec![1.0, 2.0, 4.0]);
        assert_eq!(delay_seconds(1, Some(&backoff)), 1.0);
        assert_eq!(delay_seconds(2, Some(&backoff)), 2.0);
        assert_eq!(delay_seconds(3, Some(&backoff)), 4.0);
        for attempt in 4..20 {
            assert_eq!(delay_seconds(attempt, Some(&backoff)), 4.0);
        }
    }

    #[test]
    fn empty_list_falls_back_to_default() {
        let backoff = Backoff::List(vec![]);
        assert_eq!(delay_seconds(1, Some(&backoff)), DEFAULT_DELAY_SECONDS);
    }

    #[test]
    fn no_policy_is_ten_seconds() {
        assert_eq!(delay_seconds(1, None), 10.0);
        assert_eq!(delay_seconds(7, None), 10.0);
    }

    #[test]
    fn fixed_strategy_uses_initial_delay() {
        let backoff = Backoff::Policy(BackoffPolicy::fixed(3.0));
        assert_eq!(delay_seconds(1, Some(&backoff)), 3.0);
        assert_eq!(delay_seconds(9, Some(&backoff)), 3.0);
    }

    #[test]
    fn exponential_is_non_decreasing_and_capped() {
        let backoff = Backoff::Policy(BackoffPolicy::exponential(1.5, 2.0, 60.0));
        let mut previous = 0.0;
        for attempt in 1..64 {
            let delay = delay_seconds(attempt, Some(&backoff));
            assert!(delay >= previous, "attempt {attempt}: {delay} < {previous}");
            assert!(delay <= 60.0);
            previous = delay;
        }
        assert_eq!(delay_seconds(1, Some(&backoff)), 1.5);
        assert_eq!(delay_seconds(3, Some(&backoff)), 6.0);
        assert_eq!(delay_seconds(40, Some(&backoff)), 60.0);
    }

    #[test]
    fn linear_grows_by_factor() {
        let backoff = Backoff::Policy(BackoffPolicy::linear(2.0, 3.0, 10.0));
        assert_eq!(delay_seconds(1, Some(&backoff)), 2.0);
        assert_eq!(delay_seconds(2, Some(&backoff)), 5.0);
        assert_eq!(delay_seconds(3, Some(&backoff)), 8.0);
        assert_eq!(delay_seconds(4, Some(&backoff)), 10.0);
    }

    #[test]
    fn negative_and_nan_delays_become_zero() {
        assert_eq!(delay_seconds(1, Some(&Backoff::Flat(-4.0))), 0.0);
        assert_eq!(delay_seconds(1, Some(&Backoff::Flat(f64::NAN))), 0.0);
        assert_eq!(delay_seconds(2, Some(&Backoff::List(vec![1.0, -1.0]))), 0.0);
        assert_eq!(delay(1, Some(&Backoff::Flat(f64::NAN))), Duration::ZERO);
    }

    #[test]
    fn huge_delays_are_capped() {
        assert_eq!(delay_seconds(1, Some(&Backoff::Flat(1e30))), MAX_DELAY_SECONDS);
        assert_eq!(
            delay(1, Some(&Backoff::Flat(1e30))),
            Duration::from_secs(365 * 24 * 3600)
        );
        assert_eq!(
            delay(3, Some(&Backoff::List(vec![1.0, 2.0, f64::MAX]))),
            Duration::from_secs(365 * 24 * 3600)
        );
        let runaway = BackoffPolicy::exponential(1.0, 1e10, f64::MAX);
        assert_eq!(
            delay_seconds(40, Some(&Backoff::Policy(runaway))),
            MAX_DELAY_SECONDS
        );
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let backoff = Backoff::List(vec![7.0, 8.0]);
        assert_eq!(delay_seconds(0, Some(&backoff)), 7.0);
    }

    #[test]
    fn deserializes_every_shape() {
        let flat: Backoff = serde_json::from_str("5").unwrap();
        assert_eq!(flat, Backoff::Flat(5.0));

        let list: Backoff = serde_json::from_str("[1, 2, 4]").unwrap();
        assert_eq!(list, Backoff::List(vec![1.0, 2.0, 4.0]));

        let policy: Backoff = serde_json::from_str(
            r#"{"strategy": "exponential", "initialDelay": 1, "factor": 3, "maxDelay": 30}"#,
        )
        .unwrap();
        assert_eq!(
            policy,
            Backoff::Policy(BackoffPolicy::exponential(1.0, 3.0, 30.0))
        );
    }
}

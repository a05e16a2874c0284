//! Retry policy: how many attempts a step gets and how long to wait
//! between them.

use crate::config::RetryConfig;
use crate::plan::Step;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
    step_budget: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make attempt number `attempt` after waiting `delay`.
    RetryAfter { attempt: u32, delay: Duration },
    Exhausted(Exhaustion),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exhaustion {
    NotRetryable,
    AttemptsUsed { attempts: u32 },
    BudgetExceeded { elapsed: Duration },
}

impl std::fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exhaustion::NotRetryable => write!(f, "step is not retryable"),
            Exhaustion::AttemptsUsed { attempts } => write!(f, "all {attempts} attempts used"),
            Exhaustion::BudgetExceeded { elapsed } => {
                write!(f, "retry budget exceeded after {}s", elapsed.as_secs())
            }
        }
    }
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
            step_budget: config.step_budget(),
        }
    }

    /// `base * 2^(retry-1)` capped at `max_delay`, without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff plus uniform jitter in `[0, backoff * jitter_ratio]`.
    pub fn delay_with_jitter<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let max_jitter = delay.as_secs_f64() * self.jitter_ratio;
        delay + Duration::from_secs_f64(rng.gen_range(0.0..=max_jitter))
    }

    /// Upper bound any single wait can reach.
    pub fn max_wait(&self) -> Duration {
        self.max_delay + Duration::from_secs_f64(self.max_delay.as_secs_f64() * self.jitter_ratio)
    }

    /// Decide what follows a failed attempt.
    ///
    /// `attempts_made` counts every attempt recorded for the step; `granted`
    /// is the number of extra attempts the operator has allowed.
    pub fn next<R: Rng + ?Sized>(
        &self,
        step: &Step,
        attempts_made: u32,
        granted: u32,
        first_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> RetryDecision {
        if !step.retryable && granted == 0 {
            return RetryDecision::Exhausted(Exhaustion::NotRetryable);
        }
        let allowed = step.max_attempts() + granted;
        if attempts_made >= allowed {
            return RetryDecision::Exhausted(Exhaustion::AttemptsUsed {
                attempts: attempts_made,
            });
        }

        let delay = self.delay_with_jitter(attempts_made, rng);
        let elapsed = (now - first_started_at).to_std().unwrap_or_default();
        if elapsed + delay > self.step_budget {
            return RetryDecision::Exhausted(Exhaustion::BudgetExceeded { elapsed });
        }

        RetryDecision::RetryAfter {
            attempt: attempts_made + 1,
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::tests::step;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_ratio: jitter,
            step_retry_budget_secs: 60,
        })
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let p = policy(0.0);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(4), Duration::from_millis(800));
        assert_eq!(p.backoff(5), Duration::from_millis(1000));
        assert_eq!(p.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = policy(0.5);
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 1..10 {
            let d = p.delay_with_jitter(retry, &mut rng);
            assert!(d >= p.backoff(retry));
            assert!(d <= p.max_wait());
        }
    }

    #[test]
    fn test_attempts_allowed() {
        let p = policy(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let mut s = step(0, "a");
        s.max_retries = 2;
        let now = Utc::now();

        assert_eq!(
            p.next(&s, 1, 0, now, now, &mut rng),
            RetryDecision::RetryAfter {
                attempt: 2,
                delay: Duration::from_millis(100)
            }
        );
        assert!(matches!(
            p.next(&s, 3, 0, now, now, &mut rng),
            RetryDecision::Exhausted(Exhaustion::AttemptsUsed { attempts: 3 })
        ));
        // An operator grant extends the window by one
        assert!(matches!(
            p.next(&s, 3, 1, now, now, &mut rng),
            RetryDecision::RetryAfter { attempt: 4, .. }
        ));
    }

    #[test]
    fn test_non_retryable_gets_one_attempt() {
        let p = policy(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let mut s = step(0, "a");
        s.retryable = false;
        s.max_retries = 5;
        let now = Utc::now();
        assert_eq!(
            p.next(&s, 1, 0, now, now, &mut rng),
            RetryDecision::Exhausted(Exhaustion::NotRetryable)
        );
    }

    #[test]
    fn test_budget_exceeded() {
        let p = policy(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let s = step(0, "a");
        let first = Utc::now();
        let now = first + chrono::Duration::seconds(61);
        assert!(matches!(
            p.next(&s, 1, 0, first, now, &mut rng),
            RetryDecision::Exhausted(Exhaustion::BudgetExceeded { .. })
        ));
    }
}

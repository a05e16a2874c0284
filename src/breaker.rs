//! Per-session circuit breaker
//!
//! ```text
//! Closed ──(threshold failures within window)──▶ Open
//!   ▲                                              │
//!   │                                     (cool-down elapsed)
//!   │                                              ▼
//!   └────────(probe succeeds)────────────── HalfOpen ──(probe fails)──▶ Open
//! ```
//!
//! The breaker is plain data: it is serialized into the session row after
//! every change so a restart sees the same state. All methods take `now`
//! explicitly.

use crate::config::BreakerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Answer to "may the engine make an automatic attempt now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Half-open: exactly one attempt is let through
    Probe,
    Refused { retry_after: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitBreaker {
    state: BreakerState,
    /// Consecutive failures (no success in between), oldest first
    #[serde(default)]
    failures: Vec<DateTime<Utc>>,
    #[serde(default)]
    opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// When the current open period ends, if open.
    pub fn retry_after(&self, config: &BreakerConfig) -> Option<DateTime<Utc>> {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(at)) => Some(at + config.cooldown()),
            _ => None,
        }
    }

    /// Gate an automatic attempt. Moves Open → HalfOpen once the cool-down
    /// has elapsed.
    pub fn allow(&mut self, now: DateTime<Utc>, config: &BreakerConfig) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => Admission::Probe,
            BreakerState::Open => {
                let retry_after = self
                    .retry_after(config)
                    .unwrap_or(now);
                if now >= retry_after {
                    info!("circuit breaker half-open, allowing one probe attempt");
                    self.state = BreakerState::HalfOpen;
                    Admission::Probe
                } else {
                    Admission::Refused { retry_after }
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!("circuit breaker closed after successful probe");
        }
        self.state = BreakerState::Closed;
        self.failures.clear();
        self.opened_at = None;
    }

    /// Record a failed attempt. Returns `true` if this failure opened the breaker.
    pub fn record_failure(&mut self, now: DateTime<Utc>, config: &BreakerConfig) -> bool {
        let window_start = now - config.window();
        self.failures.retain(|t| *t >= window_start);
        self.failures.push(now);
        match self.state {
            BreakerState::HalfOpen => {
                warn!("probe attempt failed, circuit breaker re-opened");
                self.open(now);
                true
            }
            BreakerState::Open => false,
            BreakerState::Closed => {
                if self.failures.len() >= config.failure_threshold as usize {
                    warn!(
                        failures = self.failures.len(),
                        window_secs = config.window_secs,
                        "failure threshold reached, circuit breaker opened"
                    );
                    self.open(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
    }
}

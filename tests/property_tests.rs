//! Property-based tests for homestead
//!
//! These tests verify:
//! - Retry delays stay inside the configured envelope
//! - The circuit breaker only opens at its threshold
//! - Redaction never lets a recognised secret through, inline or as a flag argument
//! - Plan validation accepts exactly the well-ordered plans
//! - Status strings round-trip

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{argv, plan, step};
use homestead::breaker::{Admission, BreakerState, CircuitBreaker};
use homestead::config::{BreakerConfig, RetryConfig};
use homestead::redact::{self, MASK};
use homestead::retry::{RetryDecision, RetryPolicy};
use homestead::session::SessionStatus;
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;

// =============================================================================
// Retry backoff
// =============================================================================

fn retry_config_strategy() -> impl Strategy<Value = RetryConfig> {
    (1u64..2_000, 0u64..120_000, 0.0f64..=1.0).prop_map(|(base, extra, jitter)| RetryConfig {
        base_delay_ms: base,
        max_delay_ms: base + extra,
        jitter_ratio: jitter,
        step_retry_budget_secs: 3_600,
    })
}

proptest! {
    /// Every delay lies in [backoff, max_delay * (1 + jitter)]
    #[test]
    fn delay_is_bounded(config in retry_config_strategy(), retry in 1u32..64, seed in any::<u64>()) {
        let policy = RetryPolicy::new(&config);
        let mut rng = StdRng::seed_from_u64(seed);
        let delay = policy.delay_with_jitter(retry, &mut rng);
        let ceiling = config.max_delay().as_secs_f64() * (1.0 + config.jitter_ratio);

        prop_assert!(delay >= policy.backoff(retry));
        prop_assert!(delay.as_secs_f64() <= ceiling + 1e-6, "{delay:?} > {ceiling}");
        prop_assert!(delay <= policy.max_wait() + Duration::from_micros(1));
    }

    /// Backoff never shrinks as retries accumulate
    #[test]
    fn backoff_is_monotonic(config in retry_config_strategy(), retry in 1u32..63) {
        let policy = RetryPolicy::new(&config);
        prop_assert!(policy.backoff(retry) <= policy.backoff(retry + 1));
    }

    /// A retry is never scheduled past max_retries + granted attempts
    #[test]
    fn retry_respects_attempt_limit(max_retries in 0u32..6, granted in 0u32..3, made in 1u32..12) {
        let policy = RetryPolicy::new(&RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 1,
            jitter_ratio: 0.0,
            step_retry_budget_secs: 3_600,
        });
        let mut s = step(1, "flaky", argv(&["false"]));
        s.max_retries = max_retries;
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(7);

        match policy.next(&s, made, granted, now, now, &mut rng) {
            RetryDecision::RetryAfter { attempt, .. } => {
                prop_assert_eq!(attempt, made + 1);
                prop_assert!(attempt <= max_retries + 1 + granted);
            }
            RetryDecision::Exhausted(_) => prop_assert!(made >= max_retries + 1 + granted),
        }
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

proptest! {
    /// Below the threshold the breaker stays closed; at it, automatic
    /// attempts are refused until the cool-down ends
    #[test]
    fn breaker_opens_exactly_at_threshold(threshold in 1u32..10, failures in 0u32..12) {
        let config = BreakerConfig {
            failure_threshold: threshold,
            window_secs: 300,
            cooldown_secs: 30,
            ..BreakerConfig::default()
        };
        let mut breaker = CircuitBreaker::default();
        let start = Utc::now();
        for i in 0..failures {
            breaker.record_failure(start + ChronoDuration::milliseconds(i64::from(i)), &config);
        }

        let now = start + ChronoDuration::seconds(1);
        if failures < threshold {
            prop_assert_eq!(breaker.state(), BreakerState::Closed);
            prop_assert_eq!(breaker.allow(now, &config), Admission::Allowed);
        } else {
            prop_assert_eq!(breaker.state(), BreakerState::Open);
            let refused = matches!(breaker.allow(now, &config), Admission::Refused { .. });
            prop_assert!(refused);
            let later = now + ChronoDuration::seconds(60);
            prop_assert_eq!(breaker.allow(later, &config), Admission::Probe);
        }
    }

    /// Failures older than the window do not count
    #[test]
    fn breaker_forgets_failures_outside_window(threshold in 2u32..8) {
        let config = BreakerConfig {
            failure_threshold: threshold,
            window_secs: 10,
            ..BreakerConfig::default()
        };
        let mut breaker = CircuitBreaker::default();
        let start = Utc::now();
        for i in 0..threshold - 1 {
            breaker.record_failure(start + ChronoDuration::milliseconds(i64::from(i)), &config);
        }
        let opened = breaker.record_failure(start + ChronoDuration::seconds(60), &config);
        prop_assert!(!opened);
        prop_assert_eq!(breaker.state(), BreakerState::Closed);
    }
}

// =============================================================================
// Redaction
// =============================================================================

fn filler() -> impl Strategy<Value = String> {
    "[ .,;:()\\[\\]-]{0,12}"
}

proptest! {
    /// key=value secrets are masked wherever they appear
    #[test]
    fn keyed_secrets_never_leak(
        key in prop_oneof![Just("password="), Just("PASSWORD: "), Just("token="), Just("api_key="), Just("authkey=")],
        secret in "[A-Za-z0-9]{8,32}",
        before in filler(),
        after in filler(),
    ) {
        let text = format!("{before}{key}{secret}{after}");
        let clean = redact::redact(&text);
        prop_assert!(!clean.contains(&secret), "{clean}");
        prop_assert!(clean.contains(MASK));
    }

    /// API keys with a well-known prefix are masked whole
    #[test]
    fn prefixed_keys_never_leak(
        prefix in prop_oneof![Just("sk-ant-"), Just("sk-"), Just("tskey-auth-")],
        body in "[A-Za-z0-9]{20,48}",
        before in filler(),
    ) {
        let text = format!("{before}{prefix}{body}");
        let clean = redact::redact(&text);
        prop_assert!(!clean.contains(&body), "{clean}");
    }

    /// Command summaries mask secrets passed as arguments
    #[test]
    fn command_summary_masks_arguments(secret in "[A-Za-z0-9]{8,32}") {
        let argv = vec![
            "curl".to_string(),
            "-H".to_string(),
            format!("Authorization: Bearer {secret}"),
            format!("https://example.invalid/?token={secret}"),
        ];
        let summary = redact::command_summary(&argv);
        prop_assert!(!summary.contains(&secret), "{summary}");
    }

    /// A value passed as the argument after a secret flag is masked
    #[test]
    fn flag_separated_secrets_never_leak(
        flag in prop_oneof![
            Just("--password"),
            Just("--authkey"),
            Just("--auth-key"),
            Just("--token"),
            Just("--api-key"),
            Just("--secret"),
        ],
        secret in "[A-Za-z0-9]{8,32}",
        program in prop_oneof![Just("curl"), Just("mysql"), Just("vault")],
    ) {
        let argv = vec![program.to_string(), "up".to_string(), flag.to_string(), secret.clone(), "--verbose".to_string()];
        let summary = redact::command_summary(&argv);
        prop_assert!(!summary.contains(&secret), "{summary}");
        prop_assert!(summary.contains(MASK));
        prop_assert!(summary.ends_with("--verbose"));

        let script = format!("{} up {flag} {secret} --verbose", argv[0]);
        let clean = redact::redact(&script);
        prop_assert!(!clean.contains(&secret), "{clean}");
    }

    /// Excerpts never exceed the limit (plus the elision marker)
    #[test]
    fn excerpt_is_bounded(text in "\\PC{0,600}", limit in 64usize..256) {
        let out = redact::excerpt(&text, limit);
        prop_assert!(out.len() <= limit + '…'.len_utf8());
    }
}

// =============================================================================
// Plan validation
// =============================================================================

proptest! {
    /// Strictly increasing indices with non-empty commands validate
    #[test]
    fn increasing_indices_validate(gaps in prop::collection::vec(1u32..5, 1..12)) {
        let mut index = 0;
        let steps = gaps
            .iter()
            .map(|gap| {
                index += gap;
                step(index, &format!("step{index}"), argv(&["true"]))
            })
            .collect();
        prop_assert!(plan("ordered", steps).validate().is_ok());
    }

    /// Repeating any index is rejected
    #[test]
    fn repeated_index_is_rejected(len in 2usize..10, dup in any::<prop::sample::Index>()) {
        let mut steps: Vec<_> = (1..=len as u32)
            .map(|i| step(i, &format!("step{i}"), argv(&["true"])))
            .collect();
        let at = dup.index(len - 1) + 1;
        steps[at].index = steps[at - 1].index;
        prop_assert!(plan("dup", steps).validate().is_err());
    }
}

// =============================================================================
// Status strings
// =============================================================================

fn session_status_strategy() -> impl Strategy<Value = SessionStatus> {
    prop_oneof![
        Just(SessionStatus::Pending),
        Just(SessionStatus::Running),
        Just(SessionStatus::Paused),
        Just(SessionStatus::Completed),
        Just(SessionStatus::Failed),
        Just(SessionStatus::RolledBack),
    ]
}

proptest! {
    /// SessionStatus: to_string → parse round-trip is identity
    #[test]
    fn session_status_roundtrip(status in session_status_strategy()) {
        let s = status.to_string();
        let parsed: SessionStatus = s.parse().expect("Should parse");
        prop_assert_eq!(status, parsed);
        prop_assert_eq!(s.clone(), s.to_lowercase());
    }
}

//! Geometric backoff policy for the `546 WORKER_LIMIT` transient-fault class.
//!
//! The orchestrator retries a step a bounded number of times when the
//! downstream worker pool reports eviction (`HTTP 546`, body containing
//! `WORKER_LIMIT`). Unlike a general-purpose retry policy, the delay table
//! here is fixed by contract — it is not meant to be tuned per error class,
//! only the jitter fraction is configurable. This mirrors the shape of a
//! generic exponential-backoff module, narrowed to one concrete schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of retry attempts before a step is declared exhausted.
pub const STEP_MAX_RETRIES: u32 = 8;

/// Geometric backoff table in seconds, indexed by `attempt - 1`.
/// Attempts beyond the table length reuse the final entry.
pub const BACKOFF_TABLE_SECONDS: [u64; 8] = [60, 120, 240, 480, 600, 600, 600, 600];

/// Default jitter fraction applied uniformly in both directions (±10%).
pub const DEFAULT_JITTER_FRACTION: f64 = 0.10;

/// The `WORKER_LIMIT` HTTP status and error token the orchestrator classifies on.
pub const WORKER_LIMIT_HTTP_STATUS: u16 = 546;
pub const WORKER_LIMIT_ERROR_CODE: &str = "worker_limit_546";

/// The retry sub-record persisted at `steps[step].retry` while a retry is scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub retry_attempt: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_http_status: u16,
    pub last_error: String,
}

/// Outcome of evaluating the retry policy for a `WORKER_LIMIT` fault.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Schedule another attempt; persist `record` into the step state and yield.
    ScheduleRetry(RetryRecord),
    /// `retry_attempt` exceeded [`STEP_MAX_RETRIES`]; finalize the step as failed.
    Exhausted { attempts_made: u32 },
}

/// Look up the un-jittered base delay (seconds) for a given attempt number
/// (1-indexed: the delay scheduled *after* the first failure is attempt 1).
pub fn base_delay_seconds(attempt: u32) -> u64 {
    let idx = attempt.saturating_sub(1) as usize;
    let idx = idx.min(BACKOFF_TABLE_SECONDS.len() - 1);
    BACKOFF_TABLE_SECONDS[idx]
}

/// Apply uniform jitter in `[-fraction, +fraction]` to a base delay in seconds.
///
/// Uses `rand::random::<f64>()` directly rather than threading a `Rng`
/// through every caller.
pub fn apply_jitter_seconds(base_seconds: u64, fraction: f64) -> u64 {
    if fraction <= 0.0 {
        return base_seconds;
    }
    let r: f64 = rand::random::<f64>(); // in [0, 1)
    let signed = (r * 2.0) - 1.0; // in [-1, 1)
    let delta = (base_seconds as f64) * fraction * signed;
    let jittered = (base_seconds as f64) + delta;
    jittered.max(0.0).round() as u64
}

/// Decide the retry outcome for a step that just observed `WORKER_LIMIT`.
///
/// `prior_attempt` is the `retry_attempt` recorded on the previous failure
/// (0 if this is the first observed fault for this step in its current
/// lifetime). Returns a record to persist, or `Exhausted` once the attempt
/// count has run past [`STEP_MAX_RETRIES`].
pub fn decide_retry(prior_attempt: u32, now: DateTime<Utc>, jitter_fraction: f64) -> RetryDecision {
    let attempt = prior_attempt + 1;
    if attempt > STEP_MAX_RETRIES {
        return RetryDecision::Exhausted {
            attempts_made: prior_attempt,
        };
    }

    let base = base_delay_seconds(attempt);
    let jittered = apply_jitter_seconds(base, jitter_fraction);
    let next_retry_at = now + chrono::Duration::seconds(jittered as i64);

    RetryDecision::ScheduleRetry(RetryRecord {
        retry_attempt: attempt,
        next_retry_at,
        last_http_status: WORKER_LIMIT_HTTP_STATUS,
        last_error: WORKER_LIMIT_ERROR_CODE.to_string(),
    })
}

/// `true` once `next_retry_at` has passed relative to `now`; used by the
/// tick scheduler to decide whether a `retry_delay` step may be retried yet.
pub fn is_due(record: &RetryRecord, now: DateTime<Utc>) -> bool {
    record.next_retry_at <= now
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_matches_table_for_first_eight_attempts() {
        let expected = [60, 120, 240, 480, 600, 600, 600, 600];
        for (i, exp) in expected.iter().enumerate() {
            assert_eq!(base_delay_seconds((i + 1) as u32), *exp);
        }
    }

    #[test]
    fn base_delay_clamps_beyond_table_length() {
        assert_eq!(base_delay_seconds(9), 600);
        assert_eq!(base_delay_seconds(100), 600);
    }

    #[test]
    fn jitter_is_within_tolerance() {
        for _ in 0..200 {
            let jittered = apply_jitter_seconds(600, 0.10);
            assert!(jittered >= 540 && jittered <= 660, "jittered={jittered}");
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        assert_eq!(apply_jitter_seconds(480, 0.0), 480);
    }

    #[test]
    fn decide_retry_schedules_attempt_one_on_first_fault() {
        let now = Utc::now();
        let decision = decide_retry(0, now, 0.0);
        match decision {
            RetryDecision::ScheduleRetry(r) => {
                assert_eq!(r.retry_attempt, 1);
                assert_eq!(r.last_http_status, 546);
                assert_eq!((r.next_retry_at - now).num_seconds(), 60);
            }
            RetryDecision::Exhausted { .. } => panic!("expected schedule"),
        }
    }

    #[test]
    fn decide_retry_exhausts_after_max_retries() {
        let now = Utc::now();
        let decision = decide_retry(STEP_MAX_RETRIES, now, 0.0);
        assert_eq!(
            decision,
            RetryDecision::Exhausted {
                attempts_made: STEP_MAX_RETRIES
            }
        );
    }

    #[test]
    fn decide_retry_on_ninth_attempt_is_exhausted() {
        let now = Utc::now();
        let decision = decide_retry(8, now, 0.0);
        assert!(matches!(decision, RetryDecision::Exhausted { .. }));
    }

    #[test]
    fn is_due_respects_next_retry_at() {
        let now = Utc::now();
        let record = RetryRecord {
            retry_attempt: 1,
            next_retry_at: now + chrono::Duration::seconds(60),
            last_http_status: 546,
            last_error: "worker_limit_546".into(),
        };
        assert!(!is_due(&record, now));
        assert!(is_due(&record, now + chrono::Duration::seconds(61)));
    }

    proptest::proptest! {
        #[test]
        fn decide_retry_attempt_is_always_monotonic(prior in 0u32..20) {
            let now = Utc::now();
            match decide_retry(prior, now, 0.1) {
                RetryDecision::ScheduleRetry(r) => prop_assert_eq!(r.retry_attempt, prior + 1),
                RetryDecision::Exhausted { attempts_made } => prop_assert_eq!(attempts_made, prior),
            }
        }

        #[test]
        fn jitter_never_goes_negative(base in 0u64..100_000, frac in 0.0f64..1.0) {
            let jittered = apply_jitter_seconds(base, frac);
            prop_assert!(jittered <= base + (base as f64 * frac).ceil() as u64 + 1);
        }
    }
}

#![no_main]

use chrono::Utc;
use conveyor_retry::{STEP_MAX_RETRIES, apply_jitter_seconds, decide_retry};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, u8, f64)| {
    let (prior_attempt, jitter_byte, raw_fraction) = data;

    let prior_attempt = prior_attempt % (STEP_MAX_RETRIES * 2);
    let fraction = if raw_fraction.is_finite() { raw_fraction.clamp(0.0, 1.0) } else { 0.0 };
    let now = Utc::now();

    match decide_retry(prior_attempt, now, fraction) {
        conveyor_retry::RetryDecision::ScheduleRetry(record) => {
            assert_eq!(record.retry_attempt, prior_attempt + 1);
            assert!(record.next_retry_at >= now);
        }
        conveyor_retry::RetryDecision::Exhausted { attempts_made } => {
            assert_eq!(attempts_made, prior_attempt);
            assert!(prior_attempt + 1 > STEP_MAX_RETRIES);
        }
    }

    let base = (jitter_byte as u64) * 1000;
    let jittered = apply_jitter_seconds(base, fraction);
    let max_delta = (base as f64 * fraction).ceil() as u64 + 1;
    assert!(jittered <= base + max_delta);
});

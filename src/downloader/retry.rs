// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

/// Status-code-aware retry budget. See `SPEC_FULL.md` §4.3.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: u32,
}

/// Transport errors share this backoff family regardless of the underlying
/// cause (connect refused, DNS, TLS, timeout).
pub const TRANSPORT_BACKOFF_FACTOR: u32 = 2;

/// Looks up the retry policy for an HTTP status, if that status is
/// considered retryable.
pub fn retry_policy_for_status(status: u16) -> Option<RetryPolicy> {
    let (max_retries, backoff_factor) = match status {
        403 => (5, 2),
        404 => (5, 2),
        408 => (3, 2),
        420 => (3, 2),
        429 => (3, 5),
        500 => (3, 2),
        502 => (3, 2),
        503 => (3, 2),
        504 => (3, 2),
        _ => return None,
    };
    Some(RetryPolicy { max_retries, backoff_factor })
}

/// `delay = retry_delay * backoff_factor ^ attempt`, `attempt = 0` meaning
/// the first retry.
pub fn backoff_delay(retry_delay: Duration, backoff_factor: u32, attempt: u32) -> Duration {
    let factor = f64::from(backoff_factor).powi(attempt as i32);
    Duration::from_secs_f64(retry_delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_statuses_match_the_policy_table() {
        let p = retry_policy_for_status(429).unwrap();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.backoff_factor, 5);

        let p = retry_policy_for_status(404).unwrap();
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.backoff_factor, 2);
    }

    #[test]
    fn success_statuses_have_no_policy() {
        assert!(retry_policy_for_status(200).is_none());
        assert!(retry_policy_for_status(301).is_none());
    }

    #[test]
    fn backoff_grows_exponentially() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 2, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 2, 2), Duration::from_millis(2000));
    }
}

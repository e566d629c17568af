//! Response classification and the transient retry policy
//!
//! One budget covers every transient failure (network, timeout, 429, 5xx):
//! `max_attempts` total transport calls per logical request, with
//! exponential backoff `base_delay * 2^attempt` capped at `max_delay`. A
//! server-provided `Retry-After` replaces the computed delay.

use std::time::{Duration, SystemTime};

use rand::RngExt;
use transport::{HeaderMap, StatusCode, header};

/// How the pipeline should treat a completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 2xx or 304; decode and return
    Success,
    /// 401; refresh once and resend
    Unauthorized,
    /// 429; transient, honour `Retry-After`
    RateLimited,
    /// 5xx; transient
    ServerError,
    /// Any other status; terminal
    ClientError,
}

/// Classify an HTTP status.
pub fn classify_status(status: StatusCode) -> Disposition {
    match status.as_u16() {
        200..=299 | 304 => Disposition::Success,
        401 => Disposition::Unauthorized,
        429 => Disposition::RateLimited,
        500..=599 => Disposition::ServerError,
        _ => Disposition::ClientError,
    }
}

/// Bounded retry policy for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total transport calls allowed, first attempt included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Longest `Retry-After` the client will sleep on; longer waits surface immediately
    pub max_retry_after: Duration,
    /// Add 0-25% random delay to computed backoff
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_retry_after: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Computed backoff before retry number `attempt + 1` (attempt starts at 0).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let mut delay = self.base_delay.saturating_mul(factor);
        if self.jitter && !delay.is_zero() {
            let max_extra = delay.as_millis() / 4;
            let max_extra = u64::try_from(max_extra).unwrap_or(u64::MAX);
            if max_extra > 0 {
                let extra = rand::rng().random_range(0..=max_extra);
                delay = delay.saturating_add(Duration::from_millis(extra));
            }
        }
        delay.min(self.max_delay)
    }

    /// Delay to wait: the server's `Retry-After` if given, else computed backoff.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.backoff(attempt))
    }

    /// Whether another transport call is allowed after `attempts_made` calls.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP-date.
///
/// Negative seconds, dates in the past and garbage yield `None`.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return u64::try_from(seconds).ok().map(Duration::from_secs);
    }

    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(SystemTime::now()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::HeaderValue;

    fn headers_with_retry_after(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn classify_success_statuses() {
        assert_eq!(classify_status(StatusCode::OK), Disposition::Success);
        assert_eq!(classify_status(StatusCode::CREATED), Disposition::Success);
        assert_eq!(classify_status(StatusCode::NO_CONTENT), Disposition::Success);
        assert_eq!(classify_status(StatusCode::NOT_MODIFIED), Disposition::Success);
    }

    #[test]
    fn classify_status_401_unauthorized() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            Disposition::Unauthorized
        );
    }

    #[test]
    fn classify_status_429_rate_limited() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Disposition::RateLimited
        );
    }

    #[test]
    fn classify_status_5xx_server_error() {
        for code in [500, 502, 503, 504, 599] {
            assert_eq!(
                classify_status(StatusCode::from_u16(code).unwrap()),
                Disposition::ServerError,
                "{code}"
            );
        }
    }

    #[test]
    fn classify_other_4xx_client_error() {
        for code in [400, 403, 404, 408, 409, 422] {
            assert_eq!(
                classify_status(StatusCode::from_u16(code).unwrap()),
                Disposition::ClientError,
                "{code}"
            );
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn backoff_is_non_decreasing() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (0..10).map(|a| policy.backoff(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
    }

    #[test]
    fn jitter_stays_within_quarter_and_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(10),
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.backoff(0);
            assert!(delay >= Duration::from_millis(400), "{delay:?}");
            assert!(delay <= Duration::from_millis(500), "{delay:?}");
        }
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(policy.delay_for(1, None), policy.backoff(1));
    }

    #[test]
    fn allows_another_respects_ceiling() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
        assert!(!RetryPolicy::none().allows_another(1));
    }

    #[test]
    fn parse_retry_after_seconds() {
        assert_eq!(
            parse_retry_after(&headers_with_retry_after("2")),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            parse_retry_after(&headers_with_retry_after(" 120 ")),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn parse_retry_after_rejects_negative_and_garbage() {
        assert_eq!(parse_retry_after(&headers_with_retry_after("-5")), None);
        assert_eq!(parse_retry_after(&headers_with_retry_after("soon")), None);
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn parse_retry_after_http_date() {
        let future = SystemTime::now() + Duration::from_secs(90);
        let value = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after(&headers_with_retry_after(&value)).unwrap();
        assert!(parsed <= Duration::from_secs(90));
        assert!(parsed >= Duration::from_secs(85), "{parsed:?}");

        let past = httpdate::fmt_http_date(SystemTime::now() - Duration::from_secs(90));
        assert_eq!(parse_retry_after(&headers_with_retry_after(&past)), None);
    }
}

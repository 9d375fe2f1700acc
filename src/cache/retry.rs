//! Retry classification and backoff
//!
//! Authorization and validation failures are deterministic for a given
//! request, so they surface to the caller on the first attempt. Everything
//! else is treated as transient and retried up to the attempt ceiling.

use crate::error::{CacheError, FetchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Category of a fetch failure as far as retrying is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Authentication or authorization rejected (401/403)
    Auth,

    /// Request rejected by the server as invalid (400/422)
    Validation,

    /// Anything else: network, timeouts, server errors
    Transient,
}

impl FailureKind {
    /// Derive the category from whatever signal the failure carries
    pub fn classify(failure: &FetchError) -> Self {
        match failure {
            FetchError::Unauthorized(_) | FetchError::Forbidden(_) => FailureKind::Auth,
            FetchError::BadRequest(_) | FetchError::Unprocessable(_) => FailureKind::Validation,
            FetchError::Decode(_) => FailureKind::Validation,
            FetchError::Http { status, .. } => Self::from_status(*status),
            FetchError::Network(_) | FetchError::Timeout { .. } => FailureKind::Transient,
            FetchError::Other(message) => Self::from_message(message),
        }
    }

    fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => FailureKind::Auth,
            400 | 422 => FailureKind::Validation,
            _ => FailureKind::Transient,
        }
    }

    fn from_message(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        let mentions = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

        // Status codes count only as whole tokens; dots stay inside a token
        // so addresses and versions are not split into codes
        let status = message
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '.'))
            .map(|token| token.trim_matches('.'))
            .filter_map(|token| match token {
                "400" | "401" | "403" | "422" => token.parse::<u16>().ok(),
                _ => None,
            })
            .map(Self::from_status)
            .next();

        if status == Some(FailureKind::Auth) || mentions(&["unauthorized", "forbidden"]) {
            FailureKind::Auth
        } else if status == Some(FailureKind::Validation) || mentions(&["bad request", "unprocessable"]) {
            FailureKind::Validation
        } else {
            FailureKind::Transient
        }
    }

    /// True for categories that are never retried
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FailureKind::Transient)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Auth => write!(f, "auth"),
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::Transient => write!(f, "transient"),
        }
    }
}

/// Decides whether a failed fetch gets another attempt
pub trait RetryClassifier: Send + Sync {
    /// `attempt_number` counts attempts made so far, starting at 1
    fn should_retry(&self, attempt_number: u32, failure: &FetchError) -> bool;
}

/// Never retry auth or validation failures; retry the rest while
/// `attempt_number < max_attempts`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultRetryClassifier {
    pub max_attempts: u32,
}

impl Default for DefaultRetryClassifier {
    fn default() -> Self {
        Self {
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl DefaultRetryClassifier {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl RetryClassifier for DefaultRetryClassifier {
    fn should_retry(&self, attempt_number: u32, failure: &FetchError) -> bool {
        match FailureKind::classify(failure) {
            FailureKind::Auth | FailureKind::Validation => false,
            FailureKind::Transient => attempt_number < self.max_attempts,
        }
    }
}

/// Delay between consecutive attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Backoff {
    /// Retry straight away
    Immediate,

    /// Same delay before every retry
    Fixed(Duration),

    /// `base * 2^(failures - 1)`, capped at `max`, spread by `jitter` (0.0 - 1.0)
    Exponential {
        base: Duration,
        max: Duration,
        jitter: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl Backoff {
    /// Delay to wait after `failed_attempts` consecutive failures
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        match *self {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max, jitter } => {
                let exponent = failed_attempts.saturating_sub(1).min(31);
                let delay = base.saturating_mul(1u32 << exponent).min(max);
                if jitter <= 0.0 {
                    return delay;
                }

                let secs = delay.as_secs_f64();
                let spread = (rand::random::<f64>() * 2.0 - 1.0) * secs * jitter;
                Duration::from_secs_f64((secs + spread).max(0.0))
            }
        }
    }

    /// Parse a backoff kind by name, using `delay` as its base when given
    pub fn from_name(name: &str, delay: Option<Duration>) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "immediate" | "none" => Ok(Backoff::Immediate),
            "fixed" => Ok(Backoff::Fixed(delay.unwrap_or(Duration::from_secs(1)))),
            "exponential" => Ok(Backoff::default().with_base(delay.unwrap_or(Duration::from_secs(1)))),
            other => Err(CacheError::ConfigError(format!("unknown backoff: {}", other))),
        }
    }

    /// Same shape with a different base delay
    pub fn with_base(self, base: Duration) -> Self {
        match self {
            Backoff::Immediate => Backoff::Immediate,
            Backoff::Fixed(_) => Backoff::Fixed(base),
            Backoff::Exponential { max, jitter, .. } => Backoff::Exponential { base, max, jitter },
        }
    }
}

/// Attempt ceiling plus backoff
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// The classifier matching this policy's ceiling
    pub fn classifier(&self) -> DefaultRetryClassifier {
        DefaultRetryClassifier::new(self.max_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> FetchError {
        FetchError::Http {
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    #[test]
    fn test_auth_failures_never_retry() {
        let classifier = DefaultRetryClassifier::default();

        assert!(!classifier.should_retry(1, &FetchError::Unauthorized("expired".into())));
        assert!(!classifier.should_retry(1, &FetchError::Forbidden("no access".into())));
        assert!(!classifier.should_retry(1, &FetchError::from_status(401, "")));
        assert!(!classifier.should_retry(1, &FetchError::Other("Request failed with status 403".into())));
    }

    #[test]
    fn test_validation_failures_never_retry() {
        let classifier = DefaultRetryClassifier::default();

        assert!(!classifier.should_retry(1, &FetchError::BadRequest("missing id".into())));
        assert!(!classifier.should_retry(1, &FetchError::Http { status: 422, message: String::new() }));
        assert!(!classifier.should_retry(1, &FetchError::Other("422 Unprocessable Entity".into())));
        assert!(!classifier.should_retry(1, &FetchError::Decode("expected array".into())));
    }

    #[test]
    fn test_transient_failures_retry_until_ceiling() {
        let classifier = DefaultRetryClassifier::default();

        assert!(classifier.should_retry(1, &transient()));
        assert!(classifier.should_retry(2, &transient()));
        assert!(!classifier.should_retry(3, &transient()));

        assert!(classifier.should_retry(1, &FetchError::Network("connection reset".into())));
        assert!(classifier.should_retry(2, &FetchError::Timeout { timeout_ms: 100 }));
        assert!(classifier.should_retry(1, &FetchError::Other("socket hang up".into())));
    }

    #[test]
    fn test_failure_kind_classification() {
        assert_eq!(FailureKind::classify(&FetchError::Forbidden(String::new())), FailureKind::Auth);
        assert_eq!(FailureKind::classify(&FetchError::from_status(400, "")), FailureKind::Validation);
        assert_eq!(FailureKind::classify(&FetchError::from_status(429, "")), FailureKind::Transient);
        assert_eq!(FailureKind::classify(&FetchError::Other("Unauthorized".into())), FailureKind::Auth);
        assert!(FailureKind::Auth.is_terminal());
        assert!(!FailureKind::Transient.is_terminal());
    }

    #[test]
    fn test_status_codes_in_messages_match_whole_tokens() {
        let kind = |message: &str| FailureKind::classify(&FetchError::Other(message.into()));

        assert_eq!(kind("HTTP 403: token expired"), FailureKind::Auth);
        assert_eq!(kind("status=422 (field `name` missing)"), FailureKind::Validation);
        assert_eq!(kind("upstream returned 400."), FailureKind::Validation);

        assert_eq!(kind("upstream timeout after 4000ms"), FailureKind::Transient);
        assert_eq!(kind("HTTP 503 from host 10.0.4.403"), FailureKind::Transient);
        assert_eq!(kind("request 14010 failed"), FailureKind::Transient);
        assert_eq!(kind("build v1.401 crashed"), FailureKind::Transient);

        let classifier = DefaultRetryClassifier::default();
        assert!(classifier.should_retry(1, &FetchError::Other("upstream timeout after 4000ms".into())));
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(200), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60),
            jitter: 0.1,
        };

        for _ in 0..50 {
            let delay = backoff.delay_for(1).as_secs_f64();
            assert!((9.0..=11.0).contains(&delay));
        }
    }

    #[test]
    fn test_backoff_from_name() {
        assert_eq!(Backoff::from_name("immediate", None).unwrap(), Backoff::Immediate);
        assert_eq!(
            Backoff::from_name("fixed", Some(Duration::from_millis(20))).unwrap(),
            Backoff::Fixed(Duration::from_millis(20))
        );
        assert!(Backoff::from_name("linear", None).is_err());
    }
}

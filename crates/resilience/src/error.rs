//! Retryable vs fatal error taxonomy for outbound calls.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Implemented by any error the retry engine may see.
///
/// Non-retryable errors propagate immediately; retryable ones are absorbed up
/// to the policy's ceiling or the run deadline.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Errors from a single outbound call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Network-level failure: connect, reset, timeout.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The remote answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retryable: bool,
    },

    /// The request itself is wrong; retrying cannot help.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("{0}")]
    Fatal(String),
}

impl CallError {
    /// Build an HTTP error classified by `policy`.
    pub fn from_status(status: u16, message: impl Into<String>, policy: &StatusCodePolicy) -> Self {
        Self::Http {
            status,
            message: message.into(),
            retryable: policy.is_retryable(status),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Retryable for CallError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Http { retryable, .. } => *retryable,
            Self::Invalid(_) | Self::Fatal(_) => false,
        }
    }
}

/// Configured status-code lists layered over the default classification
/// (429 and 5xx retry, everything else is fatal).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCodePolicy {
    /// Extra codes that are worth another attempt (e.g. a vendor's 400 "report not ready").
    #[serde(default)]
    pub retry_on: Vec<u16>,
    /// Codes that must never be retried, even if the default would.
    #[serde(default)]
    pub never_retry: Vec<u16>,
}

impl StatusCodePolicy {
    pub fn is_retryable(&self, status: u16) -> bool {
        if self.never_retry.contains(&status) {
            return false;
        }
        if self.retry_on.contains(&status) {
            return true;
        }
        status == 429 || (500..600).contains(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classification() {
        let policy = StatusCodePolicy::default();
        assert!(policy.is_retryable(429));
        assert!(policy.is_retryable(503));
        assert!(!policy.is_retryable(400));
        assert!(!policy.is_retryable(404));
    }

    #[test]
    fn configured_lists_override_defaults() {
        let policy = StatusCodePolicy {
            retry_on: vec![409],
            never_retry: vec![501],
        };
        assert!(policy.is_retryable(409));
        assert!(!policy.is_retryable(501));
        assert!(policy.is_retryable(502));
    }

    #[test]
    fn call_error_retryability() {
        let policy = StatusCodePolicy::default();
        assert!(CallError::Transient("reset".into()).is_retryable());
        assert!(CallError::from_status(500, "boom", &policy).is_retryable());
        assert!(!CallError::from_status(401, "nope", &policy).is_retryable());
        assert!(!CallError::Invalid("bad date".into()).is_retryable());
        assert_eq!(CallError::from_status(418, "teapot", &policy).status(), Some(418));
    }

    #[test]
    fn display_messages() {
        let err = CallError::from_status(503, "unavailable", &StatusCodePolicy::default());
        assert_eq!(err.to_string(), "HTTP 503: unavailable");
    }
}

use std::time::Duration;

use thiserror::Error;

use crate::constants::RETRYABLE_STATUS_CODES;
use crate::core::Modality;

pub const GENERIC_USER_MESSAGE: &str = "AI provider request failed";
pub const TIMEOUT_USER_MESSAGE: &str = "AI generation timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    Connect,
    Other,
}

/// Failure below the HTTP layer: DNS, TLS, refused connections, timeouts.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} error: {message}")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub message: String,
}

impl NetworkError {
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::Connect
        } else {
            NetworkErrorKind::Other
        };
        // Strip the URL so query parameters never reach logs.
        let message = truncate_chars(&err.without_url().to_string(), 300);
        Self { kind, message }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Config(String),

    #[error("Unknown {modality} model '{model}'. Allowed: {allowed}")]
    UnknownModel {
        modality: Modality,
        model: String,
        allowed: String,
    },

    #[error("{model} returned HTTP {status} {detail}")]
    Http {
        model: String,
        status: u16,
        detail: String,
    },

    #[error("network error calling {model}: {source}")]
    Network {
        model: String,
        #[source]
        source: NetworkError,
    },

    #[error("{model} returned a body that is not valid JSON: {message}")]
    InvalidJson { model: String, message: String },

    #[error("empty response from {model}: {reason}")]
    EmptyResponse { model: String, reason: String },

    #[error("job {job_id} failed: {detail}")]
    JobFailed { job_id: String, detail: String },

    #[error("invalid output format from job {job_id}")]
    InvalidOutput { job_id: String },

    #[error("job {job_id} did not finish within {:.1}s", .elapsed.as_secs_f64())]
    PollTimeout { job_id: String, elapsed: Duration },
}

impl GatewayError {
    /// HTTP status carried by the error, if it came from a provider response.
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the text orchestrator may move on to the next model in its chain.
    /// A retryable status only reaches the orchestrator once retries ran out.
    pub fn allows_fallback(&self) -> bool {
        match self {
            GatewayError::Http { status, .. } => {
                *status == 404 || RETRYABLE_STATUS_CODES.contains(status)
            }
            GatewayError::EmptyResponse { .. } => true,
            _ => false,
        }
    }

    /// Caller-input problems whose message is safe to show verbatim.
    pub fn is_validation(&self) -> bool {
        matches!(self, GatewayError::UnknownModel { .. })
    }

    pub fn user_message(&self) -> String {
        match self {
            GatewayError::UnknownModel { .. } => self.to_string(),
            GatewayError::Http { detail, .. } if !detail.is_empty() => {
                format!("Provider Error: {detail}")
            }
            GatewayError::PollTimeout { .. } => TIMEOUT_USER_MESSAGE.to_string(),
            _ => GENERIC_USER_MESSAGE.to_string(),
        }
    }
}

pub fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_for_not_found_empty_and_exhausted() {
        let not_found = GatewayError::Http {
            model: "m".into(),
            status: 404,
            detail: String::new(),
        };
        let bad_request = GatewayError::Http {
            model: "m".into(),
            status: 400,
            detail: String::new(),
        };
        let empty = GatewayError::EmptyResponse {
            model: "m".into(),
            reason: "no candidates".into(),
        };
        let overloaded = GatewayError::Http {
            model: "m".into(),
            status: 503,
            detail: String::new(),
        };
        let network = GatewayError::Network {
            model: "m".into(),
            source: NetworkError::new(NetworkErrorKind::Timeout, "timed out"),
        };
        assert!(not_found.allows_fallback());
        assert!(empty.allows_fallback());
        assert!(overloaded.allows_fallback());
        assert!(!bad_request.allows_fallback());
        assert!(!network.allows_fallback());
    }

    #[test]
    fn user_message_hides_internal_detail() {
        let network = GatewayError::Network {
            model: "gemini-2.5-flash".into(),
            source: NetworkError::new(NetworkErrorKind::Connect, "connection refused"),
        };
        assert_eq!(network.user_message(), GENERIC_USER_MESSAGE);

        let http = GatewayError::Http {
            model: "gemini-2.5-flash".into(),
            status: 400,
            detail: "code=400 status=INVALID_ARGUMENT".into(),
        };
        assert_eq!(
            http.user_message(),
            "Provider Error: code=400 status=INVALID_ARGUMENT"
        );

        let timeout = GatewayError::PollTimeout {
            job_id: "job-1".into(),
            elapsed: Duration::from_secs(5),
        };
        assert_eq!(timeout.user_message(), TIMEOUT_USER_MESSAGE);
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}

//! Bounded retry with jittered exponential backoff.
//!
//! The decision logic lives in [`RetryState`], which only consumes classified
//! outcomes and hands back what to do next. [`RetryEngine`] drives it with a
//! [`Transport`] and a [`Scheduler`], so the same state machine works with
//! blocking sleeps or a virtual clock in tests.

use std::io::Read;
use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::constants::{
    DEFAULT_MAX_ATTEMPTS, MAX_ERROR_MESSAGE_CHARS, QUEUE_RETRYABLE_STATUS_CODES,
    RETRYABLE_STATUS_CODES,
};
use crate::core::{HttpRequest, RawResponse, Scheduler, StreamingResponse, Transport};
use crate::error::{truncate_chars, GatewayError, NetworkError};

pub const JITTER_RANGE: RangeInclusive<f64> = 0.5..=1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retryable_statuses: &'static [u16],
}

impl RetryPolicy {
    pub fn gemini(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retryable_statuses: RETRYABLE_STATUS_CODES,
        }
    }

    pub fn queue(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retryable_statuses: QUEUE_RETRYABLE_STATUS_CODES,
        }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::gemini(DEFAULT_MAX_ATTEMPTS)
    }
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Success(Value),
    Retryable(GatewayError),
    Fatal(GatewayError),
}

#[derive(Debug)]
pub enum Decision {
    Done(Value),
    Wait(Duration),
    GiveUp(GatewayError),
}

#[derive(Debug)]
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
    last_error: Option<GatewayError>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
        }
    }

    /// Zero-based index of the attempt currently in flight.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn last_error(&self) -> Option<&GatewayError> {
        self.last_error.as_ref()
    }

    pub fn advance(&mut self, outcome: AttemptOutcome, jitter: f64) -> Decision {
        match outcome {
            AttemptOutcome::Success(value) => Decision::Done(value),
            AttemptOutcome::Fatal(err) => {
                self.last_error = Some(err.clone());
                Decision::GiveUp(err)
            }
            AttemptOutcome::Retryable(err) => {
                self.last_error = Some(err.clone());
                if self.attempt + 1 >= self.max_attempts {
                    return Decision::GiveUp(err);
                }
                let delay = backoff_delay(self.attempt, jitter);
                self.attempt += 1;
                Decision::Wait(delay)
            }
        }
    }
}

/// `2^attempt` seconds scaled by `jitter`, clamped into [`JITTER_RANGE`].
pub fn backoff_delay(attempt: u32, jitter: f64) -> Duration {
    let jitter = jitter.clamp(*JITTER_RANGE.start(), *JITTER_RANGE.end());
    let base = 2f64.powi(attempt.min(16) as i32);
    Duration::from_secs_f64(base * jitter)
}

/// `code=.. status=.. message=..` from a provider error body. Never echoes the request.
pub fn safe_error_detail(body: &[u8]) -> String {
    let Ok(data) = serde_json::from_slice::<Value>(body) else {
        return String::new();
    };
    let Some(err) = data.get("error").and_then(|e| e.as_object()) else {
        return String::new();
    };

    let mut bits = Vec::new();
    if let Some(code) = err.get("code").filter(|c| !c.is_null()) {
        match code.as_str() {
            Some(s) => bits.push(format!("code={s}")),
            None => bits.push(format!("code={code}")),
        }
    }
    if let Some(status) = err
        .get("status")
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
    {
        bits.push(format!("status={status}"));
    }
    if let Some(message) = err
        .get("message")
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
    {
        bits.push(format!(
            "message={}",
            truncate_chars(message, MAX_ERROR_MESSAGE_CHARS)
        ));
    }
    bits.join(" ")
}

pub fn classify(
    policy: &RetryPolicy,
    label: &str,
    result: Result<RawResponse, NetworkError>,
) -> AttemptOutcome {
    let resp = match result {
        Ok(resp) => resp,
        Err(source) => {
            return AttemptOutcome::Retryable(GatewayError::Network {
                model: label.to_string(),
                source,
            })
        }
    };

    if resp.is_success() {
        return match resp.parse_json() {
            Ok(value) => AttemptOutcome::Success(value),
            Err(err) => AttemptOutcome::Fatal(GatewayError::InvalidJson {
                model: label.to_string(),
                message: err.to_string(),
            }),
        };
    }

    let err = GatewayError::Http {
        model: label.to_string(),
        status: resp.status,
        detail: safe_error_detail(&resp.body),
    };
    if policy.is_retryable(resp.status) {
        AttemptOutcome::Retryable(err)
    } else {
        AttemptOutcome::Fatal(err)
    }
}

pub struct Call<'a> {
    pub method: Method,
    pub url: &'a str,
    pub headers: &'a HeaderMap,
    pub payload: Option<&'a Value>,
    pub timeout: Duration,
    /// Model or job name used in logs and errors.
    pub label: &'a str,
}

impl Call<'_> {
    fn request(&self) -> HttpRequest<'_> {
        HttpRequest {
            method: self.method.clone(),
            url: self.url,
            headers: self.headers,
            body: self.payload,
            timeout: self.timeout,
        }
    }
}

pub struct RetryEngine<'a> {
    transport: &'a dyn Transport,
    scheduler: &'a dyn Scheduler,
    policy: RetryPolicy,
}

impl<'a> RetryEngine<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        scheduler: &'a dyn Scheduler,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            scheduler,
            policy,
        }
    }

    /// Run `call` until it succeeds, fails terminally, or attempts run out.
    /// Each attempt gets the full `call.timeout`.
    pub fn execute(&self, call: &Call<'_>) -> Result<Value, GatewayError> {
        let mut state = RetryState::new(self.policy.max_attempts);
        loop {
            let result = self.transport.send(call.request());
            if let Ok(resp) = &result {
                info!(model = call.label, status = resp.status, "provider response");
            }
            let outcome = classify(&self.policy, call.label, result);
            if let Some(value) = self.step(&mut state, outcome, call.label)? {
                return Ok(value);
            }
        }
    }

    /// Retry until the provider accepts the request, then hand back the unread
    /// body. Nothing is retried once the body is handed over.
    pub fn open_stream(&self, call: &Call<'_>) -> Result<StreamingResponse, GatewayError> {
        let mut state = RetryState::new(self.policy.max_attempts);
        loop {
            let outcome = match self.transport.send_streaming(call.request()) {
                Ok(resp) if resp.is_success() => {
                    info!(model = call.label, status = resp.status, "provider stream opened");
                    return Ok(resp);
                }
                Ok(mut resp) => {
                    info!(model = call.label, status = resp.status, "provider response");
                    let mut body = Vec::new();
                    if let Err(err) = resp.body.read_to_end(&mut body) {
                        debug!(model = call.label, "error body unreadable: {err}");
                    }
                    classify(
                        &self.policy,
                        call.label,
                        Ok(RawResponse::new(resp.status, body)),
                    )
                }
                Err(err) => classify(&self.policy, call.label, Err(err)),
            };
            // Success was returned above, so a step here only waits or fails.
            self.step(&mut state, outcome, call.label)?;
        }
    }

    /// Feed one outcome to the state machine. `Ok(None)` means the backoff
    /// delay has been slept and the caller should try again.
    fn step(
        &self,
        state: &mut RetryState,
        outcome: AttemptOutcome,
        label: &str,
    ) -> Result<Option<Value>, GatewayError> {
        let jitter = rand::thread_rng().gen_range(JITTER_RANGE);
        let attempt = state.attempt();
        match state.advance(outcome, jitter) {
            Decision::Done(value) => Ok(Some(value)),
            Decision::GiveUp(err) => {
                log_terminal(label, &err);
                Err(err)
            }
            Decision::Wait(delay) => {
                if let Some(err) = state.last_error() {
                    warn!(
                        model = label,
                        attempt = attempt + 1,
                        max_attempts = state.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying after {err}"
                    );
                }
                self.scheduler.sleep(delay);
                Ok(None)
            }
        }
    }
}

fn log_terminal(label: &str, err: &GatewayError) {
    match err {
        GatewayError::Http {
            status: 404,
            detail,
            ..
        } => error!(model = label, status = 404, "model not found/unreachable {detail}"),
        GatewayError::Http {
            status: 400,
            detail,
            ..
        } => error!(model = label, status = 400, "bad request {detail}"),
        GatewayError::Http { status, detail, .. } => {
            error!(model = label, status, "HTTP error {detail}")
        }
        GatewayError::Network { source, .. } => {
            error!(model = label, kind = ?source.kind, "network error {}", source.message)
        }
        other => error!(model = label, "{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkErrorKind;
    use serde_json::json;

    fn http_err(status: u16) -> GatewayError {
        GatewayError::Http {
            model: "m".into(),
            status,
            detail: String::new(),
        }
    }

    #[test]
    fn backoff_doubles_within_jitter_bounds() {
        assert_eq!(backoff_delay(0, 1.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, 0.5), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, 1.5), Duration::from_secs(6));
        assert_eq!(backoff_delay(0, 7.0), Duration::from_millis(1500));
    }

    #[test]
    fn state_machine_stops_at_max_attempts() {
        let mut state = RetryState::new(3);
        assert!(matches!(
            state.advance(AttemptOutcome::Retryable(http_err(503)), 1.0),
            Decision::Wait(d) if d == Duration::from_secs(1)
        ));
        assert!(matches!(
            state.advance(AttemptOutcome::Retryable(http_err(503)), 1.0),
            Decision::Wait(d) if d == Duration::from_secs(2)
        ));
        match state.advance(AttemptOutcome::Retryable(http_err(503)), 1.0) {
            Decision::GiveUp(err) => assert_eq!(err.status(), Some(503)),
            other => panic!("expected give up, got {other:?}"),
        }
    }

    #[test]
    fn fatal_outcome_gives_up_immediately() {
        let mut state = RetryState::new(3);
        assert!(matches!(
            state.advance(AttemptOutcome::Fatal(http_err(400)), 1.0),
            Decision::GiveUp(_)
        ));
        assert_eq!(state.attempt(), 0);
    }

    #[test]
    fn classifies_statuses() {
        let gemini = RetryPolicy::gemini(3);
        let queue = RetryPolicy::queue(3);
        let gateway_timeout =
            || -> Result<RawResponse, NetworkError> { Ok(RawResponse::new(524, "origin timeout")) };

        assert!(matches!(
            classify(&gemini, "m", gateway_timeout()),
            AttemptOutcome::Fatal(_)
        ));
        assert!(matches!(
            classify(&queue, "m", gateway_timeout()),
            AttemptOutcome::Retryable(_)
        ));
        assert!(matches!(
            classify(&gemini, "m", Ok(RawResponse::new(425, ""))),
            AttemptOutcome::Retryable(_)
        ));
        assert!(matches!(
            classify(&gemini, "m", Ok(RawResponse::new(200, "not json"))),
            AttemptOutcome::Fatal(GatewayError::InvalidJson { .. })
        ));
        assert!(matches!(
            classify(
                &gemini,
                "m",
                Err(NetworkError::new(NetworkErrorKind::Timeout, "timed out"))
            ),
            AttemptOutcome::Retryable(GatewayError::Network { .. })
        ));
    }

    #[test]
    fn error_detail_is_sanitized_and_truncated() {
        let long = "x".repeat(500);
        let body = json!({
            "error": {"code": 400, "status": "INVALID_ARGUMENT", "message": long}
        })
        .to_string();
        let detail = safe_error_detail(body.as_bytes());
        assert!(detail.starts_with("code=400 status=INVALID_ARGUMENT message="));
        assert_eq!(detail.len(), "code=400 status=INVALID_ARGUMENT message=".len() + 300);

        assert_eq!(safe_error_detail(b"<html>bad gateway</html>"), "");
        assert_eq!(safe_error_detail(br#"{"error": "nope"}"#), "");
    }
}

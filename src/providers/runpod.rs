//! Queue-backed text generation for the one model served outside Gemini.
//!
//! Lifecycle: optional `runsync`, else `run`, then `status/{id}` polling until
//! a terminal state or the caller's deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::RunpodConfig;
use crate::constants::{
    MAX_ERROR_MESSAGE_CHARS, POLL_BACKOFF_FACTOR, POLL_INITIAL_INTERVAL, POLL_MAX_INTERVAL,
    QUEUE_TEXT_MODEL,
};
use crate::core::{GenerationRequest, HttpRequest, Scheduler, Transport};
use crate::error::{truncate_chars, GatewayError};
use crate::extract::job_output_text;
use crate::prompts::queue_system_prompt;
use crate::retry::{classify, AttemptOutcome, Call, RetryEngine, RetryPolicy};

/// Submission attempts for `/run`: the first try plus one retry.
const SUBMIT_ATTEMPTS: u32 = 2;

/// Whether to try the blocking `runsync` call before falling back to a queued job.
///
/// JSON-mode generations tend to run long enough for the edge proxy to cut the
/// held connection (HTTP 524), so they go straight to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionPolicy {
    pub prefer_synchronous: bool,
}

impl SubmissionPolicy {
    pub fn for_request(req: &GenerationRequest) -> Self {
        Self {
            prefer_synchronous: !req.json_mode,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsyncJobHandle {
    pub job_id: String,
    pub submitted_at: OffsetDateTime,
    started: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobStatus {
    Completed,
    Failed(String),
    Pending(String),
}

impl JobStatus {
    fn of(data: &Value) -> Self {
        let status = data.get("status").and_then(|s| s.as_str());
        match status {
            Some("COMPLETED") => JobStatus::Completed,
            None if data.get("output").is_some() => JobStatus::Completed,
            Some(s @ ("FAILED" | "CANCELLED" | "TIMED_OUT")) => {
                let detail = match data.get("error") {
                    Some(Value::String(msg)) => truncate_chars(msg, MAX_ERROR_MESSAGE_CHARS),
                    Some(Value::Null) | None => s.to_string(),
                    Some(other) => truncate_chars(&other.to_string(), MAX_ERROR_MESSAGE_CHARS),
                };
                JobStatus::Failed(detail)
            }
            Some(other) => JobStatus::Pending(other.to_string()),
            None => JobStatus::Pending("UNKNOWN".to_string()),
        }
    }
}

pub struct RunpodClient {
    config: RunpodConfig,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
}

impl RunpodClient {
    pub fn new(
        config: RunpodConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        max_attempts: u32,
    ) -> Self {
        Self {
            config,
            transport,
            scheduler,
            policy: RetryPolicy::queue(max_attempts),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v2/{}/{path}",
            self.config.base_url.as_str().trim_end_matches('/'),
            self.config.endpoint_id
        )
    }

    fn headers(&self) -> Result<HeaderMap, GatewayError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|_| GatewayError::Config("RunPod API key is not a valid header value".into()))?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    pub fn payload(req: &GenerationRequest) -> Value {
        json!({
            "input": {
                "messages": [
                    {"role": "system", "content": queue_system_prompt(&req.system_prompt, req.json_mode)},
                    {"role": "user", "content": req.user_prompt},
                ],
                "sampling_params": req.sampling.queue_sampling_params(),
            }
        })
    }

    /// `timeout` bounds each synchronous attempt and the whole polling loop.
    pub fn generate(&self, req: &GenerationRequest, timeout: Duration) -> Result<String, GatewayError> {
        let headers = self.headers()?;
        let payload = Self::payload(req);
        let policy = SubmissionPolicy::for_request(req);
        info!(
            model = QUEUE_TEXT_MODEL,
            timeout_s = timeout.as_secs_f64(),
            json_mode = req.json_mode,
            prefer_synchronous = policy.prefer_synchronous,
            "calling queue backend"
        );

        // The deadline covers the synchronous attempt as well as the polling that may follow it.
        let submitted_at = OffsetDateTime::now_utc();
        let started = self.scheduler.now();

        let handle = if policy.prefer_synchronous {
            let url = self.url("runsync");
            let data = RetryEngine::new(self.transport.as_ref(), self.scheduler.as_ref(), self.policy)
                .execute(&Call {
                    method: Method::POST,
                    url: &url,
                    headers: &headers,
                    payload: Some(&payload),
                    timeout,
                    label: QUEUE_TEXT_MODEL,
                })?;
            let job_id = job_id(&data);
            match JobStatus::of(&data) {
                JobStatus::Completed => {
                    return completed_text(&data, job_id.as_deref().unwrap_or("runsync"))
                }
                JobStatus::Failed(detail) => {
                    return Err(GatewayError::JobFailed {
                        job_id: job_id.unwrap_or_else(|| "runsync".to_string()),
                        detail,
                    })
                }
                JobStatus::Pending(status) => {
                    let Some(job_id) = job_id else {
                        return Err(GatewayError::InvalidOutput {
                            job_id: "runsync".to_string(),
                        });
                    };
                    info!(job_id = %job_id, status = %status, "runsync returned before completion, polling");
                    AsyncJobHandle {
                        job_id,
                        submitted_at,
                        started,
                    }
                }
            }
        } else {
            self.submit(&payload, &headers, timeout)?
        };

        self.poll(&handle, &headers, timeout)
    }

    pub fn submit(
        &self,
        payload: &Value,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<AsyncJobHandle, GatewayError> {
        let url = self.url("run");
        let submitted_at = OffsetDateTime::now_utc();
        let started = self.scheduler.now();
        let data = RetryEngine::new(
            self.transport.as_ref(),
            self.scheduler.as_ref(),
            self.policy.with_max_attempts(SUBMIT_ATTEMPTS),
        )
        .execute(&Call {
            method: Method::POST,
            url: &url,
            headers,
            payload: Some(payload),
            timeout,
            label: QUEUE_TEXT_MODEL,
        })?;

        let job_id = job_id(&data).ok_or_else(|| GatewayError::EmptyResponse {
            model: QUEUE_TEXT_MODEL.to_string(),
            reason: "job submission returned no id".to_string(),
        })?;
        info!(job_id = %job_id, "queued job");
        Ok(AsyncJobHandle {
            job_id,
            submitted_at,
            started,
        })
    }

    pub fn poll(
        &self,
        handle: &AsyncJobHandle,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        let url = self.url(&format!("status/{}", handle.job_id));
        let mut interval = POLL_INITIAL_INTERVAL;
        loop {
            let remaining = timeout.saturating_sub(self.elapsed(handle));
            let request_timeout = self
                .config
                .status_timeout
                .min(remaining)
                .max(Duration::from_secs(1));
            let result = self.transport.send(HttpRequest {
                method: Method::GET,
                url: &url,
                headers,
                body: None,
                timeout: request_timeout,
            });

            match classify(&self.policy, &handle.job_id, result) {
                AttemptOutcome::Success(data) => match JobStatus::of(&data) {
                    JobStatus::Completed => return completed_text(&data, &handle.job_id),
                    JobStatus::Failed(detail) => {
                        return Err(GatewayError::JobFailed {
                            job_id: handle.job_id.clone(),
                            detail,
                        })
                    }
                    JobStatus::Pending(status) => {
                        debug!(job_id = %handle.job_id, status = %status, "job pending");
                    }
                },
                AttemptOutcome::Retryable(err) => {
                    warn!(job_id = %handle.job_id, "status poll failed, still polling: {err}");
                }
                AttemptOutcome::Fatal(err) => return Err(err),
            }

            let elapsed = self.elapsed(handle);
            if elapsed >= timeout {
                warn!(
                    job_id = %handle.job_id,
                    submitted_at = %handle.submitted_at.format(&Rfc3339).unwrap_or_default(),
                    elapsed_s = elapsed.as_secs_f64(),
                    "job did not finish in time"
                );
                return Err(GatewayError::PollTimeout {
                    job_id: handle.job_id.clone(),
                    elapsed,
                });
            }
            self.scheduler.sleep(interval);
            interval = interval.mul_f64(POLL_BACKOFF_FACTOR).min(POLL_MAX_INTERVAL);
        }
    }

    fn elapsed(&self, handle: &AsyncJobHandle) -> Duration {
        self.scheduler.now().saturating_duration_since(handle.started)
    }
}

fn job_id(data: &Value) -> Option<String> {
    data.get("id")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn completed_text(data: &Value, job_id: &str) -> Result<String, GatewayError> {
    data.get("output")
        .and_then(job_output_text)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| GatewayError::InvalidOutput {
            job_id: job_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_mode_skips_synchronous_path() {
        let plain = GenerationRequest::new("sys", "user", QUEUE_TEXT_MODEL);
        let json = plain.clone().json_mode(true);
        assert!(SubmissionPolicy::for_request(&plain).prefer_synchronous);
        assert!(!SubmissionPolicy::for_request(&json).prefer_synchronous);
    }

    #[test]
    fn payload_uses_queue_field_names() {
        let req = GenerationRequest::new("Tell a story.", "About owls.", QUEUE_TEXT_MODEL)
            .json_mode(true);
        let payload = RunpodClient::payload(&req);
        let messages = payload["input"]["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[0]["content"]
            .as_str()
            .unwrap()
            .starts_with("Tell a story."));
        assert!(messages[0]["content"].as_str().unwrap().contains("JSON only"));
        assert_eq!(messages[1]["content"], "About owls.");
        assert_eq!(payload["input"]["sampling_params"]["max_tokens"], 4096);
    }

    #[test]
    fn job_status_variants() {
        assert_eq!(JobStatus::of(&json!({"status": "COMPLETED"})), JobStatus::Completed);
        assert_eq!(
            JobStatus::of(&json!({"status": "FAILED", "error": "CUDA out of memory"})),
            JobStatus::Failed("CUDA out of memory".into())
        );
        assert_eq!(
            JobStatus::of(&json!({"status": "CANCELLED"})),
            JobStatus::Failed("CANCELLED".into())
        );
        assert_eq!(
            JobStatus::of(&json!({"status": "IN_QUEUE", "id": "j"})),
            JobStatus::Pending("IN_QUEUE".into())
        );
    }

    #[test]
    fn completed_without_usable_output_is_invalid() {
        let err = completed_text(&json!({"status": "COMPLETED", "output": {"tokens": 3}}), "j1")
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid output format from job j1");
    }
}

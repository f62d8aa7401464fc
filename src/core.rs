use std::fmt;
use std::io::{BufRead, Cursor};
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

use crate::constants::{IMAGE_MODELS, TEXT_MODELS};
use crate::error::{GatewayError, NetworkError};
use crate::sampling::SamplingConfig;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed set of model ids callers may request for one modality.
#[derive(Debug, Clone, Copy)]
pub struct ModelAllowlist {
    modality: Modality,
    entries: &'static [(&'static str, &'static str)],
}

impl ModelAllowlist {
    pub const fn text() -> Self {
        Self {
            modality: Modality::Text,
            entries: TEXT_MODELS,
        }
    }

    pub const fn image() -> Self {
        Self {
            modality: Modality::Image,
            entries: IMAGE_MODELS,
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn contains(&self, model: &str) -> bool {
        self.entries.iter().any(|(id, _)| *id == model)
    }

    pub fn describe(&self, model: &str) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(id, _)| *id == model)
            .map(|(_, description)| *description)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &'static str)> {
        self.entries.iter().copied()
    }

    pub fn validate(&self, model: &str) -> Result<(), GatewayError> {
        if self.contains(model) {
            return Ok(());
        }
        Err(GatewayError::UnknownModel {
            modality: self.modality,
            model: model.to_string(),
            allowed: self
                .entries
                .iter()
                .map(|(id, _)| *id)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub json_mode: bool,
    pub timeout: Option<Duration>,
    pub sampling: SamplingConfig,
    pub primary_model: String,
    pub fallback_model: Option<String>,
}

impl GenerationRequest {
    pub fn new(
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        primary_model: impl Into<String>,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            json_mode: false,
            timeout: None,
            sampling: SamplingConfig::default(),
            primary_model: primary_model.into(),
            fallback_model: None,
        }
    }

    pub fn json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn fallback(mut self, model: Option<String>) -> Self {
        self.fallback_model = model.filter(|m| !m.trim().is_empty());
        self
    }
}

pub struct HttpRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Option<&'a Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn parse_json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.body)
    }
}

/// Response whose body has not been read yet.
pub struct StreamingResponse {
    pub status: u16,
    pub body: Box<dyn BufRead + Send>,
}

impl StreamingResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<RawResponse> for StreamingResponse {
    fn from(resp: RawResponse) -> Self {
        Self {
            status: resp.status,
            body: Box::new(Cursor::new(resp.body)),
        }
    }
}

/// One HTTP exchange. Implementations must not retry on their own.
pub trait Transport: Send + Sync {
    fn send(&self, request: HttpRequest<'_>) -> Result<RawResponse, NetworkError>;

    /// Like [`Transport::send`], but hands the body over unread. The default
    /// buffers the whole body first.
    fn send_streaming(&self, request: HttpRequest<'_>) -> Result<StreamingResponse, NetworkError> {
        self.send(request).map(StreamingResponse::from)
    }
}

/// Clock and delay primitive driving backoff and polling.
pub trait Scheduler: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, delay: Duration);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::QUEUE_TEXT_MODEL;

    #[test]
    fn allowlists_are_per_modality() {
        let text = ModelAllowlist::text();
        let image = ModelAllowlist::image();
        assert!(text.contains("gemini-2.5-flash"));
        assert!(text.contains(QUEUE_TEXT_MODEL));
        assert!(!text.contains("imagen-4.0-generate-001"));
        assert!(image.contains("imagen-4.0-generate-001"));
        assert!(image.describe("gemini-2.5-flash-image").is_some());
    }

    #[test]
    fn unknown_model_error_lists_choices() {
        let err = ModelAllowlist::image().validate("dall-e-3").unwrap_err();
        assert!(err.is_validation());
        let message = err.to_string();
        assert!(message.contains("dall-e-3"));
        assert!(message.contains("imagen-3.0-generate-002"));
    }

    #[test]
    fn blank_fallback_is_dropped() {
        let req = GenerationRequest::new("sys", "user", "gemini-2.5-flash")
            .fallback(Some("  ".into()));
        assert_eq!(req.fallback_model, None);
    }
}

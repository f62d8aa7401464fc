use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{error, info};
use url::Url;

use crate::core::{GenerationRequest, Scheduler, Transport};
use crate::error::GatewayError;
use crate::extract::{block_reason, candidate_text, first_candidate, ImageStrategy};
use crate::prompts::clean_image_prompt;
use crate::retry::{Call, RetryEngine, RetryPolicy};
use crate::stream::{SseEvents, TextStream};

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Which wire dialect an image model speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFamily {
    /// Gemini chat models answering `:generateContent` with inline image parts.
    Chat,
    /// Imagen models answering `:predict` with `bytesBase64Encoded`.
    Legacy,
}

impl ImageFamily {
    pub fn for_model(model: &str) -> Self {
        if model.to_lowercase().contains("gemini") {
            ImageFamily::Chat
        } else {
            ImageFamily::Legacy
        }
    }

    fn strategy(self) -> ImageStrategy {
        match self {
            ImageFamily::Chat => ImageStrategy::InlineData,
            ImageFamily::Legacy => ImageStrategy::Prediction,
        }
    }
}

pub struct GeminiClient {
    api_key: Option<String>,
    base_url: Url,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
}

impl GeminiClient {
    pub fn new(
        api_key: Option<String>,
        base_url: Url,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            api_key,
            base_url,
            transport,
            scheduler,
            policy,
        }
    }

    pub fn text_url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}:generateContent", self.base())
    }

    pub fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:streamGenerateContent?alt=sse",
            self.base()
        )
    }

    pub fn image_url(&self, model: &str) -> String {
        match ImageFamily::for_model(model) {
            ImageFamily::Chat => self.text_url(model),
            ImageFamily::Legacy => format!("{}/v1beta/models/{model}:predict", self.base()),
        }
    }

    fn base(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    fn headers(&self) -> Result<HeaderMap, GatewayError> {
        let key = self.api_key.as_deref().ok_or_else(|| {
            error!("Gemini API key is not set");
            GatewayError::Config("STORYFORGE_GEMINI_API_KEY is not configured".into())
        })?;
        let mut value = HeaderValue::from_str(key)
            .map_err(|_| GatewayError::Config("Gemini API key is not a valid header value".into()))?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, value);
        Ok(headers)
    }

    fn engine(&self) -> RetryEngine<'_> {
        RetryEngine::new(self.transport.as_ref(), self.scheduler.as_ref(), self.policy)
    }

    pub fn text_payload(req: &GenerationRequest) -> Value {
        json!({
            "contents": [{"role": "user", "parts": [{"text": req.user_prompt}]}],
            "systemInstruction": {"parts": [{"text": req.system_prompt}]},
            "generationConfig": req.sampling.gemini_generation_config(req.json_mode),
        })
    }

    /// One model, no fallback. Empty or blocked replies become
    /// [`GatewayError::EmptyResponse`].
    pub fn generate_text(
        &self,
        model: &str,
        req: &GenerationRequest,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        let headers = self.headers()?;
        let payload = Self::text_payload(req);
        let url = self.text_url(model);
        info!(
            model,
            timeout_s = timeout.as_secs_f64(),
            json_mode = req.json_mode,
            "calling text API"
        );

        let data = self.engine().execute(&Call {
            method: Method::POST,
            url: &url,
            headers: &headers,
            payload: Some(&payload),
            timeout,
            label: model,
        })?;

        let Some(candidate) = first_candidate(&data) else {
            let reason = block_reason(&data);
            error!(model, block_reason = ?reason, "no candidates returned");
            return Err(GatewayError::EmptyResponse {
                model: model.to_string(),
                reason: match reason {
                    Some(reason) => format!("no candidates (blockReason={reason})"),
                    None => "no candidates".to_string(),
                },
            });
        };

        let finish_reason = candidate
            .get("finishReason")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN");
        let (input_tokens, output_tokens, total_tokens) = extract_usage(data.get("usageMetadata"));
        info!(
            model,
            finish_reason,
            input_tokens,
            output_tokens,
            total_tokens,
            "text response received"
        );

        candidate_text(candidate).ok_or_else(|| GatewayError::EmptyResponse {
            model: model.to_string(),
            reason: format!("no text in first candidate (finishReason={finish_reason})"),
        })
    }

    /// Open a streamed generation and read up to its first text chunk, so
    /// that an empty or refused stream still fails here and can fall back.
    pub fn stream_text(
        &self,
        model: &str,
        req: &GenerationRequest,
        timeout: Duration,
    ) -> Result<TextStream, GatewayError> {
        let headers = self.headers()?;
        let payload = Self::text_payload(req);
        let url = self.stream_url(model);
        info!(
            model,
            timeout_s = timeout.as_secs_f64(),
            json_mode = req.json_mode,
            "calling streaming text API"
        );

        let resp = self.engine().open_stream(&Call {
            method: Method::POST,
            url: &url,
            headers: &headers,
            payload: Some(&payload),
            timeout,
            label: model,
        })?;
        TextStream::start(model, SseEvents::new(resp.body)).inspect_err(|err| {
            error!(model, "stream produced no text: {err}");
        })
    }

    pub fn image_payload(model: &str, prompt: &str) -> Value {
        let cleaned = clean_image_prompt(prompt);
        match ImageFamily::for_model(model) {
            ImageFamily::Chat => json!({
                "contents": [{"role": "user", "parts": [{"text": cleaned}]}],
            }),
            ImageFamily::Legacy => json!({
                "instances": [{"prompt": cleaned}],
                "parameters": {"sampleCount": 1},
            }),
        }
    }

    /// Returns `Ok(None)` for every provider-side failure. Only a missing key
    /// is an error.
    pub fn generate_image(
        &self,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Option<String>, GatewayError> {
        let headers = self.headers()?;
        let family = ImageFamily::for_model(model);
        let payload = Self::image_payload(model, prompt);
        let url = self.image_url(model);
        info!(
            model,
            timeout_s = timeout.as_secs_f64(),
            family = ?family,
            "calling image API"
        );

        let data = match self.engine().execute(&Call {
            method: Method::POST,
            url: &url,
            headers: &headers,
            payload: Some(&payload),
            timeout,
            label: model,
        }) {
            Ok(data) => data,
            Err(err) => {
                error!(model, "failed to generate image: {err}");
                return Ok(None);
            }
        };

        match family.strategy().apply(&data) {
            Some(image) => Ok(Some(image.to_data_url())),
            None => {
                error!(model, family = ?family, "no image bytes in response");
                Ok(None)
            }
        }
    }
}

fn extract_usage(usage: Option<&Value>) -> (Option<u64>, Option<u64>, Option<u64>) {
    let Some(usage) = usage else {
        return (None, None, None);
    };
    let prompt = usage.get("promptTokenCount").and_then(|v| v.as_u64());
    let output = usage.get("candidatesTokenCount").and_then(|v| v.as_u64());
    let total = usage.get("totalTokenCount").and_then(|v| v.as_u64());
    (prompt, output, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingConfig;

    #[test]
    fn image_family_by_model_name() {
        assert_eq!(ImageFamily::for_model("gemini-2.5-flash-image"), ImageFamily::Chat);
        assert_eq!(ImageFamily::for_model("Gemini-Image"), ImageFamily::Chat);
        assert_eq!(ImageFamily::for_model("imagen-4.0-generate-001"), ImageFamily::Legacy);
    }

    #[test]
    fn text_payload_shape() {
        let req = GenerationRequest::new("You are a novelist.", "Write chapter one.", "gemini-2.5-flash")
            .json_mode(true)
            .sampling(SamplingConfig {
                top_k: Some(12),
                ..Default::default()
            });
        let payload = GeminiClient::text_payload(&req);
        assert_eq!(payload["contents"][0]["role"], "user");
        assert_eq!(payload["contents"][0]["parts"][0]["text"], "Write chapter one.");
        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            "You are a novelist."
        );
        assert_eq!(payload["generationConfig"]["topK"], 12);
        assert_eq!(
            payload["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn legacy_image_payload_requests_one_sample() {
        let payload = GeminiClient::image_payload("imagen-3.0-generate-002", "a red fox");
        assert_eq!(payload["parameters"]["sampleCount"], 1);
        let prompt = payload["instances"][0]["prompt"].as_str().unwrap();
        assert!(prompt.starts_with("a red fox"));
        assert!(prompt.contains("NO WATERMARKS"));
    }

    #[test]
    fn usage_counts_are_optional() {
        let usage = json!({"promptTokenCount": 10, "totalTokenCount": 30});
        assert_eq!(extract_usage(Some(&usage)), (Some(10), None, Some(30)));
        assert_eq!(extract_usage(None), (None, None, None));
    }
}

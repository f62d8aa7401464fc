use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::constants::QUEUE_TEXT_MODEL;
use crate::core::{GenerationRequest, ModelAllowlist, Scheduler, Transport};
use crate::error::GatewayError;
use crate::providers::gemini::GeminiClient;
use crate::providers::runpod::RunpodClient;
use crate::retry::RetryPolicy;
use crate::stream::TextStream;
use crate::transport::{HttpTransport, SystemScheduler};

/// Entry point for the rest of the application. Holds only read-only
/// configuration and the shared transport; every call chain is independent.
pub struct Gateway {
    config: GatewayConfig,
    gemini: GeminiClient,
    runpod: Option<RunpodClient>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
        Ok(Self::with_transport(config, transport, Arc::new(SystemScheduler)))
    }

    pub fn with_transport(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let gemini = GeminiClient::new(
            config.gemini_api_key.clone(),
            config.gemini_base_url.clone(),
            Arc::clone(&transport),
            Arc::clone(&scheduler),
            RetryPolicy::gemini(config.max_attempts),
        );
        let runpod = config.runpod.clone().map(|rp| {
            RunpodClient::new(
                rp,
                Arc::clone(&transport),
                Arc::clone(&scheduler),
                config.max_attempts,
            )
        });
        Self {
            config,
            gemini,
            runpod,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// A request pre-filled with the configured default and fallback models.
    pub fn text_request(
        &self,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> GenerationRequest {
        GenerationRequest::new(system_prompt, user_prompt, self.config.text_model.clone())
            .fallback(self.config.text_fallback_model.clone())
    }

    /// Models tried in order for `req`. The queue model never serves as a fallback.
    pub fn attempt_chain(req: &GenerationRequest) -> Vec<&str> {
        let mut chain = vec![req.primary_model.as_str()];
        if let Some(fallback) = req.fallback_model.as_deref() {
            if fallback != req.primary_model && fallback != QUEUE_TEXT_MODEL {
                chain.push(fallback);
            }
        }
        chain
    }

    pub fn generate_text(&self, req: &GenerationRequest) -> Result<String, GatewayError> {
        Self::validate_text_models(req)?;
        let timeout = req.timeout.unwrap_or(self.config.text_timeout);

        if req.primary_model == QUEUE_TEXT_MODEL {
            return self.queue()?.generate(req, timeout);
        }
        self.run_chain(req, |model| self.gemini.generate_text(model, req, timeout))
    }

    /// Streaming counterpart of [`Gateway::generate_text`]. Fallback applies
    /// until the first chunk; the queue model yields its whole text as one chunk.
    pub fn generate_text_stream(&self, req: &GenerationRequest) -> Result<TextStream, GatewayError> {
        Self::validate_text_models(req)?;
        let timeout = req.timeout.unwrap_or(self.config.text_timeout);

        if req.primary_model == QUEUE_TEXT_MODEL {
            let text = self.queue()?.generate(req, timeout)?;
            return Ok(TextStream::single(QUEUE_TEXT_MODEL, text));
        }
        self.run_chain(req, |model| self.gemini.stream_text(model, req, timeout))
    }

    fn validate_text_models(req: &GenerationRequest) -> Result<(), GatewayError> {
        let allowlist = ModelAllowlist::text();
        allowlist.validate(&req.primary_model)?;
        if let Some(fallback) = &req.fallback_model {
            allowlist.validate(fallback)?;
        }
        Ok(())
    }

    fn queue(&self) -> Result<&RunpodClient, GatewayError> {
        self.runpod.as_ref().ok_or_else(|| {
            GatewayError::Config(
                "STORYFORGE_RUNPOD_API_KEY and STORYFORGE_RUNPOD_ENDPOINT_ID must be configured"
                    .into(),
            )
        })
    }

    /// Try each model of the chain in turn. Moves on only for errors that
    /// `allows_fallback`; anything else, or the last model's error, is returned.
    fn run_chain<T>(
        &self,
        req: &GenerationRequest,
        mut attempt: impl FnMut(&str) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let chain = Self::attempt_chain(req);
        let mut last_err = None;
        for (index, model) in chain.iter().enumerate() {
            match attempt(model) {
                Ok(value) => {
                    if index > 0 {
                        info!(model, "fallback model succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => match chain.get(index + 1) {
                    Some(next) if err.allows_fallback() => {
                        warn!(from = model, to = next, "falling back after: {err}");
                        last_err = Some(err);
                    }
                    _ => return Err(err),
                },
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Config("no text model to try".into())))
    }

    /// Best effort: provider failures yield `Ok(None)`. Unknown models and a
    /// missing API key are still errors because they are caller or deployment
    /// mistakes.
    pub fn generate_image(
        &self,
        prompt: &str,
        timeout: Option<Duration>,
        model: Option<&str>,
    ) -> Result<Option<String>, GatewayError> {
        let model = model.unwrap_or(&self.config.image_model);
        ModelAllowlist::image().validate(model)?;
        let timeout = timeout.unwrap_or(self.config.image_timeout);
        self.gemini.generate_image(model, prompt, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_skips_duplicate_and_queue_fallbacks() {
        let req = GenerationRequest::new("s", "u", "gemini-2.5-flash")
            .fallback(Some("gemini-2.5-pro".into()));
        assert_eq!(
            Gateway::attempt_chain(&req),
            vec!["gemini-2.5-flash", "gemini-2.5-pro"]
        );

        let same = req.clone().fallback(Some("gemini-2.5-flash".into()));
        assert_eq!(Gateway::attempt_chain(&same), vec!["gemini-2.5-flash"]);

        let queue = req.fallback(Some(QUEUE_TEXT_MODEL.into()));
        assert_eq!(Gateway::attempt_chain(&queue), vec!["gemini-2.5-flash"]);
    }
}

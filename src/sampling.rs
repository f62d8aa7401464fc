//! Caller-tunable decoding parameters.
//!
//! Input arrives as loosely typed JSON from the web layer. Only four keys are
//! recognised; each is coerced and clamped on its own so a bad value for one
//! key falls back to the default for that key alone.

use serde::Serialize;
use serde_json::{json, Map, Value};

pub const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);
pub const TOP_P_RANGE: (f64, f64) = (0.0, 1.0);
pub const TOP_K_RANGE: (u32, u32) = (1, 128);
pub const MAX_OUTPUT_TOKENS_RANGE: (u32, u32) = (1, 32_768);

pub const DEFAULT_TEMPERATURE: f64 = 0.85;
pub const DEFAULT_TOP_P: f64 = 0.95;
pub const DEFAULT_TOP_K: u32 = 64;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 16_384;
pub const DEFAULT_QUEUE_MAX_TOKENS: u32 = 4_096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl SamplingConfig {
    /// Build from an untrusted JSON object such as `{"temperature": "0.7", "topK": 500}`.
    pub fn sanitize(raw: &Value) -> Self {
        let Some(obj) = raw.as_object() else {
            return Self::default();
        };
        Self {
            temperature: obj.get("temperature").and_then(coerce_f64),
            top_p: obj.get("topP").and_then(coerce_f64),
            top_k: obj
                .get("topK")
                .and_then(coerce_i64)
                .map(|v| clamp_int(v, TOP_K_RANGE)),
            max_output_tokens: obj
                .get("maxOutputTokens")
                .and_then(coerce_i64)
                .map(|v| clamp_int(v, MAX_OUTPUT_TOKENS_RANGE)),
        }
        .clamped()
    }

    pub fn clamped(self) -> Self {
        Self {
            temperature: self
                .temperature
                .filter(|v| !v.is_nan())
                .map(|v| v.clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1)),
            top_p: self
                .top_p
                .filter(|v| !v.is_nan())
                .map(|v| v.clamp(TOP_P_RANGE.0, TOP_P_RANGE.1)),
            top_k: self.top_k.map(|v| v.clamp(TOP_K_RANGE.0, TOP_K_RANGE.1)),
            max_output_tokens: self
                .max_output_tokens
                .map(|v| v.clamp(MAX_OUTPUT_TOKENS_RANGE.0, MAX_OUTPUT_TOKENS_RANGE.1)),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Gemini `generationConfig`: defaults overlaid with the caller's values.
    pub fn gemini_generation_config(&self, json_mode: bool) -> Map<String, Value> {
        let this = self.clamped();
        let mut cfg = Map::new();
        cfg.insert(
            "temperature".into(),
            json!(this.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
        );
        cfg.insert(
            "maxOutputTokens".into(),
            json!(this.max_output_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS)),
        );
        cfg.insert("topK".into(), json!(this.top_k.unwrap_or(DEFAULT_TOP_K)));
        cfg.insert("topP".into(), json!(this.top_p.unwrap_or(DEFAULT_TOP_P)));
        if json_mode {
            cfg.insert("responseMimeType".into(), json!("application/json"));
        }
        cfg
    }

    /// `sampling_params` for the queue backend, which uses snake_case names.
    pub fn queue_sampling_params(&self) -> Value {
        let this = self.clamped();
        json!({
            "temperature": this.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            "top_p": this.top_p.unwrap_or(DEFAULT_TOP_P),
            "top_k": this.top_k.unwrap_or(DEFAULT_TOP_K),
            "max_tokens": this.max_output_tokens.unwrap_or(DEFAULT_QUEUE_MAX_TOKENS),
        })
    }
}

/// Infinities survive so they clamp to the range bound; NaN has no place in a range.
fn coerce_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        _ => None,
    }?;
    (!parsed.is_nan()).then_some(parsed)
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|v| v.min(i64::MAX as u64) as i64))
            .or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn clamp_int(value: i64, (lo, hi): (u32, u32)) -> u32 {
    value.clamp(lo as i64, hi as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_every_field_into_range() {
        let cfg = SamplingConfig::sanitize(&json!({
            "temperature": 9.5,
            "topP": -1,
            "topK": 1000,
            "maxOutputTokens": 0,
        }));
        assert_eq!(cfg.temperature, Some(2.0));
        assert_eq!(cfg.top_p, Some(0.0));
        assert_eq!(cfg.top_k, Some(128));
        assert_eq!(cfg.max_output_tokens, Some(1));
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let cfg = SamplingConfig::sanitize(&json!({
            "temperature": 0.4,
            "candidateCount": 8,
            "stopSequences": ["END"],
        }));
        let rendered = serde_json::to_value(cfg).unwrap();
        let keys: Vec<_> = rendered.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["temperature".to_string()]);
    }

    #[test]
    fn garbage_drops_only_that_key() {
        let cfg = SamplingConfig::sanitize(&json!({
            "temperature": "warm",
            "topP": "0.5",
            "topK": [1, 2],
            "maxOutputTokens": 2048.9,
        }));
        assert_eq!(cfg.temperature, None);
        assert_eq!(cfg.top_p, Some(0.5));
        assert_eq!(cfg.top_k, None);
        assert_eq!(cfg.max_output_tokens, Some(2048));
    }

    #[test]
    fn booleans_and_infinities_coerce_then_clamp() {
        let cfg = SamplingConfig::sanitize(&json!({
            "temperature": "inf",
            "topP": true,
            "topK": false,
            "maxOutputTokens": "-infinity",
        }));
        assert_eq!(cfg.temperature, Some(2.0));
        assert_eq!(cfg.top_p, Some(1.0));
        assert_eq!(cfg.top_k, Some(1));
        assert_eq!(cfg.max_output_tokens, None);

        let cfg = SamplingConfig::sanitize(&json!({"temperature": "-inf", "topP": "NaN"}));
        assert_eq!(cfg.temperature, Some(0.0));
        assert_eq!(cfg.top_p, None);
    }

    #[test]
    fn non_object_input_is_empty() {
        assert!(SamplingConfig::sanitize(&json!("hot")).is_empty());
        assert!(SamplingConfig::sanitize(&Value::Null).is_empty());
    }

    #[test]
    fn generation_config_overlays_defaults() {
        let cfg = SamplingConfig {
            temperature: Some(0.3),
            ..Default::default()
        }
        .gemini_generation_config(true);
        assert_eq!(cfg["temperature"], json!(0.3));
        assert_eq!(cfg["maxOutputTokens"], json!(16_384));
        assert_eq!(cfg["topK"], json!(64));
        assert_eq!(cfg["topP"], json!(0.95));
        assert_eq!(cfg["responseMimeType"], json!("application/json"));
    }

    #[test]
    fn queue_params_use_queue_defaults() {
        let params = SamplingConfig {
            top_k: Some(20),
            ..Default::default()
        }
        .queue_sampling_params();
        assert_eq!(
            params,
            json!({"temperature": 0.85, "top_p": 0.95, "top_k": 20, "max_tokens": 4096})
        );
    }
}

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::{
    env, fmt,
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::constants::{
    DEFAULT_GEMINI_BASE_URL, DEFAULT_IMAGE_MODEL, DEFAULT_IMAGE_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RUNPOD_BASE_URL, DEFAULT_STATUS_TIMEOUT, DEFAULT_TEXT_FALLBACK_MODEL,
    DEFAULT_TEXT_MODEL, DEFAULT_TEXT_TIMEOUT,
};
use crate::core::ModelAllowlist;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GeminiCfg {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub text_model: Option<String>,
    pub text_fallback_model: Option<String>,
    pub text_timeout_s: Option<f64>,
    pub image_model: Option<String>,
    pub image_timeout_s: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RunpodCfg {
    pub api_key: Option<String>,
    pub endpoint_id: Option<String>,
    pub base_url: Option<String>,
    pub status_timeout_s: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RetryCfg {
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Root {
    pub gemini: Option<GeminiCfg>,
    pub runpod: Option<RunpodCfg>,
    pub retry: Option<RetryCfg>,
}

#[derive(Clone)]
pub struct RunpodConfig {
    pub api_key: String,
    pub endpoint_id: String,
    pub base_url: Url,
    /// Per-request timeout for each status poll.
    pub status_timeout: Duration,
}

impl fmt::Debug for RunpodConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunpodConfig")
            .field("api_key", &"<redacted>")
            .field("endpoint_id", &self.endpoint_id)
            .field("base_url", &self.base_url.as_str())
            .field("status_timeout", &self.status_timeout)
            .finish()
    }
}

/// Everything the gateway reads, resolved once and handed over at construction.
#[derive(Clone)]
pub struct GatewayConfig {
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: Url,
    pub text_model: String,
    pub text_fallback_model: Option<String>,
    pub text_timeout: Duration,
    pub image_model: String,
    pub image_timeout: Duration,
    pub runpod: Option<RunpodConfig>,
    pub max_attempts: u32,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field(
                "gemini_api_key",
                &self.gemini_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("gemini_base_url", &self.gemini_base_url.as_str())
            .field("text_model", &self.text_model)
            .field("text_fallback_model", &self.text_fallback_model)
            .field("text_timeout", &self.text_timeout)
            .field("image_model", &self.image_model)
            .field("image_timeout", &self.image_timeout)
            .field("runpod", &self.runpod)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_base_url: default_url(DEFAULT_GEMINI_BASE_URL),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            text_fallback_model: Some(DEFAULT_TEXT_FALLBACK_MODEL.to_string()),
            text_timeout: DEFAULT_TEXT_TIMEOUT,
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            image_timeout: DEFAULT_IMAGE_TIMEOUT,
            runpod: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl GatewayConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let root = match path {
            Some(p) => Some(Self::read_yaml(p)?),
            None => {
                let mut found = None;
                for candidate in ["storyforge.yaml", "storyforge.yml"] {
                    let path = PathBuf::from(candidate);
                    if path.exists() {
                        found = Some(Self::read_yaml(&path)?);
                        break;
                    }
                }
                found
            }
        };
        Self::resolve(root.unwrap_or_default(), &|key| env::var(key).ok())
    }

    fn read_yaml(path: &Path) -> anyhow::Result<Root> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        serde_yaml::from_reader(file).with_context(|| format!("parsing {}", path.display()))
    }

    /// Environment variables win over the YAML file, which wins over defaults.
    pub fn resolve(root: Root, env: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let gemini = root.gemini.unwrap_or_default();
        let runpod = root.runpod.unwrap_or_default();
        let retry = root.retry.unwrap_or_default();
        let env_nonempty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let gemini_api_key = env_nonempty("STORYFORGE_GEMINI_API_KEY")
            .or(gemini.api_key)
            .filter(|k| !k.trim().is_empty());

        let gemini_base_url = parse_url(
            env_nonempty("STORYFORGE_GEMINI_BASE_URL")
                .or(gemini.base_url)
                .as_deref()
                .unwrap_or(DEFAULT_GEMINI_BASE_URL),
        )?;

        let text_model = env_nonempty("STORYFORGE_GEMINI_TEXT_MODEL")
            .or(gemini.text_model)
            .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string());

        // An explicitly empty fallback disables the fallback model.
        let text_fallback_model = env("STORYFORGE_GEMINI_TEXT_FALLBACK_MODEL")
            .or(gemini.text_fallback_model)
            .unwrap_or_else(|| DEFAULT_TEXT_FALLBACK_MODEL.to_string());
        let text_fallback_model = Some(text_fallback_model.trim().to_string())
            .filter(|m| !m.is_empty());

        let image_model = env_nonempty("STORYFORGE_IMAGEN_MODEL")
            .or(gemini.image_model)
            .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());

        let text_timeout = seconds(
            "text_timeout_s",
            parse_env_f64(&env_nonempty, "STORYFORGE_GEMINI_TEXT_TIMEOUT_S")?
                .or(gemini.text_timeout_s),
            DEFAULT_TEXT_TIMEOUT,
        )?;
        let image_timeout = seconds(
            "image_timeout_s",
            parse_env_f64(&env_nonempty, "STORYFORGE_IMAGEN_TIMEOUT_S")?
                .or(gemini.image_timeout_s),
            DEFAULT_IMAGE_TIMEOUT,
        )?;

        let max_attempts = match env_nonempty("STORYFORGE_MAX_ATTEMPTS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("STORYFORGE_MAX_ATTEMPTS must be an integer, got '{raw}'"))?,
            None => retry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        };
        if max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }

        let runpod_key = env_nonempty("STORYFORGE_RUNPOD_API_KEY").or(runpod.api_key);
        let runpod_endpoint = env_nonempty("STORYFORGE_RUNPOD_ENDPOINT_ID").or(runpod.endpoint_id);
        let runpod = match (runpod_key, runpod_endpoint) {
            (Some(api_key), Some(endpoint_id)) => Some(RunpodConfig {
                api_key,
                endpoint_id,
                base_url: parse_url(
                    env_nonempty("STORYFORGE_RUNPOD_BASE_URL")
                        .or(runpod.base_url)
                        .as_deref()
                        .unwrap_or(DEFAULT_RUNPOD_BASE_URL),
                )?,
                status_timeout: seconds(
                    "status_timeout_s",
                    runpod.status_timeout_s,
                    DEFAULT_STATUS_TIMEOUT,
                )?,
            }),
            _ => None,
        };

        let text = ModelAllowlist::text();
        text.validate(&text_model)
            .context("invalid default text model")?;
        if let Some(fallback) = &text_fallback_model {
            text.validate(fallback)
                .context("invalid default text fallback model")?;
        }
        ModelAllowlist::image()
            .validate(&image_model)
            .context("invalid default image model")?;

        Ok(Self {
            gemini_api_key,
            gemini_base_url,
            text_model,
            text_fallback_model,
            text_timeout,
            image_model,
            image_timeout,
            runpod,
            max_attempts,
        })
    }
}

fn parse_env_f64(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
) -> anyhow::Result<Option<f64>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<f64>()
                .with_context(|| format!("{key} must be a number, got '{raw}'"))
        })
        .transpose()
}

fn seconds(name: &str, value: Option<f64>, default: Duration) -> anyhow::Result<Duration> {
    match value {
        None => Ok(default),
        Some(secs) if secs.is_finite() && secs > 0.0 => Ok(Duration::from_secs_f64(secs)),
        Some(secs) => Err(anyhow!("{name} must be a positive number of seconds, got {secs}")),
    }
}

fn parse_url(raw: &str) -> anyhow::Result<Url> {
    Url::parse(raw).with_context(|| format!("invalid base URL '{raw}'"))
}

fn default_url(raw: &str) -> Url {
    Url::parse(raw).unwrap_or_else(|_| unreachable!("built-in URL constant is valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let cfg = GatewayConfig::resolve(Root::default(), &env_from(&[])).unwrap();
        assert_eq!(cfg.gemini_api_key, None);
        assert_eq!(cfg.text_model, "gemini-2.5-flash");
        assert_eq!(cfg.text_fallback_model.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(cfg.text_timeout, Duration::from_secs(180));
        assert_eq!(cfg.image_timeout, Duration::from_secs(45));
        assert_eq!(cfg.max_attempts, 3);
        assert!(cfg.runpod.is_none());
    }

    #[test]
    fn env_overrides_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "gemini:\n  api_key: from-file\n  text_model: gemini-2.5-pro\n  text_timeout_s: 60\nrunpod:\n  api_key: rp\n  endpoint_id: abc123\n"
        )
        .unwrap();
        let root = GatewayConfig::read_yaml(file.path()).unwrap();
        let cfg = GatewayConfig::resolve(
            root,
            &env_from(&[
                ("STORYFORGE_GEMINI_API_KEY", "from-env"),
                ("STORYFORGE_GEMINI_TEXT_FALLBACK_MODEL", ""),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.gemini_api_key.as_deref(), Some("from-env"));
        assert_eq!(cfg.text_model, "gemini-2.5-pro");
        assert_eq!(cfg.text_fallback_model, None);
        assert_eq!(cfg.text_timeout, Duration::from_secs(60));
        let runpod = cfg.runpod.unwrap();
        assert_eq!(runpod.endpoint_id, "abc123");
        assert_eq!(runpod.base_url.as_str(), "https://api.runpod.ai/");
    }

    #[test]
    fn rejects_unknown_default_model() {
        let err = GatewayConfig::resolve(
            Root::default(),
            &env_from(&[("STORYFORGE_GEMINI_TEXT_MODEL", "gpt-4o")]),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("gpt-4o"));
    }

    #[test]
    fn debug_output_redacts_keys() {
        let cfg = GatewayConfig::resolve(
            Root::default(),
            &env_from(&[("STORYFORGE_GEMINI_API_KEY", "super-secret")]),
        )
        .unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}

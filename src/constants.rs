//! Shared constants for the storyforge gateway.

use std::time::Duration;

pub const GEMINI_2_5_FLASH: &str = "gemini-2.5-flash";
pub const GEMINI_2_5_FLASH_LITE: &str = "gemini-2.5-flash-lite";
pub const GEMINI_2_5_PRO: &str = "gemini-2.5-pro";
pub const GEMINI_2_FLASH: &str = "gemini-2.0-flash";
pub const GEMINI_3_PRO_PREVIEW: &str = "gemini-3-pro-preview";

/// Text model served by the queue backend instead of the Gemini API.
pub const QUEUE_TEXT_MODEL: &str = "runpod-qwen3-32b";

pub const GEMINI_2_5_FLASH_IMAGE: &str = "gemini-2.5-flash-image";
pub const IMAGEN_4: &str = "imagen-4.0-generate-001";
pub const IMAGEN_4_FAST: &str = "imagen-4.0-fast-generate-001";
pub const IMAGEN_3: &str = "imagen-3.0-generate-002";

pub const TEXT_MODELS: &[(&str, &str)] = &[
    (GEMINI_2_5_FLASH, "Gemini 2.5 Flash: balanced price and quality"),
    (GEMINI_2_5_FLASH_LITE, "Gemini 2.5 Flash-Lite: fastest, cheapest drafts"),
    (GEMINI_2_5_PRO, "Gemini 2.5 Pro: highest quality long-form prose"),
    (GEMINI_2_FLASH, "Gemini 2.0 Flash: previous generation"),
    (GEMINI_3_PRO_PREVIEW, "Gemini 3 Pro (preview)"),
    (QUEUE_TEXT_MODEL, "Qwen3 32B on a RunPod serverless queue"),
];

pub const IMAGE_MODELS: &[(&str, &str)] = &[
    (GEMINI_2_5_FLASH_IMAGE, "Gemini 2.5 Flash Image"),
    (IMAGEN_4, "Imagen 4"),
    (IMAGEN_4_FAST, "Imagen 4 Fast"),
    (IMAGEN_3, "Imagen 3"),
];

pub const DEFAULT_TEXT_MODEL: &str = GEMINI_2_5_FLASH;
pub const DEFAULT_TEXT_FALLBACK_MODEL: &str = GEMINI_2_5_PRO;
pub const DEFAULT_IMAGE_MODEL: &str = GEMINI_2_5_FLASH_IMAGE;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_RUNPOD_BASE_URL: &str = "https://api.runpod.ai";

pub const DEFAULT_TEXT_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_IMAGE_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const RETRYABLE_STATUS_CODES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];
/// The queue backend sits behind an edge proxy that answers 524 on long-held connections.
pub const QUEUE_RETRYABLE_STATUS_CODES: &[u16] = &[408, 425, 429, 500, 502, 503, 504, 524];

pub const MAX_ERROR_MESSAGE_CHARS: usize = 300;

pub const POLL_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const POLL_MAX_INTERVAL: Duration = Duration::from_secs(2);
pub const POLL_BACKOFF_FACTOR: f64 = 1.3;

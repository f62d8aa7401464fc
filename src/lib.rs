//! Resilient gateway between the storyforge backend and its generative AI providers.
//!
//! [`Gateway`] is the only type most callers need: build it once from a
//! [`GatewayConfig`], then call [`Gateway::generate_text`] or
//! [`Gateway::generate_image`] per request.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod prompts;
pub mod providers;
pub mod retry;
pub mod sampling;
pub mod stream;
pub mod transport;

pub use crate::config::GatewayConfig;
pub use crate::core::{GenerationRequest, ModelAllowlist, Modality};
pub use crate::error::GatewayError;
pub use crate::extract::extract_json_block;
pub use crate::gateway::Gateway;
pub use crate::sampling::SamplingConfig;
pub use crate::stream::TextStream;

pub mod gemini;
pub mod runpod;

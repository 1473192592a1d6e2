//! Inference client: OpenAI-compatible client for the model server.
//!
//! This module handles all communication with the model endpoint:
//! - Streaming and non-streaming chat completions
//! - Plain completions and embeddings
//! - SSE stream parsing with an explicit interruption marker
//! - Health and model listing for diagnostics

pub mod client;
pub mod errors;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::{LanguageModel, ModelClient};
pub use errors::InferenceError;
pub use streaming::{GenerationEvent, GenerationStream};
pub use types::{ChatMessage, ModelInfo, Role, SamplingParams};

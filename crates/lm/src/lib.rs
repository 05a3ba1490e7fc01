//! Language-model access for the decision engine.
//!
//! The engine only needs whole chat completions (the selector, input
//! builder, end-goal evaluator, and synthesiser all parse a single JSON or
//! text response), so the [`LmClient`] trait is deliberately small. Adapters
//! exist for OpenAI-compatible endpoints (OpenAI, OpenRouter, Gemini) and
//! for Anthropic's messages API.

pub mod anthropic;
pub mod dummy;
pub mod openai_compat;
pub mod registry;
pub mod retry;
pub mod traits;

pub use registry::{resolve_handles, LmHandle};
pub use traits::{ChatMessage, ChatRequest, ChatResponse, ChatRole, LmClient};

//! llmtap Provider Parsers
//!
//! Wire-format-specific parsing for the three upstream API families the
//! proxy understands:
//!
//! - [`openai`]: OpenAI chat completions (SSE streaming with `[DONE]`)
//! - [`anthropic`]: Anthropic Messages (SSE streaming with typed events)
//! - [`ollama`]: Ollama chat/generate (NDJSON streaming)
//!
//! [`registry`] maps an incoming request path plus headers to the provider,
//! its parser singleton, and the configured upstream base URL.

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod parser;
mod pricing;
pub mod registry;

pub use anthropic::AnthropicParser;
pub use ollama::OllamaParser;
pub use openai::OpenAiParser;
pub use parser::{
    ChunkSummary, ProviderParser, RequestSummary, ResponseSummary, extract_image_metadata,
};
pub use registry::{ProviderRegistry, Route, UpstreamConfig};

//! Server configuration, from CLI flags or `LLMTAP_*` environment variables

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use llmtap_providers::UpstreamConfig;

/// Transparent intercepting proxy for LLM APIs.
#[derive(Parser, Debug, Clone)]
#[command(name = "llmtap", version, about)]
pub struct Config {
    /// Host to bind the proxy to
    #[arg(long, env = "LLMTAP_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the proxy to
    #[arg(long, env = "LLMTAP_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Upstream for OpenAI-compatible requests
    #[arg(
        long,
        env = "LLMTAP_OPENAI_BASE_URL",
        default_value = "https://api.openai.com"
    )]
    pub openai_base_url: String,

    /// Upstream for Anthropic requests
    #[arg(
        long,
        env = "LLMTAP_ANTHROPIC_BASE_URL",
        default_value = "https://api.anthropic.com"
    )]
    pub anthropic_base_url: String,

    /// Upstream for Ollama requests
    #[arg(
        long,
        env = "LLMTAP_OLLAMA_BASE_URL",
        default_value = "http://localhost:11434"
    )]
    pub ollama_base_url: String,

    /// Path to the SQLite database file
    #[arg(long, env = "LLMTAP_DB_PATH", default_value = "interceptor.db")]
    pub db_path: PathBuf,

    /// Whether to store individual stream chunks (can be large)
    #[arg(
        long,
        env = "LLMTAP_STORE_STREAM_CHUNKS",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 1
    )]
    pub store_stream_chunks: bool,

    /// Log every recorded interaction
    #[arg(short, long, env = "LLMTAP_VERBOSE")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, env = "LLMTAP_QUIET")]
    pub quiet: bool,

    /// Redact API keys from stored headers
    #[arg(
        long,
        env = "LLMTAP_REDACT_API_KEYS",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 1
    )]
    pub redact_api_keys: bool,
}

impl Config {
    pub fn upstreams(&self) -> UpstreamConfig {
        UpstreamConfig {
            openai_base_url: self.openai_base_url.clone(),
            anthropic_base_url: self.anthropic_base_url.clone(),
            ollama_base_url: self.ollama_base_url.clone(),
        }
    }
}

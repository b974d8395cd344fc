//! Data model for intercepted interactions

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Upstream LLM providers the proxy understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Ollama,
    #[default]
    Unknown,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Ollama => "ollama",
            Provider::Unknown => "unknown",
        }
    }

    /// Parse a provider tag as stored in the database. Unrecognized tags map
    /// to [`Provider::Unknown`].
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "openai" => Provider::OpenAi,
            "anthropic" => Provider::Anthropic,
            "ollama" => Provider::Ollama,
            _ => Provider::Unknown,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a turn within a conversation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnType {
    /// First turn of a conversation.
    Initial,
    /// Continues the previous turn (history carried forward).
    Continuation,
    /// Previous turn requested tool calls and this turn carries their results.
    ToolResult,
    /// Continues a conversation under a different session ID.
    Handoff,
}

impl TurnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnType::Initial => "initial",
            TurnType::Continuation => "continuation",
            TurnType::ToolResult => "tool_result",
            TurnType::Handoff => "handoff",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "initial" => Some(TurnType::Initial),
            "continuation" => Some(TurnType::Continuation),
            "tool_result" => Some(TurnType::ToolResult),
            "handoff" => Some(TurnType::Handoff),
            _ => None,
        }
    }
}

impl fmt::Display for TurnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single chunk from an SSE or NDJSON stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Chunk sequence number, starting at 0.
    pub index: usize,
    /// When this chunk was received.
    pub timestamp: DateTime<Utc>,
    /// Raw line text as received on the wire.
    pub data: String,
    /// Parsed chunk content, if the line decoded as JSON.
    #[serde(default)]
    pub parsed: Option<Value>,
    /// Extracted text delta from this chunk.
    #[serde(default)]
    pub delta_text: Option<String>,
}

/// Token usage reported by a provider response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    /// Tokens spent creating a prompt cache entry (Anthropic).
    #[serde(default)]
    pub cache_creation_tokens: Option<u64>,
    /// Tokens served from a prompt cache (Anthropic).
    #[serde(default)]
    pub cache_read_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    /// Total tokens, computed from input + output when the provider did not
    /// report a total.
    pub fn computed_total(&self) -> u64 {
        match self.total_tokens {
            Some(total) => total,
            None => self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0),
        }
    }
}

/// Metadata about images in a request (sizes and media types, never the
/// raw base64 payload).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub count: usize,
    #[serde(default)]
    pub media_types: Vec<String>,
    #[serde(default)]
    pub approximate_sizes: Vec<usize>,
}

/// Estimated cost of one interaction in USD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    #[serde(default)]
    pub input_cost: f64,
    #[serde(default)]
    pub output_cost: f64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Computed metrics about the context window of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMetrics {
    /// Total messages in the request.
    pub message_count: usize,
    /// Messages with role `user`.
    pub user_turn_count: usize,
    /// Messages with role `assistant`.
    pub assistant_turn_count: usize,
    /// Messages with role `tool` or `tool_result`.
    pub tool_result_count: usize,
    /// Approximate total chars of all message content plus the system prompt.
    pub context_depth_chars: usize,
    /// Delta message count vs the previous turn (None if unknown).
    #[serde(default)]
    pub new_messages_this_turn: Option<i64>,
    /// Chars in the system prompt (0 if none).
    pub system_prompt_length: usize,
    /// First 16 hex chars of the SHA-256 of the system prompt.
    #[serde(default)]
    pub system_prompt_hash: Option<String>,
}

/// A complete intercepted request/response interaction.
///
/// Created when the request is received, mutated by the proxy handler until
/// it is persisted, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    /// Session grouping label, taken from the `/_session/{id}/` URL prefix.
    #[serde(default)]
    pub session_id: Option<String>,
    /// When the request was received.
    pub timestamp: DateTime<Utc>,

    // Request details
    pub method: String,
    pub path: String,
    /// Request headers after redaction.
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub request_body: Option<Value>,
    #[serde(default)]
    pub raw_request_body: Option<String>,

    // Provider info
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub model: Option<String>,

    // Parsed request content
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<Value>>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub image_metadata: Option<ImageMetadata>,

    // Response details
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    /// Full response body (reconstructed from the stream when streaming).
    #[serde(default)]
    pub response_body: Option<Value>,
    #[serde(default)]
    pub raw_response_body: Option<String>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub stream_chunks: Vec<StreamChunk>,

    // Extracted response content
    #[serde(default)]
    pub response_text: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<Value>>,

    // Metrics
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub cost_estimate: Option<CostEstimate>,
    #[serde(default)]
    pub time_to_first_token_ms: Option<f64>,
    #[serde(default)]
    pub total_latency_ms: Option<f64>,

    // Error info
    #[serde(default)]
    pub error: Option<String>,

    // Conversation threading
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub parent_interaction_id: Option<String>,
    /// 1-based turn index within the conversation.
    #[serde(default)]
    pub turn_number: Option<u32>,
    #[serde(default)]
    pub turn_type: Option<TurnType>,
    #[serde(default)]
    pub context_metrics: Option<ContextMetrics>,
}

impl Interaction {
    /// Create a new interaction with a fresh ID and the current timestamp.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: None,
            timestamp: Utc::now(),
            method: method.into(),
            path: path.into(),
            request_headers: HashMap::new(),
            request_body: None,
            raw_request_body: None,
            provider: Provider::Unknown,
            model: None,
            system_prompt: None,
            messages: None,
            tools: None,
            image_metadata: None,
            status_code: None,
            response_headers: HashMap::new(),
            response_body: None,
            raw_response_body: None,
            is_streaming: false,
            stream_chunks: Vec::new(),
            response_text: None,
            tool_calls: None,
            token_usage: None,
            cost_estimate: None,
            time_to_first_token_ms: None,
            total_latency_ms: None,
            error: None,
            conversation_id: None,
            parent_interaction_id: None,
            turn_number: None,
            turn_type: None,
            context_metrics: None,
        }
    }
}

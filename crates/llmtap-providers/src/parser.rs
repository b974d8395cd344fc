//! Provider parser trait and shared extraction helpers

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use llmtap_core::{CostEstimate, ImageMetadata, Provider, StreamChunk, TokenUsage};
use serde_json::Value;

/// Normalized view of a provider request body.
#[derive(Debug, Clone, Default)]
pub struct RequestSummary {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub messages: Option<Vec<Value>>,
    pub tools: Option<Vec<Value>>,
    pub is_streaming: bool,
    pub image_metadata: Option<ImageMetadata>,
}

/// Normalized view of a non-streaming response body, also produced when
/// reassembling a streamed response from its chunks.
#[derive(Debug, Clone, Default)]
pub struct ResponseSummary {
    pub model: Option<String>,
    pub response_text: Option<String>,
    pub tool_calls: Option<Vec<Value>>,
    pub token_usage: Option<TokenUsage>,
}

/// Normalized view of a single stream chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkSummary {
    /// The raw parsed chunk. On a JSON decode failure this carries
    /// `{"raw": "<line>"}` so the chunk is never lost.
    pub parsed: Option<Value>,
    pub delta_text: Option<String>,
    pub tool_call_delta: Option<Value>,
    pub token_usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    pub model: Option<String>,
}

impl ChunkSummary {
    /// Chunk summary for a line that failed to decode as JSON. Parsing never
    /// fails outright; the raw line is preserved instead.
    pub fn unparsed(data: &str) -> Self {
        Self {
            parsed: Some(serde_json::json!({ "raw": data })),
            ..Default::default()
        }
    }
}

/// Parses provider-specific request, response, and stream-chunk formats into
/// the normalized summaries above.
pub trait ProviderParser: Send + Sync {
    fn provider(&self) -> Provider;

    /// Parse a request body into normalized fields.
    fn parse_request(&self, body: &Value) -> RequestSummary;

    /// Parse a non-streaming response body into normalized fields.
    fn parse_response(&self, body: &Value) -> ResponseSummary;

    /// Parse a single stream line (SSE `data:` payload or NDJSON line).
    fn parse_stream_chunk(&self, data: &str) -> ChunkSummary;

    /// Reassemble a full response from an ordered chunk sequence.
    ///
    /// Deterministic: the same chunk list always yields the same summary.
    fn reconstruct_response(&self, chunks: &[StreamChunk]) -> ResponseSummary;

    /// Estimate cost from model and token usage.
    fn estimate_cost(
        &self,
        model: Option<&str>,
        usage: Option<&TokenUsage>,
    ) -> Option<CostEstimate> {
        let _ = (model, usage);
        None
    }
}

/// Extract image metadata from messages without retaining the raw base64.
///
/// Understands both the OpenAI `image_url` block (data: URI or remote URL)
/// and the Anthropic `image` block with a base64 source.
pub fn extract_image_metadata(messages: &[Value]) -> Option<ImageMetadata> {
    let mut count = 0;
    let mut media_types: Vec<String> = Vec::new();
    let mut sizes: Vec<usize> = Vec::new();

    for msg in messages {
        let Some(parts) = msg.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in parts {
            match part.get("type").and_then(Value::as_str) {
                Some("image_url") => {
                    let url = part
                        .get("image_url")
                        .and_then(|u| u.get("url"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    count += 1;
                    if let Some(rest) = url.strip_prefix("data:") {
                        let media_type = rest
                            .split_once(';')
                            .map(|(mime, _)| mime.to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        media_types.push(media_type);
                        let b64_data = url.split_once(',').map(|(_, data)| data).unwrap_or("");
                        sizes.push(decoded_len(b64_data));
                    } else {
                        media_types.push("url".to_string());
                        sizes.push(0);
                    }
                }
                Some("image") => {
                    let source = part.get("source");
                    count += 1;
                    media_types.push(
                        source
                            .and_then(|s| s.get("media_type"))
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                    );
                    let b64_data = source
                        .and_then(|s| s.get("data"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    sizes.push(decoded_len(b64_data));
                }
                _ => {}
            }
        }
    }

    if count == 0 {
        return None;
    }
    Some(ImageMetadata {
        count,
        media_types,
        approximate_sizes: sizes,
    })
}

fn decoded_len(b64_data: &str) -> usize {
    if b64_data.is_empty() {
        return 0;
    }
    BASE64.decode(b64_data).map(|d| d.len()).unwrap_or(0)
}

//! Ollama request/response/stream parser (NDJSON format)
//!
//! Handles both `/api/chat` (messages array) and `/api/generate` (single
//! prompt string). Streaming defaults to on, per the protocol.

use llmtap_core::{CostEstimate, Provider, StreamChunk, TokenUsage};
use serde_json::{Value, json};

use crate::parser::{ChunkSummary, ProviderParser, RequestSummary, ResponseSummary};

#[derive(Debug, Default)]
pub struct OllamaParser;

impl OllamaParser {
    pub fn new() -> Self {
        Self
    }
}

fn usage_from_counts(body: &Value) -> Option<TokenUsage> {
    let input_tokens = body.get("prompt_eval_count").and_then(Value::as_u64);
    let output_tokens = body.get("eval_count").and_then(Value::as_u64);
    if input_tokens.is_none() && output_tokens.is_none() {
        return None;
    }
    Some(TokenUsage {
        input_tokens,
        output_tokens,
        ..Default::default()
    })
}

impl ProviderParser for OllamaParser {
    fn provider(&self) -> Provider {
        Provider::Ollama
    }

    fn parse_request(&self, body: &Value) -> RequestSummary {
        let mut messages: Option<Vec<Value>> =
            body.get("messages").and_then(Value::as_array).cloned();

        let mut system_prompt = body.get("system").and_then(Value::as_str).map(String::from);

        if let Some(msgs) = &messages
            && let Some(system_msg) = msgs
                .iter()
                .find(|m| m.get("role").and_then(Value::as_str) == Some("system"))
        {
            system_prompt = system_msg
                .get("content")
                .and_then(Value::as_str)
                .map(String::from);
        }

        // /api/generate sends a bare prompt string; synthesize a single user
        // message so downstream metrics see a uniform shape
        if messages.is_none()
            && let Some(prompt) = body.get("prompt").and_then(Value::as_str)
        {
            messages = Some(vec![json!({ "role": "user", "content": prompt })]);
        }

        RequestSummary {
            model: body.get("model").and_then(Value::as_str).map(String::from),
            system_prompt,
            messages,
            tools: body.get("tools").and_then(Value::as_array).cloned(),
            // stream defaults to true for Ollama
            is_streaming: body.get("stream").and_then(Value::as_bool).unwrap_or(true),
            image_metadata: None,
        }
    }

    fn parse_response(&self, body: &Value) -> ResponseSummary {
        let mut summary = ResponseSummary {
            model: body.get("model").and_then(Value::as_str).map(String::from),
            ..Default::default()
        };

        // /api/chat format
        if let Some(message) = body.get("message") {
            summary.response_text = message
                .get("content")
                .and_then(Value::as_str)
                .map(String::from);
            summary.tool_calls = message
                .get("tool_calls")
                .and_then(Value::as_array)
                .filter(|calls| !calls.is_empty())
                .cloned();
        }

        // /api/generate format
        if let Some(response) = body.get("response").and_then(Value::as_str) {
            summary.response_text = Some(response.to_string());
        }

        summary.token_usage = usage_from_counts(body);
        summary
    }

    fn parse_stream_chunk(&self, data: &str) -> ChunkSummary {
        let Ok(parsed) = serde_json::from_str::<Value>(data) else {
            return ChunkSummary::unparsed(data);
        };

        let mut summary = ChunkSummary::default();

        // /api/chat streaming
        if let Some(content) = parsed
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
        {
            summary.delta_text = Some(content.to_string());
        }

        // /api/generate streaming
        if let Some(response) = parsed.get("response").and_then(Value::as_str) {
            summary.delta_text = Some(response.to_string());
        }

        // The terminating chunk carries final token counts
        if parsed.get("done").and_then(Value::as_bool) == Some(true) {
            summary.finish_reason = Some("done".to_string());
            summary.token_usage = usage_from_counts(&parsed);
        }

        summary.model = parsed
            .get("model")
            .and_then(Value::as_str)
            .map(String::from);
        summary.parsed = Some(parsed);
        summary
    }

    fn reconstruct_response(&self, chunks: &[StreamChunk]) -> ResponseSummary {
        let mut text_parts: Vec<&str> = Vec::new();
        let mut token_usage: Option<TokenUsage> = None;
        let mut model: Option<String> = None;

        for chunk in chunks {
            if let Some(delta) = &chunk.delta_text {
                text_parts.push(delta);
            }
            let Some(parsed) = &chunk.parsed else {
                continue;
            };
            if model.is_none()
                && let Some(chunk_model) = parsed.get("model").and_then(Value::as_str)
            {
                model = Some(chunk_model.to_string());
            }
            if parsed.get("done").and_then(Value::as_bool) == Some(true)
                && let Some(usage) = usage_from_counts(parsed)
            {
                token_usage = Some(usage);
            }
        }

        ResponseSummary {
            response_text: if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.concat())
            },
            model,
            tool_calls: None,
            token_usage,
        }
    }

    /// Ollama runs locally; cost is always zero.
    fn estimate_cost(
        &self,
        model: Option<&str>,
        _usage: Option<&TokenUsage>,
    ) -> Option<CostEstimate> {
        let model = model?;
        Some(CostEstimate {
            input_cost: 0.0,
            output_cost: 0.0,
            total_cost: 0.0,
            model: Some(model.to_string()),
            note: Some("Local model (Ollama) - no API cost".to_string()),
        })
    }
}

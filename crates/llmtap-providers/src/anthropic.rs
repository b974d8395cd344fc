//! Anthropic request/response/stream parser
//!
//! The Messages API streams typed SSE events (`message_start`,
//! `content_block_delta`, `message_delta`, ...). The event type is read from
//! the JSON payload, so only `data:` lines matter here.

use llmtap_core::{CostEstimate, Provider, StreamChunk, TokenUsage};
use serde_json::{Value, json};

use crate::parser::{
    ChunkSummary, ProviderParser, RequestSummary, ResponseSummary, extract_image_metadata,
};
use crate::pricing::{self, PricingTable};

/// Cost per million tokens (input, output) in USD.
const ANTHROPIC_PRICING: PricingTable = &[
    ("claude-opus-4", 15.00, 75.00),
    ("claude-sonnet-4", 3.00, 15.00),
    ("claude-3-5-sonnet", 3.00, 15.00),
    ("claude-3-5-haiku", 0.80, 4.00),
    ("claude-3-opus", 15.00, 75.00),
    ("claude-3-sonnet", 3.00, 15.00),
    ("claude-3-haiku", 0.25, 1.25),
];

#[derive(Debug, Default)]
pub struct AnthropicParser;

impl AnthropicParser {
    pub fn new() -> Self {
        Self
    }
}

fn usage_from_value(usage: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: usage.get("input_tokens").and_then(Value::as_u64),
        output_tokens: usage.get("output_tokens").and_then(Value::as_u64),
        cache_creation_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64),
        cache_read_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64),
        total_tokens: None,
    }
}

impl ProviderParser for AnthropicParser {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn parse_request(&self, body: &Value) -> RequestSummary {
        let messages: Vec<Value> = body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // The system field is a string or a list of text blocks
        let system_prompt = match body.get("system") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Array(blocks)) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            _ => None,
        };

        RequestSummary {
            model: body.get("model").and_then(Value::as_str).map(String::from),
            system_prompt,
            image_metadata: extract_image_metadata(&messages),
            messages: Some(messages),
            tools: body.get("tools").and_then(Value::as_array).cloned(),
            is_streaming: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
        }
    }

    fn parse_response(&self, body: &Value) -> ResponseSummary {
        let mut text_parts: Vec<String> = Vec::new();
        let mut tool_calls: Vec<Value> = Vec::new();

        if let Some(content) = body.get("content").and_then(Value::as_array) {
            for block in content {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => tool_calls.push(block.clone()),
                    Some("thinking") => {
                        let thinking = block.get("thinking").and_then(Value::as_str).unwrap_or("");
                        text_parts.push(format!("[thinking]{}[/thinking]", thinking));
                    }
                    _ => {}
                }
            }
        }

        ResponseSummary {
            model: body.get("model").and_then(Value::as_str).map(String::from),
            response_text: if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.join("\n"))
            },
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            token_usage: body
                .get("usage")
                .filter(|u| u.is_object())
                .map(usage_from_value),
        }
    }

    fn parse_stream_chunk(&self, data: &str) -> ChunkSummary {
        let Ok(parsed) = serde_json::from_str::<Value>(data) else {
            return ChunkSummary::unparsed(data);
        };

        let mut summary = ChunkSummary::default();

        match parsed.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => {
                if let Some(delta) = parsed.get("delta") {
                    match delta.get("type").and_then(Value::as_str) {
                        Some("text_delta") => {
                            summary.delta_text = delta
                                .get("text")
                                .and_then(Value::as_str)
                                .map(String::from)
                                .or(Some(String::new()));
                        }
                        Some("input_json_delta") => {
                            let partial = delta
                                .get("partial_json")
                                .and_then(Value::as_str)
                                .unwrap_or("");
                            summary.tool_call_delta = Some(json!({ "partial_json": partial }));
                        }
                        Some("thinking_delta") => {
                            summary.delta_text = delta
                                .get("thinking")
                                .and_then(Value::as_str)
                                .map(String::from)
                                .or(Some(String::new()));
                        }
                        _ => {}
                    }
                }
            }
            Some("message_delta") => {
                if let Some(delta) = parsed.get("delta")
                    && let Some(stop_reason) = delta.get("stop_reason").and_then(Value::as_str)
                {
                    summary.finish_reason = Some(stop_reason.to_string());
                }
                if let Some(usage) = parsed.get("usage").filter(|u| u.is_object()) {
                    summary.token_usage = Some(TokenUsage {
                        output_tokens: usage.get("output_tokens").and_then(Value::as_u64),
                        ..Default::default()
                    });
                }
            }
            Some("message_start") => {
                if let Some(message) = parsed.get("message") {
                    summary.model = message
                        .get("model")
                        .and_then(Value::as_str)
                        .map(String::from);
                    if let Some(usage) = message.get("usage").filter(|u| u.is_object()) {
                        summary.token_usage = Some(usage_from_value(usage));
                    }
                }
            }
            Some("content_block_start") => {
                if let Some(block) = parsed.get("content_block")
                    && block.get("type").and_then(Value::as_str) == Some("tool_use")
                {
                    summary.tool_call_delta = Some(json!({
                        "id": block.get("id").cloned().unwrap_or(Value::Null),
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "start": true,
                    }));
                }
            }
            _ => {}
        }

        summary.parsed = Some(parsed);
        summary
    }

    fn reconstruct_response(&self, chunks: &[StreamChunk]) -> ResponseSummary {
        let mut text_parts: Vec<String> = Vec::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        let mut current_tool: Option<Value> = None;
        let mut tool_json_parts: Vec<String> = Vec::new();
        let mut input_tokens: Option<u64> = None;
        let mut output_tokens: Option<u64> = None;
        let mut cache_creation_tokens: Option<u64> = None;
        let mut cache_read_tokens: Option<u64> = None;
        let mut model: Option<String> = None;

        for chunk in chunks {
            let Some(parsed) = &chunk.parsed else {
                continue;
            };

            match parsed.get("type").and_then(Value::as_str) {
                Some("message_start") => {
                    let message = parsed.get("message");
                    model = message
                        .and_then(|m| m.get("model"))
                        .and_then(Value::as_str)
                        .map(String::from);
                    if let Some(usage) = message.and_then(|m| m.get("usage")) {
                        input_tokens = usage.get("input_tokens").and_then(Value::as_u64);
                        cache_creation_tokens = usage
                            .get("cache_creation_input_tokens")
                            .and_then(Value::as_u64);
                        cache_read_tokens =
                            usage.get("cache_read_input_tokens").and_then(Value::as_u64);
                    }
                }
                Some("content_block_start") => {
                    if let Some(block) = parsed.get("content_block")
                        && block.get("type").and_then(Value::as_str) == Some("tool_use")
                    {
                        current_tool = Some(json!({
                            "type": "tool_use",
                            "id": block.get("id").and_then(Value::as_str).unwrap_or(""),
                            "name": block.get("name").and_then(Value::as_str).unwrap_or(""),
                        }));
                        tool_json_parts.clear();
                    }
                }
                Some("content_block_delta") => {
                    if let Some(delta) = parsed.get("delta") {
                        match delta.get("type").and_then(Value::as_str) {
                            Some("text_delta") => {
                                if let Some(text) = delta.get("text").and_then(Value::as_str) {
                                    text_parts.push(text.to_string());
                                }
                            }
                            Some("input_json_delta") => {
                                if let Some(partial) =
                                    delta.get("partial_json").and_then(Value::as_str)
                                {
                                    tool_json_parts.push(partial.to_string());
                                }
                            }
                            Some("thinking_delta") => {
                                if let Some(thinking) =
                                    delta.get("thinking").and_then(Value::as_str)
                                {
                                    text_parts.push(thinking.to_string());
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Some("content_block_stop") => {
                    if let Some(mut tool) = current_tool.take() {
                        let raw_json = tool_json_parts.concat();
                        // Arguments that fail to parse are kept as the raw
                        // string rather than dropped
                        tool["input"] = serde_json::from_str::<Value>(&raw_json)
                            .unwrap_or_else(|_| Value::String(raw_json));
                        tool_calls.push(tool);
                    }
                }
                Some("message_delta") => {
                    if let Some(tokens) = parsed
                        .get("usage")
                        .and_then(|u| u.get("output_tokens"))
                        .and_then(Value::as_u64)
                    {
                        output_tokens = Some(tokens);
                    }
                }
                _ => {}
            }
        }

        let token_usage = if input_tokens.is_some() || output_tokens.is_some() {
            Some(TokenUsage {
                input_tokens,
                output_tokens,
                cache_creation_tokens,
                cache_read_tokens,
                total_tokens: None,
            })
        } else {
            None
        };

        ResponseSummary {
            response_text: if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.concat())
            },
            model,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            token_usage,
        }
    }

    fn estimate_cost(
        &self,
        model: Option<&str>,
        usage: Option<&TokenUsage>,
    ) -> Option<CostEstimate> {
        let model = model?;
        let usage = usage?;
        Some(pricing::estimate_from_table(ANTHROPIC_PRICING, model, usage))
    }
}

//! OpenAI request/response/stream parser
//!
//! Covers the chat completions format, which is also spoken by a long tail
//! of compatible providers. Streaming uses SSE `data:` lines terminated by a
//! literal `[DONE]` sentinel.

use std::collections::BTreeMap;

use llmtap_core::{CostEstimate, Provider, StreamChunk, TokenUsage};
use serde_json::{Value, json};

use crate::parser::{
    ChunkSummary, ProviderParser, RequestSummary, ResponseSummary, extract_image_metadata,
};
use crate::pricing::{self, PricingTable};

/// Cost per million tokens (input, output) in USD.
const OPENAI_PRICING: PricingTable = &[
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4-turbo", 10.00, 30.00),
    ("gpt-4", 30.00, 60.00),
    ("gpt-3.5-turbo", 0.50, 1.50),
    ("o1", 15.00, 60.00),
    ("o1-mini", 3.00, 12.00),
    ("o3-mini", 1.10, 4.40),
];

#[derive(Debug, Default)]
pub struct OpenAiParser;

impl OpenAiParser {
    pub fn new() -> Self {
        Self
    }
}

fn usage_from_value(usage: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
        output_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
        total_tokens: usage.get("total_tokens").and_then(Value::as_u64),
        ..Default::default()
    }
}

impl ProviderParser for OpenAiParser {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn parse_request(&self, body: &Value) -> RequestSummary {
        let messages: Vec<Value> = body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // System prompt is the first role=system message; content may be a
        // plain string or a list of text blocks
        let system_prompt = messages
            .iter()
            .find(|msg| msg.get("role").and_then(Value::as_str) == Some("system"))
            .and_then(|msg| msg.get("content"))
            .and_then(|content| match content {
                Value::String(text) => Some(text.clone()),
                Value::Array(parts) => Some(
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
                _ => None,
            });

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
        let mut summary = ResponseSummary {
            model: body.get("model").and_then(Value::as_str).map(String::from),
            ..Default::default()
        };

        if let Some(message) = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
        {
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

        if let Some(usage) = body.get("usage").filter(|u| u.is_object()) {
            summary.token_usage = Some(usage_from_value(usage));
        }

        summary
    }

    fn parse_stream_chunk(&self, data: &str) -> ChunkSummary {
        if data.trim() == "[DONE]" {
            return ChunkSummary {
                finish_reason: Some("done".to_string()),
                parsed: Some(json!({ "done": true })),
                ..Default::default()
            };
        }

        let Ok(parsed) = serde_json::from_str::<Value>(data) else {
            return ChunkSummary::unparsed(data);
        };

        let mut summary = ChunkSummary::default();

        if let Some(choice) = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        {
            if let Some(delta) = choice.get("delta") {
                summary.delta_text = delta
                    .get("content")
                    .and_then(Value::as_str)
                    .map(String::from);
                summary.tool_call_delta = delta.get("tool_calls").cloned().filter(|v| !v.is_null());
            }
            summary.finish_reason = choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(String::from);
        }

        // Final usage chunk, emitted when stream_options.include_usage is set
        if let Some(usage) = parsed.get("usage").filter(|u| u.is_object()) {
            summary.token_usage = Some(usage_from_value(usage));
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
        let mut tool_calls: BTreeMap<u64, Value> = BTreeMap::new();
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

            // Accumulate tool call deltas: name and id land once, arguments
            // arrive as string fragments to concatenate
            if let Some(deltas) = parsed
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|choices| choices.first())
                .and_then(|choice| choice.get("delta"))
                .and_then(|delta| delta.get("tool_calls"))
                .and_then(Value::as_array)
            {
                for tc in deltas {
                    let idx = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
                    let entry = tool_calls.entry(idx).or_insert_with(|| {
                        json!({
                            "id": "",
                            "type": "function",
                            "function": { "name": "", "arguments": "" },
                        })
                    });
                    if let Some(id) = tc.get("id").and_then(Value::as_str).filter(|s| !s.is_empty())
                    {
                        entry["id"] = json!(id);
                    }
                    if let Some(func) = tc.get("function") {
                        if let Some(name) = func.get("name").and_then(Value::as_str) {
                            entry["function"]["name"] = json!(name);
                        }
                        if let Some(args) = func.get("arguments").and_then(Value::as_str) {
                            let mut accumulated = entry["function"]["arguments"]
                                .as_str()
                                .unwrap_or("")
                                .to_string();
                            accumulated.push_str(args);
                            entry["function"]["arguments"] = json!(accumulated);
                        }
                    }
                }
            }

            if let Some(usage) = parsed.get("usage").filter(|u| u.is_object()) {
                token_usage = Some(usage_from_value(usage));
            }
        }

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
                Some(tool_calls.into_values().collect())
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
        Some(pricing::estimate_from_table(OPENAI_PRICING, model, usage))
    }
}

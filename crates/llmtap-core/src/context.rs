//! Context-window metric computation
//!
//! Pure functions over a request's message list. No I/O: the one field that
//! depends on history (`new_messages_this_turn`) is filled in later by the
//! threading engine once the parent turn is known.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::ContextMetrics;

/// Compute context-window metrics from a request's messages and system
/// prompt.
///
/// Counts message roles, accumulates character lengths (handling both string
/// and block-list content), and hashes the system prompt for change
/// detection.
pub fn compute_context_metrics(
    messages: Option<&[Value]>,
    system_prompt: Option<&str>,
    prev_message_count: Option<usize>,
) -> ContextMetrics {
    let messages = messages.unwrap_or(&[]);

    let mut user_turn_count = 0;
    let mut assistant_turn_count = 0;
    let mut tool_result_count = 0;
    let mut context_depth_chars = 0;

    for msg in messages {
        match msg.get("role").and_then(Value::as_str) {
            Some("user") => user_turn_count += 1,
            Some("assistant") => assistant_turn_count += 1,
            Some("tool") | Some("tool_result") => tool_result_count += 1,
            _ => {}
        }
        if let Some(content) = msg.get("content") {
            context_depth_chars += measure_content(content);
        }
    }

    let system_prompt = system_prompt.unwrap_or("");
    let system_prompt_length = system_prompt.chars().count();
    context_depth_chars += system_prompt_length;

    let system_prompt_hash = if system_prompt.is_empty() {
        None
    } else {
        let digest = Sha256::digest(system_prompt.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Some(hex[..16].to_string())
    };

    let new_messages_this_turn =
        prev_message_count.map(|prev| messages.len() as i64 - prev as i64);

    ContextMetrics {
        message_count: messages.len(),
        user_turn_count,
        assistant_turn_count,
        tool_result_count,
        context_depth_chars,
        new_messages_this_turn,
        system_prompt_length,
        system_prompt_hash,
    }
}

/// Recursively measure the character length of message content.
///
/// Handles plain strings and lists of content blocks (vision format),
/// including nested `tool_result` content and `tool_use` inputs.
fn measure_content(content: &Value) -> usize {
    match content {
        Value::String(text) => text.chars().count(),
        Value::Array(blocks) => {
            let mut total = 0;
            for block in blocks {
                let Some(block_type) = block.get("type").and_then(Value::as_str) else {
                    continue;
                };
                match block_type {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            total += text.chars().count();
                        }
                    }
                    "tool_result" | "tool_use" => {
                        if let Some(nested) = block.get("content") {
                            total += measure_content(nested);
                        }
                        // tool_use carries an input object; approximate its
                        // size via the serialized form
                        if let Some(input) = block.get("input")
                            && !input.is_null()
                            && let Ok(serialized) = serde_json::to_string(input)
                        {
                            total += serialized.chars().count();
                        }
                    }
                    _ => {}
                }
            }
            total
        }
        _ => 0,
    }
}

//! Conversation threading engine
//!
//! Runs inside every save, before the insert. Links the interaction to a
//! conversation thread, classifies the turn, and fills the message-count
//! delta once the parent turn is known.
//!
//! Linking rules, in order:
//! 1. Explicit conversation ID (from the `x-interceptor-conversation-id`
//!    header): link to the most recent turn of that conversation.
//! 2. Session ID set: link to the most recent interaction in the session if
//!    the continuation predicate holds.
//! 3. Neither: scan the most recent interactions globally for a
//!    content-based continuation match. Best effort only.

use llmtap_core::{Interaction, TurnType};
use serde_json::Value;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::Result;
use crate::store::{fetch_conversation_turns, fetch_recent_global, fetch_recent_in_session};

/// How many recent interactions the global fallback examines.
const GLOBAL_SCAN_LIMIT: i64 = 10;

/// Determine `conversation_id`, parent, `turn_number`, and `turn_type`
/// before an interaction is inserted.
pub(crate) async fn resolve_threading(
    conn: &mut SqliteConnection,
    interaction: &mut Interaction,
) -> Result<()> {
    if let Some(conversation_id) = interaction.conversation_id.clone() {
        // Explicit conversation ID forces the thread; link to its last turn
        let existing = fetch_conversation_turns(&mut *conn, &conversation_id).await?;
        if let Some(prev) = existing.last() {
            interaction.parent_interaction_id = Some(prev.id.clone());
            interaction.turn_number = Some(prev.turn_number.unwrap_or(1) + 1);
            interaction.turn_type = Some(if prev.session_id != interaction.session_id {
                TurnType::Handoff
            } else if has_tool_call_link(interaction, prev) {
                TurnType::ToolResult
            } else {
                TurnType::Continuation
            });
            fill_new_messages_delta(interaction, prev);
        } else {
            interaction.turn_number = Some(1);
            interaction.turn_type = Some(TurnType::Initial);
        }
        return Ok(());
    }

    if let Some(session_id) = interaction.session_id.clone() {
        let recent = fetch_recent_in_session(&mut *conn, &session_id, 1).await?;
        if let Some(prev) = recent.first()
            && is_continuation(interaction, prev)
        {
            link_to_previous(interaction, prev);
        } else {
            start_conversation(interaction);
        }
        return Ok(());
    }

    // No session and no explicit conversation (e.g. the agent points its
    // base URL straight at the proxy): fall back to a content-based scan of
    // recent interactions
    let recent = fetch_recent_global(&mut *conn, GLOBAL_SCAN_LIMIT).await?;
    for prev in &recent {
        if is_continuation(interaction, prev) {
            link_to_previous(interaction, prev);
            return Ok(());
        }
    }
    start_conversation(interaction);
    Ok(())
}

fn start_conversation(interaction: &mut Interaction) {
    interaction.conversation_id = Some(Uuid::new_v4().to_string());
    interaction.turn_number = Some(1);
    interaction.turn_type = Some(TurnType::Initial);
}

fn link_to_previous(interaction: &mut Interaction, prev: &Interaction) {
    interaction.conversation_id = Some(
        prev.conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
    );
    interaction.parent_interaction_id = Some(prev.id.clone());
    interaction.turn_number = Some(prev.turn_number.unwrap_or(1) + 1);
    interaction.turn_type = Some(if has_tool_call_link(interaction, prev) {
        TurnType::ToolResult
    } else {
        TurnType::Continuation
    });
    fill_new_messages_delta(interaction, prev);
}

fn has_tool_call_link(interaction: &Interaction, prev: &Interaction) -> bool {
    prev.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) && has_tool_results(interaction)
}

/// True when `interaction` continues from `prev`.
///
/// Two signals:
/// 1. The new message list carries the previous response text (first 100
///    chars) inside an assistant message.
/// 2. The previous turn requested tool calls and this one contains tool
///    results.
pub(crate) fn is_continuation(interaction: &Interaction, prev: &Interaction) -> bool {
    let Some(messages) = &interaction.messages else {
        return false;
    };

    if let Some(response_text) = prev.response_text.as_deref().filter(|t| !t.is_empty()) {
        let check_text: String = response_text.chars().take(100).collect();
        for msg in messages {
            if msg.get("role").and_then(Value::as_str) != Some("assistant") {
                continue;
            }
            let text = assistant_text(msg.get("content"));
            if text.contains(&check_text) {
                return true;
            }
        }
    }

    prev.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) && has_tool_results(interaction)
}

fn assistant_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// True when the interaction's messages include any tool result, either as a
/// `tool`/`tool_result` role or as a `tool_result` content block.
pub(crate) fn has_tool_results(interaction: &Interaction) -> bool {
    let Some(messages) = &interaction.messages else {
        return false;
    };
    for msg in messages {
        if matches!(
            msg.get("role").and_then(Value::as_str),
            Some("tool") | Some("tool_result")
        ) {
            return true;
        }
        if let Some(blocks) = msg.get("content").and_then(Value::as_array)
            && blocks
                .iter()
                .any(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
        {
            return true;
        }
    }
    false
}

/// Set `new_messages_this_turn` from the previous turn's message count when
/// the handler left it unresolved.
fn fill_new_messages_delta(interaction: &mut Interaction, prev: &Interaction) {
    let Some(prev_metrics) = &prev.context_metrics else {
        return;
    };
    let prev_count = prev_metrics.message_count;
    if let Some(metrics) = &mut interaction.context_metrics
        && metrics.new_messages_this_turn.is_none()
    {
        metrics.new_messages_this_turn = Some(metrics.message_count as i64 - prev_count as i64);
    }
}

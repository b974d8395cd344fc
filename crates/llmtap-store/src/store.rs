//! SQLite interaction store
//!
//! One `interactions` table keyed by interaction ID. Structured fields map to
//! native columns; compound fields (headers, bodies, messages, chunks, usage,
//! cost, context metrics) persist as JSON text and round-trip losslessly.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use llmtap_core::{Interaction, Provider, TurnType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Executor, Row, Sqlite};

use crate::{Result, StoreError, migrations, threading};

/// Optional AND-combined filters for [`InteractionStore::list`].
#[derive(Debug, Clone, Default)]
pub struct InteractionFilter {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub session_id: Option<String>,
}

/// Aggregate summary of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub interaction_count: i64,
    pub first_interaction: String,
    pub last_interaction: String,
    pub providers: Vec<String>,
    pub models: Vec<String>,
    pub total_latency_ms: Option<f64>,
}

/// Aggregate summary of one conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub turn_count: i64,
    pub first_turn: String,
    pub last_turn: String,
    pub providers: Vec<String>,
    pub models: Vec<String>,
    pub total_input_tokens: Option<i64>,
    pub total_output_tokens: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCount {
    pub model: String,
    pub count: i64,
}

/// Aggregate statistics over the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_interactions: i64,
    pub by_provider: HashMap<String, i64>,
    /// Top 10 models by interaction count, descending.
    pub by_model: Vec<ModelCount>,
    pub avg_latency_ms: Option<f64>,
    pub total_conversations: i64,
    pub avg_messages_per_turn: Option<f64>,
    pub avg_context_depth_chars: Option<f64>,
    /// Turns whose system-prompt hash differs from their parent turn's.
    pub system_prompt_changes: i64,
}

/// Async SQLite store for saving and querying interactions.
#[derive(Clone)]
pub struct InteractionStore {
    pool: SqlitePool,
    store_stream_chunks: bool,
}

impl InteractionStore {
    /// Open (creating if missing) the database and apply pending migrations.
    pub async fn open(db_path: impl AsRef<Path>, store_stream_chunks: bool) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal),
            )
            .await?;

        migrations::apply_migrations(&pool).await?;

        Ok(Self {
            pool,
            store_stream_chunks,
        })
    }

    /// Close the connection pool. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Save an interaction.
    ///
    /// Runs the conversation threading engine first, so the lookup of the
    /// parent turn and the insert observe one consistent view, then upserts
    /// by primary key in the same transaction.
    pub async fn save(&self, interaction: &mut Interaction) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        threading::resolve_threading(&mut tx, interaction).await?;

        let chunks_json = if self.store_stream_chunks {
            Some(serde_json::to_string(&interaction.stream_chunks)?)
        } else {
            None
        };

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO interactions (
                id, session_id, timestamp, method, path, request_headers, request_body,
                raw_request_body, provider, model, system_prompt, messages, tools,
                image_metadata, status_code, response_headers, response_body,
                raw_response_body, is_streaming, stream_chunks, response_text,
                tool_calls, token_usage, cost_estimate, time_to_first_token_ms,
                total_latency_ms, error,
                conversation_id, parent_interaction_id, turn_number, turn_type,
                context_metrics
            ) VALUES (
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                ?, ?, ?, ?, ?
            )
            "#,
        )
        .bind(&interaction.id)
        .bind(&interaction.session_id)
        .bind(interaction.timestamp.to_rfc3339())
        .bind(&interaction.method)
        .bind(&interaction.path)
        .bind(serde_json::to_string(&interaction.request_headers)?)
        .bind(to_json_opt(&interaction.request_body)?)
        .bind(&interaction.raw_request_body)
        .bind(interaction.provider.as_str())
        .bind(&interaction.model)
        .bind(&interaction.system_prompt)
        .bind(to_json_opt(&interaction.messages)?)
        .bind(to_json_opt(&interaction.tools)?)
        .bind(to_json_opt(&interaction.image_metadata)?)
        .bind(interaction.status_code.map(|c| c as i64))
        .bind(serde_json::to_string(&interaction.response_headers)?)
        .bind(to_json_opt(&interaction.response_body)?)
        .bind(&interaction.raw_response_body)
        .bind(interaction.is_streaming)
        .bind(chunks_json)
        .bind(&interaction.response_text)
        .bind(to_json_opt(&interaction.tool_calls)?)
        .bind(to_json_opt(&interaction.token_usage)?)
        .bind(to_json_opt(&interaction.cost_estimate)?)
        .bind(interaction.time_to_first_token_ms)
        .bind(interaction.total_latency_ms)
        .bind(&interaction.error)
        .bind(&interaction.conversation_id)
        .bind(&interaction.parent_interaction_id)
        .bind(interaction.turn_number.map(|n| n as i64))
        .bind(interaction.turn_type.map(|t| t.as_str()))
        .bind(to_json_opt(&interaction.context_metrics)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Get one interaction by ID.
    pub async fn get(&self, interaction_id: &str) -> Result<Option<Interaction>> {
        let row = sqlx::query("SELECT * FROM interactions WHERE id = ?")
            .bind(interaction_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_interaction).transpose()
    }

    /// List interactions newest first, with optional filters.
    pub async fn list(
        &self,
        filter: &InteractionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Interaction>> {
        let mut sql = String::from("SELECT * FROM interactions");
        let mut conditions: Vec<&str> = Vec::new();
        if filter.provider.is_some() {
            conditions.push("provider = ?");
        }
        if filter.model.is_some() {
            conditions.push("model = ?");
        }
        if filter.session_id.is_some() {
            conditions.push("session_id = ?");
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(provider) = &filter.provider {
            query = query.bind(provider);
        }
        if let Some(model) = &filter.model {
            query = query.bind(model);
        }
        if let Some(session_id) = &filter.session_id {
            query = query.bind(session_id);
        }
        let rows = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_interaction).collect()
    }

    /// List all sessions with summary aggregates, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT
                session_id,
                COUNT(*) AS interaction_count,
                MIN(timestamp) AS first_interaction,
                MAX(timestamp) AS last_interaction,
                GROUP_CONCAT(DISTINCT provider) AS providers,
                GROUP_CONCAT(DISTINCT model) AS models,
                SUM(total_latency_ms) AS total_latency_ms
            FROM interactions
            WHERE session_id IS NOT NULL
            GROUP BY session_id
            ORDER BY first_interaction DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SessionSummary {
                    session_id: row.try_get("session_id")?,
                    interaction_count: row.try_get("interaction_count")?,
                    first_interaction: row.try_get("first_interaction")?,
                    last_interaction: row.try_get("last_interaction")?,
                    providers: split_concat(row.try_get("providers")?),
                    models: split_concat(row.try_get("models")?),
                    total_latency_ms: row.try_get("total_latency_ms")?,
                })
            })
            .collect()
    }

    /// The most recent interactions in a session, newest first.
    pub async fn get_recent_in_session(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<Interaction>> {
        fetch_recent_in_session(&self.pool, session_id, limit).await
    }

    /// Aggregate stats per conversation thread, newest first.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT
                conversation_id,
                COUNT(*) AS turn_count,
                MIN(timestamp) AS first_turn,
                MAX(timestamp) AS last_turn,
                GROUP_CONCAT(DISTINCT provider) AS providers,
                GROUP_CONCAT(DISTINCT model) AS models,
                SUM(CAST(json_extract(token_usage, '$.input_tokens') AS INTEGER))
                    AS total_input_tokens,
                SUM(CAST(json_extract(token_usage, '$.output_tokens') AS INTEGER))
                    AS total_output_tokens
            FROM interactions
            WHERE conversation_id IS NOT NULL
            GROUP BY conversation_id
            ORDER BY first_turn DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ConversationSummary {
                    conversation_id: row.try_get("conversation_id")?,
                    turn_count: row.try_get("turn_count")?,
                    first_turn: row.try_get("first_turn")?,
                    last_turn: row.try_get("last_turn")?,
                    providers: split_concat(row.try_get("providers")?),
                    models: split_concat(row.try_get("models")?),
                    total_input_tokens: row.try_get("total_input_tokens")?,
                    total_output_tokens: row.try_get("total_output_tokens")?,
                })
            })
            .collect()
    }

    /// All turns of a conversation, ordered by turn number (timestamp as the
    /// tie-breaker).
    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Vec<Interaction>> {
        fetch_conversation_turns(&self.pool, conversation_id).await
    }

    /// Delete all interactions, returning the number deleted.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM interactions")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Aggregate statistics over the whole store.
    pub async fn stats(&self) -> Result<StoreStats> {
        let total_interactions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM interactions")
            .fetch_one(&self.pool)
            .await?;

        let provider_rows =
            sqlx::query("SELECT provider, COUNT(*) AS count FROM interactions GROUP BY provider")
                .fetch_all(&self.pool)
                .await?;
        let mut by_provider = HashMap::new();
        for row in &provider_rows {
            by_provider.insert(row.try_get("provider")?, row.try_get("count")?);
        }

        let model_rows = sqlx::query(
            "SELECT model, COUNT(*) AS count FROM interactions \
             WHERE model IS NOT NULL GROUP BY model ORDER BY count DESC LIMIT 10",
        )
        .fetch_all(&self.pool)
        .await?;
        let by_model = model_rows
            .iter()
            .map(|row| {
                Ok(ModelCount {
                    model: row.try_get("model")?,
                    count: row.try_get("count")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let avg_latency_ms: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(total_latency_ms) FROM interactions WHERE total_latency_ms IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let total_conversations: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT conversation_id) FROM interactions \
             WHERE conversation_id IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let ctx_row = sqlx::query(
            r#"
            SELECT
                AVG(CAST(json_extract(context_metrics, '$.message_count') AS REAL))
                    AS avg_messages,
                AVG(CAST(json_extract(context_metrics, '$.context_depth_chars') AS REAL))
                    AS avg_depth
            FROM interactions
            WHERE context_metrics IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let avg_messages_per_turn: Option<f64> = ctx_row.try_get("avg_messages")?;
        let avg_context_depth_chars: Option<f64> = ctx_row.try_get("avg_depth")?;

        let system_prompt_changes: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM interactions i
            INNER JOIN interactions prev ON prev.id = i.parent_interaction_id
            WHERE json_extract(i.context_metrics, '$.system_prompt_hash') IS NOT NULL
              AND json_extract(prev.context_metrics, '$.system_prompt_hash') IS NOT NULL
              AND json_extract(i.context_metrics, '$.system_prompt_hash')
                  != json_extract(prev.context_metrics, '$.system_prompt_hash')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            total_interactions,
            by_provider,
            by_model,
            avg_latency_ms,
            total_conversations,
            avg_messages_per_turn,
            avg_context_depth_chars,
            system_prompt_changes,
        })
    }
}

/// All turns of a conversation in turn order. Generic over the executor so
/// the threading engine can run it inside the save transaction.
pub(crate) async fn fetch_conversation_turns<'e, E>(
    executor: E,
    conversation_id: &str,
) -> Result<Vec<Interaction>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM interactions WHERE conversation_id = ? \
         ORDER BY COALESCE(turn_number, 0) ASC, timestamp ASC",
    )
    .bind(conversation_id)
    .fetch_all(executor)
    .await?;
    rows.iter().map(row_to_interaction).collect()
}

/// Most recent interactions in a session, newest first.
pub(crate) async fn fetch_recent_in_session<'e, E>(
    executor: E,
    session_id: &str,
    limit: i64,
) -> Result<Vec<Interaction>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM interactions WHERE session_id = ? ORDER BY timestamp DESC LIMIT ?",
    )
    .bind(session_id)
    .bind(limit)
    .fetch_all(executor)
    .await?;
    rows.iter().map(row_to_interaction).collect()
}

/// Most recent interactions globally, newest first.
pub(crate) async fn fetch_recent_global<'e, E>(executor: E, limit: i64) -> Result<Vec<Interaction>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM interactions ORDER BY timestamp DESC LIMIT ?")
        .bind(limit)
        .fetch_all(executor)
        .await?;
    rows.iter().map(row_to_interaction).collect()
}

fn to_json_opt<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Into::into)
}

fn json_col<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(Into::into)
}

fn split_concat(concat: Option<String>) -> Vec<String> {
    concat
        .map(|joined| {
            joined
                .split(',')
                .filter(|part| !part.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn row_to_interaction(row: &SqliteRow) -> Result<Interaction> {
    let timestamp_raw: String = row.try_get("timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_raw)
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {timestamp_raw:?}: {e}")))?
        .with_timezone(&Utc);

    let provider_tag: String = row.try_get("provider")?;
    let turn_type: Option<String> = row.try_get("turn_type")?;

    let request_headers: String = row.try_get("request_headers")?;
    let response_headers: String = row.try_get("response_headers")?;

    Ok(Interaction {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        timestamp,
        method: row.try_get("method")?,
        path: row.try_get("path")?,
        request_headers: serde_json::from_str(&request_headers)?,
        request_body: json_col(row, "request_body")?,
        raw_request_body: row.try_get("raw_request_body")?,
        provider: Provider::from_tag(&provider_tag),
        model: row.try_get("model")?,
        system_prompt: row.try_get("system_prompt")?,
        messages: json_col(row, "messages")?,
        tools: json_col(row, "tools")?,
        image_metadata: json_col(row, "image_metadata")?,
        status_code: row
            .try_get::<Option<i64>, _>("status_code")?
            .map(|code| code as u16),
        response_headers: serde_json::from_str(&response_headers)?,
        response_body: json_col(row, "response_body")?,
        raw_response_body: row.try_get("raw_response_body")?,
        is_streaming: row.try_get("is_streaming")?,
        // A missing chunk column reads back as the empty list
        stream_chunks: json_col(row, "stream_chunks")?.unwrap_or_default(),
        response_text: row.try_get("response_text")?,
        tool_calls: json_col(row, "tool_calls")?,
        token_usage: json_col(row, "token_usage")?,
        cost_estimate: json_col(row, "cost_estimate")?,
        time_to_first_token_ms: row.try_get("time_to_first_token_ms")?,
        total_latency_ms: row.try_get("total_latency_ms")?,
        error: row.try_get("error")?,
        conversation_id: row.try_get("conversation_id")?,
        parent_interaction_id: row.try_get("parent_interaction_id")?,
        turn_number: row
            .try_get::<Option<i64>, _>("turn_number")?
            .map(|n| n as u32),
        turn_type: turn_type.as_deref().and_then(TurnType::from_tag),
        context_metrics: json_col(row, "context_metrics")?,
    })
}

//! Versioned SQLite schema for the interaction database
//!
//! Each migration runs in its own transaction; `schema_version` records the
//! versions that have been applied so an old database upgrades in place.

use sqlx::SqlitePool;

use crate::Result;

pub const SCHEMA_VERSION: i64 = 3;

const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
)
"#;

const CREATE_INTERACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS interactions (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    request_headers TEXT NOT NULL DEFAULT '{}',
    request_body TEXT,
    raw_request_body TEXT,
    provider TEXT NOT NULL DEFAULT 'unknown',
    model TEXT,
    system_prompt TEXT,
    messages TEXT,
    tools TEXT,
    image_metadata TEXT,
    status_code INTEGER,
    response_headers TEXT NOT NULL DEFAULT '{}',
    response_body TEXT,
    raw_response_body TEXT,
    is_streaming INTEGER NOT NULL DEFAULT 0,
    stream_chunks TEXT,
    response_text TEXT,
    tool_calls TEXT,
    token_usage TEXT,
    cost_estimate TEXT,
    time_to_first_token_ms REAL,
    total_latency_ms REAL,
    error TEXT
)
"#;

const CREATE_V1_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_interactions_timestamp ON interactions(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_interactions_provider ON interactions(provider)",
    "CREATE INDEX IF NOT EXISTS idx_interactions_model ON interactions(model)",
    "CREATE INDEX IF NOT EXISTS idx_interactions_path ON interactions(path)",
];

/// Apply all pending migrations, one transaction per version.
pub async fn apply_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(CREATE_SCHEMA_VERSION_TABLE).execute(pool).await?;

    let current: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;
    let current = current.unwrap_or(0);

    if current < 1 {
        let mut tx = pool.begin().await?;
        sqlx::query(CREATE_INTERACTIONS_TABLE).execute(&mut *tx).await?;
        for index_sql in CREATE_V1_INDEXES {
            sqlx::query(index_sql).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_version (version) VALUES (1)")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::debug!("applied schema migration v1");
    }

    if current < 2 {
        let mut tx = pool.begin().await?;
        sqlx::query("ALTER TABLE interactions ADD COLUMN session_id TEXT")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_interactions_session_id ON interactions(session_id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (2)")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::debug!("applied schema migration v2");
    }

    if current < 3 {
        let mut tx = pool.begin().await?;
        sqlx::query("ALTER TABLE interactions ADD COLUMN conversation_id TEXT")
            .execute(&mut *tx)
            .await?;
        sqlx::query("ALTER TABLE interactions ADD COLUMN parent_interaction_id TEXT")
            .execute(&mut *tx)
            .await?;
        sqlx::query("ALTER TABLE interactions ADD COLUMN turn_number INTEGER")
            .execute(&mut *tx)
            .await?;
        sqlx::query("ALTER TABLE interactions ADD COLUMN turn_type TEXT")
            .execute(&mut *tx)
            .await?;
        sqlx::query("ALTER TABLE interactions ADD COLUMN context_metrics TEXT")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_interactions_conversation_id \
             ON interactions(conversation_id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (3)")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::debug!("applied schema migration v3");
    }

    Ok(())
}

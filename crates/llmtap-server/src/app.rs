//! Axum application assembly and introspection routes
//!
//! Everything under `/_interceptor/` is answered locally; every other path
//! falls through to the proxy handler.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use llmtap_core::Interaction;
use llmtap_proxy::ProxyHandler;
use llmtap_store::{InteractionFilter, InteractionStore};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    store: InteractionStore,
    handler: Arc<ProxyHandler>,
}

/// Build the full router: introspection endpoints plus the catch-all proxy.
pub fn create_app(store: InteractionStore, handler: Arc<ProxyHandler>) -> axum::Router {
    let state = AppState { store, handler };

    axum::Router::new()
        .route("/_interceptor/health", get(health))
        .route("/_interceptor/stats", get(stats))
        .route("/_interceptor/sessions", get(list_sessions))
        .route(
            "/_interceptor/interactions",
            get(list_interactions).delete(clear_interactions),
        )
        .route("/_interceptor/interactions/{interaction_id}", get(get_interaction))
        .route("/_interceptor/conversations", get(list_conversations))
        .route(
            "/_interceptor/conversations/{conversation_id}",
            get(get_conversation),
        )
        .fallback(proxy_catchall)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": VERSION }))
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_error(e),
    }
}

async fn list_sessions(State(state): State<AppState>) -> Response {
    match state.store.list_sessions().await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    provider: Option<String>,
    model: Option<String>,
    session_id: Option<String>,
}

async fn list_interactions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = InteractionFilter {
        provider: query.provider,
        model: query.model,
        session_id: query.session_id,
    };
    let limit = query.limit.unwrap_or(20);
    let offset = query.offset.unwrap_or(0);

    match state.store.list(&filter, limit, offset).await {
        Ok(interactions) => {
            let previews: Vec<_> = interactions.iter().map(interaction_preview).collect();
            Json(previews).into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn clear_interactions(State(state): State<AppState>) -> Response {
    match state.store.clear().await {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_interaction(
    State(state): State<AppState>,
    Path(interaction_id): Path<String>,
) -> Response {
    match state.store.get(&interaction_id).await {
        Ok(Some(interaction)) => Json(interaction).into_response(),
        Ok(None) => not_found(),
        Err(e) => store_error(e),
    }
}

async fn list_conversations(State(state): State<AppState>) -> Response {
    match state.store.list_conversations().await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.store.get_conversation(&conversation_id).await {
        Ok(turns) if turns.is_empty() => not_found(),
        Ok(turns) => Json(turns).into_response(),
        Err(e) => store_error(e),
    }
}

async fn proxy_catchall(State(state): State<AppState>, req: Request) -> Response {
    state.handler.handle(req).await
}

/// Compact list view: full records are large (bodies, chunks), so the list
/// endpoint returns summaries with a truncated response preview.
fn interaction_preview(interaction: &Interaction) -> serde_json::Value {
    let preview = interaction.response_text.as_ref().map(|text| {
        if text.chars().count() > 200 {
            let truncated: String = text.chars().take(200).collect();
            format!("{truncated}...")
        } else {
            text.clone()
        }
    });

    json!({
        "id": interaction.id,
        "session_id": interaction.session_id,
        "timestamp": interaction.timestamp.to_rfc3339(),
        "provider": interaction.provider.as_str(),
        "model": interaction.model,
        "method": interaction.method,
        "path": interaction.path,
        "status_code": interaction.status_code,
        "is_streaming": interaction.is_streaming,
        "total_latency_ms": interaction.total_latency_ms,
        "response_text_preview": preview,
    })
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

fn store_error(error: llmtap_store::StoreError) -> Response {
    tracing::error!(error = %error, "introspection query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error.to_string() })),
    )
        .into_response()
}

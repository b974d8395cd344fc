//! llmtap — transparent intercepting proxy for LLM APIs
//!
//! Point agent code at this proxy instead of the real API base URL. Requests
//! are forwarded byte-for-byte to the detected upstream (OpenAI-compatible,
//! Anthropic, or Ollama) while a structured transcript of every interaction
//! lands in a local SQLite database.
//!
//! Usage:
//! ```bash
//! # Defaults: 127.0.0.1:8080, interceptor.db in the working directory
//! llmtap
//!
//! # Point an agent at it
//! OPENAI_BASE_URL=http://127.0.0.1:8080/v1 my-agent
//!
//! # Group an agent's traffic under a session label
//! ANTHROPIC_BASE_URL=http://127.0.0.1:8080/_session/agent-a my-agent
//!
//! # Inspect what was captured
//! curl http://127.0.0.1:8080/_interceptor/stats
//! curl http://127.0.0.1:8080/_interceptor/conversations
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use llmtap_core::Interaction;
use llmtap_providers::ProviderRegistry;
use llmtap_proxy::{HttpClientConfig, InteractionListener, ProxyHandler, create_client};
use llmtap_server::Config;
use llmtap_store::InteractionStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config);

    let store = InteractionStore::open(&config.db_path, config.store_stream_chunks).await?;
    let client = create_client(&HttpClientConfig::default())?;
    let registry = Arc::new(ProviderRegistry::new(config.upstreams()));

    let listener: Option<InteractionListener> = config.verbose.then(interaction_logger);

    let handler = Arc::new(ProxyHandler::new(
        registry,
        store.clone(),
        client,
        config.redact_api_keys,
        listener,
    ));
    let router = llmtap_server::create_app(store.clone(), handler);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("llmtap proxy listening on http://{}", addr);
    info!("  database:      {}", config.db_path.display());
    info!("  introspection: http://{}/_interceptor/stats", addr);

    let tcp_listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = if config.quiet {
        "error"
    } else if config.verbose {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Listener wired in verbose mode: one log line per recorded interaction.
fn interaction_logger() -> InteractionListener {
    Arc::new(|interaction: &Interaction| {
        info!(
            provider = %interaction.provider,
            model = interaction.model.as_deref().unwrap_or("-"),
            status = ?interaction.status_code,
            streaming = interaction.is_streaming,
            latency_ms = ?interaction.total_latency_ms,
            turn = ?interaction.turn_number,
            "interaction recorded"
        );
    })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

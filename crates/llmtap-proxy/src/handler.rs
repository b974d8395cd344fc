//! Core proxy handler: receive, detect, forward, intercept, finalize

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::StreamExt;
use llmtap_core::{Interaction, Provider, compute_context_metrics};
use llmtap_providers::{ProviderParser, ProviderRegistry, Route};
use llmtap_store::InteractionStore;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::headers::{is_excluded_request_header, is_excluded_response_header, redact_headers};
use crate::streaming::{
    StreamFormat, StreamInterceptor, inject_stream_usage, should_inject_stream_usage,
};

/// Callback invoked after each successful persist. Panics are caught and
/// logged; they never break the request.
pub type InteractionListener = Arc<dyn Fn(&Interaction) + Send + Sync>;

/// The proxy handler: owns the registry, the shared upstream client, and the
/// store, and drives one interaction per request from receipt to persist.
pub struct ProxyHandler {
    registry: Arc<ProviderRegistry>,
    store: InteractionStore,
    client: reqwest::Client,
    redact_api_keys: bool,
    listener: Option<InteractionListener>,
}

impl ProxyHandler {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: InteractionStore,
        client: reqwest::Client,
        redact_api_keys: bool,
        listener: Option<InteractionListener>,
    ) -> Self {
        Self {
            registry,
            store,
            client,
            redact_api_keys,
            listener,
        }
    }

    /// Handle one proxied request end to end.
    pub async fn handle(&self, req: Request) -> Response {
        let start = Instant::now();
        let request_time = Utc::now();

        let (parts, body) = req.into_parts();
        let mut path = parts.uri.path().to_string();
        if let Some(query) = parts.uri.query() {
            path.push('?');
            path.push_str(query);
        }
        let method = parts.method.clone();

        let raw_body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read request body");
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(json!({ "error": format!("failed to read request body: {e}") })),
                )
                    .into_response();
            }
        };

        // Header keys lowercased for detection and storage
        let request_headers: HashMap<String, String> = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        // /_session/{id}/... carries the session label; the remainder is the
        // real upstream path
        let (session_id, path) = split_session_prefix(&path);

        let route = self.registry.detect(&path, &request_headers);

        let body_json: Option<Value> = if raw_body.is_empty() {
            None
        } else {
            serde_json::from_slice(&raw_body).ok()
        };

        let mut interaction = Interaction::new(method.as_str(), path.clone());
        interaction.timestamp = request_time;
        interaction.session_id = session_id;
        interaction.request_headers = redact_headers(&request_headers, self.redact_api_keys);
        interaction.request_body = body_json.clone();
        interaction.raw_request_body = if raw_body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&raw_body).into_owned())
        };
        interaction.provider = route.provider;

        // Explicit thread linking via header
        if let Some(conversation_id) = request_headers.get("x-interceptor-conversation-id") {
            interaction.conversation_id = Some(conversation_id.clone());
        }

        if let Some(body) = &body_json
            && route.provider != Provider::Unknown
        {
            let summary = route.parser.parse_request(body);
            interaction.model = summary.model;
            interaction.system_prompt = summary.system_prompt;
            interaction.messages = summary.messages;
            interaction.tools = summary.tools;
            interaction.image_metadata = summary.image_metadata;
        }

        // Delta field stays unresolved here; threading fills it at save time
        interaction.context_metrics = Some(compute_context_metrics(
            interaction.messages.as_deref(),
            interaction.system_prompt.as_deref(),
            None,
        ));

        let mut forward_body = raw_body.clone();
        if let Some(body) = &body_json
            && should_inject_stream_usage(body, route.provider)
        {
            match serde_json::to_vec(&inject_stream_usage(body)) {
                Ok(encoded) => {
                    tracing::debug!("injecting stream_options.include_usage for OpenAI stream");
                    forward_body = Bytes::from(encoded);
                }
                Err(e) => tracing::warn!(error = %e, "failed to re-serialize injected body"),
            }
        }

        let upstream_url = format!("{}{}", route.upstream_base, path);
        tracing::debug!(
            provider = %route.provider,
            method = %method,
            url = %upstream_url,
            "forwarding request"
        );

        let mut forward_headers = reqwest::header::HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            if is_excluded_request_header(name.as_str()) {
                continue;
            }
            if let (Ok(forwarded_name), Ok(forwarded_value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                forward_headers.append(forwarded_name, forwarded_value);
            }
        }

        let upstream_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut upstream_request = self
            .client
            .request(upstream_method, &upstream_url)
            .headers(forward_headers);
        if !forward_body.is_empty() {
            upstream_request = upstream_request.body(forward_body);
        }

        let upstream_response = match upstream_request.send().await {
            Ok(response) => response,
            Err(e) => return self.upstream_error(interaction, e, start).await,
        };

        interaction.status_code = Some(upstream_response.status().as_u16());
        interaction.response_headers = upstream_response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let content_type = upstream_response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        // Ollama streams NDJSON under a plain JSON content type, so the
        // request body's stream flag (default true) decides there
        let is_streaming = content_type.contains("text/event-stream")
            || content_type.contains("application/x-ndjson")
            || (route.provider == Provider::Ollama
                && content_type.contains("application/json")
                && body_json
                    .as_ref()
                    .map(|b| b.get("stream").and_then(Value::as_bool).unwrap_or(true))
                    .unwrap_or(false));

        if is_streaming {
            interaction.is_streaming = true;
            self.handle_streaming(upstream_response, interaction, &route, start)
        } else {
            self.handle_non_streaming(upstream_response, interaction, route.parser.clone(), start)
                .await
        }
    }

    async fn handle_non_streaming(
        &self,
        upstream_response: reqwest::Response,
        mut interaction: Interaction,
        parser: Arc<dyn ProviderParser>,
        start: Instant,
    ) -> Response {
        let status = upstream_response.status().as_u16();
        let response_headers = build_response_headers(upstream_response.headers());

        let body_bytes = match upstream_response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return self.upstream_error(interaction, e, start).await,
        };
        interaction.total_latency_ms = Some(elapsed_ms(start));

        let raw_text = String::from_utf8_lossy(&body_bytes).into_owned();
        interaction.raw_response_body = Some(raw_text.clone());

        // A non-JSON body (e.g. an HTML error page) is still forwarded; only
        // the parsed view stays empty
        if let Ok(body) = serde_json::from_str::<Value>(&raw_text) {
            if interaction.provider != Provider::Unknown {
                let summary = parser.parse_response(&body);
                interaction.response_text = summary.response_text;
                interaction.tool_calls = summary.tool_calls;
                interaction.token_usage = summary.token_usage;
                if interaction.model.is_none() {
                    interaction.model = summary.model;
                }
                interaction.cost_estimate = parser
                    .estimate_cost(interaction.model.as_deref(), interaction.token_usage.as_ref());
            }
            interaction.response_body = Some(body);
        }

        finalize_interaction(&self.store, &self.listener, &mut interaction).await;

        let mut response = Response::new(Body::from(body_bytes));
        *response.status_mut() =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        *response.headers_mut() = response_headers;
        response
    }

    fn handle_streaming(
        &self,
        upstream_response: reqwest::Response,
        mut interaction: Interaction,
        route: &Route,
        start: Instant,
    ) -> Response {
        let status = upstream_response.status().as_u16();
        let response_headers = build_response_headers(upstream_response.headers());

        let format = StreamFormat::for_provider(route.provider);
        let mut interceptor = StreamInterceptor::new(route.parser.clone(), format);
        let parser = route.parser.clone();
        let store = self.store.clone();
        let listener = self.listener.clone();

        let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);

        // The tee runs in its own task so the response can be returned
        // immediately. Finalization happens when the upstream stream ends or
        // the client goes away, whichever comes first.
        tokio::spawn(async move {
            let mut upstream = upstream_response.bytes_stream();
            while let Some(block) = upstream.next().await {
                match block {
                    Ok(bytes) => {
                        interceptor.feed(&bytes);
                        if tx.send(Ok(bytes)).await.is_err() {
                            tracing::debug!(
                                interaction_id = %interaction.id,
                                "client disconnected mid-stream"
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "upstream stream error");
                        let _ = tx.send(Err(std::io::Error::other(e))).await;
                        break;
                    }
                }
            }
            drop(tx);

            interaction.total_latency_ms = Some(elapsed_ms(start));
            if let Some(first_chunk_at) = interceptor.first_chunk_at() {
                interaction.time_to_first_token_ms =
                    Some(first_chunk_at.duration_since(start).as_secs_f64() * 1000.0);
            }
            interaction.stream_chunks = interceptor.into_chunks();

            if !interaction.stream_chunks.is_empty() {
                let summary = parser.reconstruct_response(&interaction.stream_chunks);
                interaction.response_text = summary.response_text;
                interaction.tool_calls = summary.tool_calls;
                interaction.token_usage = summary.token_usage;
                if interaction.model.is_none() {
                    interaction.model = summary.model;
                }
                interaction.cost_estimate = parser
                    .estimate_cost(interaction.model.as_deref(), interaction.token_usage.as_ref());
            }

            finalize_interaction(&store, &listener, &mut interaction).await;
        });

        let body = Body::from_stream(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)));
        let mut response = Response::new(body);
        *response.status_mut() =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        *response.headers_mut() = response_headers;
        response
    }

    async fn upstream_error(
        &self,
        mut interaction: Interaction,
        error: reqwest::Error,
        start: Instant,
    ) -> Response {
        let (status, label) = if error.is_timeout() {
            (StatusCode::GATEWAY_TIMEOUT, "Timeout")
        } else {
            (StatusCode::BAD_GATEWAY, "Connection error")
        };
        tracing::warn!(error = %error, status = %status, "upstream request failed");

        interaction.error = Some(format!("{label}: {error}"));
        interaction.total_latency_ms = Some(elapsed_ms(start));
        finalize_interaction(&self.store, &self.listener, &mut interaction).await;

        (status, axum::Json(json!({ "error": error.to_string() }))).into_response()
    }
}

/// Persist the interaction and notify the listener. Store failures are
/// logged, never propagated: the response is already on its way out.
async fn finalize_interaction(
    store: &InteractionStore,
    listener: &Option<InteractionListener>,
    interaction: &mut Interaction,
) {
    if let Err(e) = store.save(interaction).await {
        tracing::error!(
            error = %e,
            interaction_id = %interaction.id,
            "failed to persist interaction"
        );
        return;
    }
    if let Some(listener) = listener
        && std::panic::catch_unwind(AssertUnwindSafe(|| listener(interaction))).is_err()
    {
        tracing::warn!(
            interaction_id = %interaction.id,
            "interaction listener panicked"
        );
    }
}

/// Split the `/_session/{id}` prefix off a path. `/_session/{id}` alone
/// maps to the root path.
pub(crate) fn split_session_prefix(path: &str) -> (Option<String>, String) {
    let Some(rest) = path.strip_prefix("/_session/") else {
        return (None, path.to_string());
    };
    match rest.split_once('/') {
        Some((session_id, tail)) => (Some(session_id.to_string()), format!("/{tail}")),
        None => (Some(rest.to_string()), "/".to_string()),
    }
}

fn build_response_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if is_excluded_response_header(name.as_str()) {
            continue;
        }
        if let (Ok(echoed_name), Ok(echoed_value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(echoed_name, echoed_value);
        }
    }
    headers
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

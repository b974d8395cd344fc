//! End-to-end proxy tests
//!
//! Each test stands up a wiremock upstream, drives the full router through
//! tower, and checks both what the client received and what landed in the
//! store.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use llmtap_core::{Provider, TurnType};
use llmtap_providers::{ProviderRegistry, UpstreamConfig};
use llmtap_proxy::{HttpClientConfig, ProxyHandler, create_client};
use llmtap_server::create_app;
use llmtap_store::{InteractionFilter, InteractionStore};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestProxy {
    app: Router,
    store: InteractionStore,
    _dir: TempDir,
}

async fn test_proxy(upstream_url: &str) -> TestProxy {
    let dir = TempDir::new().unwrap();
    let store = InteractionStore::open(dir.path().join("e2e.db"), true)
        .await
        .unwrap();
    let registry = Arc::new(ProviderRegistry::new(UpstreamConfig {
        openai_base_url: upstream_url.to_string(),
        anthropic_base_url: upstream_url.to_string(),
        ollama_base_url: upstream_url.to_string(),
    }));
    let client = create_client(&HttpClientConfig::default()).unwrap();
    let handler = Arc::new(ProxyHandler::new(
        registry,
        store.clone(),
        client,
        true,
        None,
    ));
    TestProxy {
        app: create_app(store.clone(), handler),
        store,
        _dir: dir,
    }
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// Streaming interactions persist from a background task after the body is
/// drained; poll briefly until the row appears.
async fn wait_for_interactions(store: &InteractionStore, count: usize) -> Vec<llmtap_core::Interaction> {
    for _ in 0..100 {
        let interactions = store
            .list(&InteractionFilter::default(), 50, 0)
            .await
            .unwrap();
        if interactions.len() >= count {
            return interactions;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} interactions to be persisted");
}

#[tokio::test]
async fn test_openai_non_streaming() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-test",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Test response"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8},
        })))
        .mount(&upstream)
        .await;

    let proxy = test_proxy(&upstream.uri()).await;
    let request = post_json(
        "/v1/chat/completions",
        &json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}],
        }),
    );

    let response = proxy.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Test response");

    let interactions = proxy
        .store
        .list(&InteractionFilter::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(interactions.len(), 1);
    let stored = &interactions[0];
    assert_eq!(stored.provider, Provider::OpenAi);
    assert_eq!(stored.model.as_deref(), Some("gpt-4o"));
    assert_eq!(stored.response_text.as_deref(), Some("Test response"));
    assert_eq!(stored.status_code, Some(200));
    assert!(!stored.is_streaming);
    assert_eq!(stored.token_usage.as_ref().unwrap().computed_total(), 8);
    assert!(stored.total_latency_ms.unwrap() > 0.0);
    // Cost follows the gpt-4o table entry
    let cost = stored.cost_estimate.as_ref().unwrap();
    assert!((cost.total_cost - (cost.input_cost + cost.output_cost)).abs() < 1e-12);
}

#[tokio::test]
async fn test_anthropic_streaming() {
    let sse_body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":12}}}\n",
        "\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello from Anthropic\"}}\n",
        "\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n",
        "\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n",
        "\n",
    );

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes(), "text/event-stream"),
        )
        .mount(&upstream)
        .await;

    let proxy = test_proxy(&upstream.uri()).await;
    let request = post_json(
        "/v1/messages",
        &json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 256,
            "stream": true,
            "messages": [{"role": "user", "content": "Hello"}],
        }),
    );

    let response = proxy.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Byte fidelity: the client sees exactly what the upstream sent
    let forwarded = body_bytes(response).await;
    assert_eq!(forwarded, sse_body.as_bytes());

    let interactions = wait_for_interactions(&proxy.store, 1).await;
    let stored = &interactions[0];
    assert!(stored.is_streaming);
    assert_eq!(stored.provider, Provider::Anthropic);
    assert_eq!(stored.response_text.as_deref(), Some("Hello from Anthropic"));
    let usage = stored.token_usage.as_ref().unwrap();
    assert_eq!(usage.input_tokens, Some(12));
    assert_eq!(usage.output_tokens, Some(4));
    // All five events captured as chunks, indexes contiguous
    assert_eq!(stored.stream_chunks.len(), 5);
    for (i, chunk) in stored.stream_chunks.iter().enumerate() {
        assert_eq!(chunk.index, i);
    }
    // Latency ordering
    let ttft = stored.time_to_first_token_ms.unwrap();
    let total = stored.total_latency_ms.unwrap();
    assert!(ttft <= total);
}

#[tokio::test]
async fn test_ollama_ndjson_streaming() {
    let ndjson_body = concat!(
        "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"Hello\"},\"done\":false}\n",
        "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"!\"},\"done\":false}\n",
        "{\"model\":\"llama3.2\",\"done\":true,\"prompt_eval_count\":5,\"eval_count\":2}\n",
    );

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(ndjson_body.as_bytes(), "application/x-ndjson"),
        )
        .mount(&upstream)
        .await;

    let proxy = test_proxy(&upstream.uri()).await;
    let request = post_json(
        "/api/chat",
        &json!({
            "model": "llama3.2",
            "messages": [{"role": "user", "content": "Hello"}],
        }),
    );

    let response = proxy.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let forwarded = body_bytes(response).await;
    assert_eq!(forwarded, ndjson_body.as_bytes());

    let interactions = wait_for_interactions(&proxy.store, 1).await;
    let stored = &interactions[0];
    assert_eq!(stored.provider, Provider::Ollama);
    assert!(stored.is_streaming);
    assert_eq!(stored.response_text.as_deref(), Some("Hello!"));
    let usage = stored.token_usage.as_ref().unwrap();
    assert_eq!(usage.input_tokens, Some(5));
    assert_eq!(usage.output_tokens, Some(2));
    assert_eq!(stored.stream_chunks.len(), 3);
    // Local models never cost anything
    assert_eq!(stored.cost_estimate.as_ref().unwrap().total_cost, 0.0);
}

#[tokio::test]
async fn test_openai_stream_usage_injection() {
    let upstream = MockServer::start().await;
    // The upstream must see include_usage even though the client never sent it
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(
            json!({"stream_options": {"include_usage": true}}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n".as_bytes(),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = test_proxy(&upstream.uri()).await;
    let request = post_json(
        "/v1/chat/completions",
        &json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [{"role": "user", "content": "Hello"}],
        }),
    );

    let response = proxy.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_bytes(response).await;

    let interactions = wait_for_interactions(&proxy.store, 1).await;
    // The stored request body reflects what the client sent: no injection
    let stored_body = interactions[0].request_body.as_ref().unwrap();
    assert!(stored_body.get("stream_options").is_none());

    upstream.verify().await;
}

#[tokio::test]
async fn test_connection_refused_returns_502() {
    // Nothing listens on port 1
    let proxy = test_proxy("http://127.0.0.1:1").await;
    let request = post_json(
        "/v1/chat/completions",
        &json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}],
        }),
    );

    let response = proxy.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert!(body["error"].as_str().unwrap().len() > 0);

    let interactions = proxy
        .store
        .list(&InteractionFilter::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(interactions.len(), 1);
    let stored = &interactions[0];
    assert!(stored.status_code.is_none());
    assert!(stored.error.is_some());
    assert!(stored.total_latency_ms.is_some());
}

#[tokio::test]
async fn test_threading_via_session() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-test",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Test response"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8},
        })))
        .mount(&upstream)
        .await;

    let proxy = test_proxy(&upstream.uri()).await;

    let first = post_json(
        "/_session/sess-1/v1/chat/completions",
        &json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}],
        }),
    );
    let response = proxy.app.clone().oneshot(first).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Second turn carries the first response back as an assistant message
    let second = post_json(
        "/_session/sess-1/v1/chat/completions",
        &json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": "Test response"},
                {"role": "user", "content": "And again?"},
            ],
        }),
    );
    let response = proxy.app.clone().oneshot(second).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let interactions = proxy
        .store
        .list(&InteractionFilter::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(interactions.len(), 2);
    // Newest first
    let (second_turn, first_turn) = (&interactions[0], &interactions[1]);
    assert_eq!(first_turn.session_id.as_deref(), Some("sess-1"));
    assert_eq!(first_turn.path, "/v1/chat/completions");
    assert_eq!(first_turn.turn_number, Some(1));
    assert_eq!(first_turn.turn_type, Some(TurnType::Initial));

    assert_eq!(second_turn.conversation_id, first_turn.conversation_id);
    assert_eq!(
        second_turn.parent_interaction_id.as_deref(),
        Some(first_turn.id.as_str())
    );
    assert_eq!(second_turn.turn_number, Some(2));
    assert_eq!(second_turn.turn_type, Some(TurnType::Continuation));
    assert_eq!(
        second_turn
            .context_metrics
            .as_ref()
            .unwrap()
            .new_messages_this_turn,
        Some(2)
    );
}

#[tokio::test]
async fn test_header_redaction_in_store() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&upstream)
        .await;

    let proxy = test_proxy(&upstream.uri()).await;
    let request = Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("content-type", "application/json")
        .header("authorization", "Bearer sk-secret1234567890")
        .body(Body::from(
            serde_json::to_vec(&json!({"model": "gpt-4o", "messages": []})).unwrap(),
        ))
        .unwrap();

    proxy.app.clone().oneshot(request).await.unwrap();

    let interactions = proxy
        .store
        .list(&InteractionFilter::default(), 10, 0)
        .await
        .unwrap();
    let stored = &interactions[0].request_headers["authorization"];
    assert!(stored.contains("***"));
    assert!(!stored.contains("secret1234567890"));
}

#[tokio::test]
async fn test_upstream_error_status_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "Rate limit exceeded", "type": "rate_limit_error"},
        })))
        .mount(&upstream)
        .await;

    let proxy = test_proxy(&upstream.uri()).await;
    let request = post_json(
        "/v1/chat/completions",
        &json!({"model": "gpt-4o", "messages": []}),
    );

    let response = proxy.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let interactions = proxy
        .store
        .list(&InteractionFilter::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(interactions[0].status_code, Some(429));
    // The error body was still JSON, so it was parsed and stored
    assert!(interactions[0].response_body.is_some());
}

#[tokio::test]
async fn test_malformed_request_body_still_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&upstream)
        .await;

    let proxy = test_proxy(&upstream.uri()).await;
    let request = Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from("this is {not json"))
        .unwrap();

    let response = proxy.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let interactions = proxy
        .store
        .list(&InteractionFilter::default(), 10, 0)
        .await
        .unwrap();
    let stored = &interactions[0];
    assert!(stored.request_body.is_none());
    assert_eq!(stored.raw_request_body.as_deref(), Some("this is {not json"));
    // Parsers were skipped, so no model was extracted
    assert!(stored.model.is_none());
}

#[tokio::test]
async fn test_introspection_endpoints() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Test response"},
                "finish_reason": "stop",
            }],
        })))
        .mount(&upstream)
        .await;

    let proxy = test_proxy(&upstream.uri()).await;

    // Health
    let response = proxy
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/_interceptor/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());

    // Record one interaction through the proxy
    let request = post_json(
        "/_session/intro/v1/chat/completions",
        &json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "Hi"}]}),
    );
    proxy.app.clone().oneshot(request).await.unwrap();

    // Stats
    let response = proxy
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/_interceptor/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let stats: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(stats["total_interactions"], 1);
    assert_eq!(stats["by_provider"]["openai"], 1);

    // List
    let response = proxy
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/_interceptor/interactions?limit=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["provider"], "openai");
    assert_eq!(listed[0]["response_text_preview"], "Test response");
    let interaction_id = listed[0]["id"].as_str().unwrap().to_string();

    // Full record
    let response = proxy
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/_interceptor/interactions/{interaction_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let full: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(full["id"], interaction_id.as_str());
    assert_eq!(full["session_id"], "intro");

    // Unknown record is a 404
    let response = proxy
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/_interceptor/interactions/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Sessions
    let response = proxy
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/_interceptor/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let sessions: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(sessions[0]["session_id"], "intro");

    // Conversations
    let response = proxy
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/_interceptor/conversations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let conversations: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let conversation_id = conversations[0]["conversation_id"].as_str().unwrap().to_string();

    let response = proxy
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/_interceptor/conversations/{conversation_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let turns: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(turns.as_array().unwrap().len(), 1);

    // Clear
    let response = proxy
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/_interceptor/interactions")
                .method("DELETE")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let cleared: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(cleared["deleted"], 1);
}

#[tokio::test]
async fn test_explicit_conversation_header() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Turn"},
                "finish_reason": "stop",
            }],
        })))
        .mount(&upstream)
        .await;

    let proxy = test_proxy(&upstream.uri()).await;

    for content in ["first", "second"] {
        let request = Request::builder()
            .uri("/v1/chat/completions")
            .method("POST")
            .header("content-type", "application/json")
            .header("x-interceptor-conversation-id", "forced-thread")
            .body(Body::from(
                serde_json::to_vec(&json!({
                    "model": "gpt-4o",
                    "messages": [{"role": "user", "content": content}],
                }))
                .unwrap(),
            ))
            .unwrap();
        proxy.app.clone().oneshot(request).await.unwrap();
    }

    let turns = proxy.store.get_conversation("forced-thread").await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].turn_number, Some(1));
    assert_eq!(turns[1].turn_number, Some(2));
    assert_eq!(
        turns[1].parent_interaction_id.as_deref(),
        Some(turns[0].id.as_str())
    );
}

//! Provider detection from request path and headers

use std::collections::HashMap;
use std::sync::Arc;

use llmtap_core::Provider;

use crate::anthropic::AnthropicParser;
use crate::ollama::OllamaParser;
use crate::openai::OpenAiParser;
use crate::parser::ProviderParser;

/// Upstream base URLs, one per provider family.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    pub ollama_base_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
        }
    }
}

/// Result of provider detection: which provider, the parser singleton for it,
/// and the upstream base URL to forward to.
#[derive(Clone)]
pub struct Route {
    pub provider: Provider,
    pub parser: Arc<dyn ProviderParser>,
    pub upstream_base: String,
}

/// Detects the provider from request path and headers.
pub struct ProviderRegistry {
    upstreams: UpstreamConfig,
    openai: Arc<OpenAiParser>,
    anthropic: Arc<AnthropicParser>,
    ollama: Arc<OllamaParser>,
}

impl ProviderRegistry {
    pub fn new(upstreams: UpstreamConfig) -> Self {
        Self {
            upstreams,
            openai: Arc::new(OpenAiParser::new()),
            anthropic: Arc::new(AnthropicParser::new()),
            ollama: Arc::new(OllamaParser::new()),
        }
    }

    /// Detect the provider for a request. `headers` keys must be lowercase.
    ///
    /// First match wins:
    /// 1. `/v1/messages*` is Anthropic
    /// 2. other `/v1/*` with an `anthropic-version` header is Anthropic
    /// 3. `/api/*` is Ollama
    /// 4. other `/v1/*` is OpenAI
    /// 5. `/_interceptor/*` is reserved (routed before reaching here)
    /// 6. everything else goes to Ollama, which also answers root probes and
    ///    non-versioned endpoints like `HEAD /` and `GET /api/tags`
    pub fn detect(&self, path: &str, headers: &HashMap<String, String>) -> Route {
        if path.starts_with("/v1/messages") {
            return self.route(Provider::Anthropic);
        }

        if path.starts_with("/v1/") && headers.contains_key("anthropic-version") {
            return self.route(Provider::Anthropic);
        }

        if path.starts_with("/api/") {
            return self.route(Provider::Ollama);
        }

        if path.starts_with("/v1/") {
            return self.route(Provider::OpenAi);
        }

        if path.starts_with("/_interceptor/") {
            return Route {
                provider: Provider::Unknown,
                parser: self.openai.clone(),
                upstream_base: String::new(),
            };
        }

        self.route(Provider::Ollama)
    }

    fn route(&self, provider: Provider) -> Route {
        let (parser, upstream_base): (Arc<dyn ProviderParser>, &str) = match provider {
            Provider::OpenAi => (self.openai.clone(), &self.upstreams.openai_base_url),
            Provider::Anthropic => (self.anthropic.clone(), &self.upstreams.anthropic_base_url),
            Provider::Ollama | Provider::Unknown => {
                (self.ollama.clone(), &self.upstreams.ollama_base_url)
            }
        };
        Route {
            provider,
            parser,
            upstream_base: upstream_base.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(UpstreamConfig::default())
    }

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_anthropic_messages() {
        let route = registry().detect("/v1/messages", &no_headers());
        assert_eq!(route.provider, Provider::Anthropic);
        assert_eq!(route.parser.provider(), Provider::Anthropic);
        assert_eq!(route.upstream_base, "https://api.anthropic.com");
    }

    #[test]
    fn test_anthropic_messages_with_params() {
        let route = registry().detect("/v1/messages?beta=true", &no_headers());
        assert_eq!(route.provider, Provider::Anthropic);
    }

    #[test]
    fn test_anthropic_header_on_other_v1_path() {
        let mut headers = HashMap::new();
        headers.insert("anthropic-version".to_string(), "2023-06-01".to_string());
        let route = registry().detect("/v1/complete", &headers);
        assert_eq!(route.provider, Provider::Anthropic);
    }

    #[test]
    fn test_openai_chat_completions() {
        let route = registry().detect("/v1/chat/completions", &no_headers());
        assert_eq!(route.provider, Provider::OpenAi);
        assert_eq!(route.upstream_base, "https://api.openai.com");
    }

    #[test]
    fn test_openai_embeddings() {
        let route = registry().detect("/v1/embeddings", &no_headers());
        assert_eq!(route.provider, Provider::OpenAi);
    }

    #[test]
    fn test_ollama_chat() {
        let route = registry().detect("/api/chat", &no_headers());
        assert_eq!(route.provider, Provider::Ollama);
        assert_eq!(route.upstream_base, "http://localhost:11434");
    }

    #[test]
    fn test_ollama_generate() {
        let route = registry().detect("/api/generate", &no_headers());
        assert_eq!(route.provider, Provider::Ollama);
    }

    #[test]
    fn test_unknown_path_goes_to_ollama() {
        // Root probes and non-versioned endpoints belong to Ollama
        let route = registry().detect("/", &no_headers());
        assert_eq!(route.provider, Provider::Ollama);

        let route = registry().detect("/some/other/path", &no_headers());
        assert_eq!(route.provider, Provider::Ollama);
    }

    #[test]
    fn test_internal_endpoint_reserved() {
        let route = registry().detect("/_interceptor/stats", &no_headers());
        assert_eq!(route.provider, Provider::Unknown);
        assert!(route.upstream_base.is_empty());
    }

    #[test]
    fn test_custom_upstream_urls() {
        let registry = ProviderRegistry::new(UpstreamConfig {
            openai_base_url: "http://localhost:9001".to_string(),
            anthropic_base_url: "http://localhost:9002".to_string(),
            ollama_base_url: "http://localhost:9003".to_string(),
        });
        assert_eq!(
            registry.detect("/v1/chat/completions", &no_headers()).upstream_base,
            "http://localhost:9001"
        );
        assert_eq!(
            registry.detect("/v1/messages", &no_headers()).upstream_base,
            "http://localhost:9002"
        );
        assert_eq!(
            registry.detect("/api/chat", &no_headers()).upstream_base,
            "http://localhost:9003"
        );
    }
}

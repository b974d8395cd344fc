//! SSE and NDJSON stream interception
//!
//! The interceptor never touches the bytes the client sees: the handler
//! forwards every upstream block as-is and feeds the same block here, where
//! a buffered copy is split into lines and parsed into chunk records. At
//! most one incomplete trailing line is ever buffered.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use llmtap_core::{Provider, StreamChunk};
use llmtap_providers::ProviderParser;
use serde_json::{Value, json};

/// How stream lines are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// Server-Sent Events: only `data:` lines carry payloads.
    Sse,
    /// Newline-delimited JSON: every non-empty line is a payload.
    Ndjson,
}

impl StreamFormat {
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::Ollama => StreamFormat::Ndjson,
            _ => StreamFormat::Sse,
        }
    }
}

/// Parses a buffered copy of a response stream into ordered chunk records.
pub struct StreamInterceptor {
    parser: Arc<dyn ProviderParser>,
    format: StreamFormat,
    chunks: Vec<StreamChunk>,
    buffer: String,
    first_chunk_at: Option<Instant>,
}

impl StreamInterceptor {
    pub fn new(parser: Arc<dyn ProviderParser>, format: StreamFormat) -> Self {
        Self {
            parser,
            format,
            chunks: Vec::new(),
            buffer: String::new(),
            first_chunk_at: None,
        }
    }

    /// Feed one upstream byte block. Complete lines are parsed immediately;
    /// a trailing partial line waits for the next block.
    pub fn feed(&mut self, block: &[u8]) {
        if self.first_chunk_at.is_none() {
            self.first_chunk_at = Some(Instant::now());
        }
        let now = Utc::now();

        self.buffer.push_str(&String::from_utf8_lossy(block));

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match self.format {
                StreamFormat::Sse => self.push_sse_line(line, now),
                StreamFormat::Ndjson => self.push_chunk(line, line, now),
            }
        }
    }

    fn push_sse_line(&mut self, line: &str, timestamp: DateTime<Utc>) {
        // event:, id:, retry: and comment lines carry no payload
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() {
            return;
        }
        self.push_chunk(line, data, timestamp);
    }

    fn push_chunk(&mut self, raw_line: &str, data: &str, timestamp: DateTime<Utc>) {
        let summary = self.parser.parse_stream_chunk(data);
        self.chunks.push(StreamChunk {
            index: self.chunks.len(),
            timestamp,
            data: raw_line.to_string(),
            parsed: summary.parsed,
            delta_text: summary.delta_text,
        });
    }

    pub fn chunks(&self) -> &[StreamChunk] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<StreamChunk> {
        self.chunks
    }

    /// When the first upstream block arrived, if any has.
    pub fn first_chunk_at(&self) -> Option<Instant> {
        self.first_chunk_at
    }
}

/// True when the proxy should inject `stream_options.include_usage` into an
/// OpenAI streaming request. This is the proxy's only request mutation.
pub fn should_inject_stream_usage(body: &Value, provider: Provider) -> bool {
    if provider != Provider::OpenAi {
        return false;
    }
    if body.get("stream").and_then(Value::as_bool) != Some(true) {
        return false;
    }
    !body
        .get("stream_options")
        .and_then(|opts| opts.get("include_usage"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Return a copy of the body with `stream_options.include_usage` set. The
/// original stays untouched so the stored request reflects what the client
/// actually sent.
pub fn inject_stream_usage(body: &Value) -> Value {
    let mut modified = body.clone();
    if let Value::Object(map) = &mut modified {
        let options = map
            .entry("stream_options".to_string())
            .or_insert_with(|| json!({}));
        match options {
            Value::Object(opts) => {
                opts.insert("include_usage".to_string(), Value::Bool(true));
            }
            other => *other = json!({ "include_usage": true }),
        }
    }
    modified
}

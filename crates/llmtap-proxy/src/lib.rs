//! llmtap Proxy Core
//!
//! The transparent intercepting proxy itself:
//!
//! - [`handler`]: receive, detect, forward, intercept, finalize
//! - [`streaming`]: the byte-faithful stream tee and the single permitted
//!   request mutation (OpenAI stream-usage injection)
//! - [`headers`]: hop-by-hop filtering and API-key redaction
//! - [`client`]: shared upstream HTTP client construction

pub mod client;
pub mod handler;
pub mod headers;
pub mod streaming;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

pub use client::{HttpClientConfig, create_client};
pub use handler::{InteractionListener, ProxyHandler};
pub use streaming::{StreamFormat, StreamInterceptor};

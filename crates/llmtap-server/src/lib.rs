//! llmtap Server
//!
//! Assembles the proxy into an HTTP application: the catch-all proxy route,
//! the `/_interceptor/` introspection API, and configuration.

pub mod app;
pub mod config;

pub use app::create_app;
pub use config::Config;

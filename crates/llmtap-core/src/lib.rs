//! llmtap Core Types
//!
//! This crate provides the fundamental types shared by every other llmtap
//! crate:
//!
//! - [`model`]: the [`model::Interaction`] record and its component types
//!   (token usage, cost estimates, stream chunks, context metrics)
//! - [`context`]: pure context-window metric computation over a message list

pub mod context;
pub mod model;

pub use context::compute_context_metrics;
pub use model::{
    ContextMetrics, CostEstimate, ImageMetadata, Interaction, Provider, StreamChunk, TokenUsage,
    TurnType,
};

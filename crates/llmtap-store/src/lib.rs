//! llmtap Interaction Storage
//!
//! Transactional SQLite persistence for intercepted interactions, plus the
//! conversation threading engine that runs inside every save:
//!
//! - [`migrations`]: versioned schema DDL
//! - [`store`]: the [`store::InteractionStore`] with typed queries
//! - [`threading`]: conversation linking rules and turn classification

pub mod migrations;
pub mod store;
pub mod threading;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub use store::{
    ConversationSummary, InteractionFilter, InteractionStore, ModelCount, SessionSummary,
    StoreStats,
};

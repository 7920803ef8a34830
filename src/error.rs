//! Error types for burstline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Handoff error: {0}")]
    Handoff(#[from] HandoffError),
}

/// Configuration-related errors.
///
/// Sweeps never fail on these; the loader logs them and substitutes defaults.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Inbound event errors. These are dropped and logged, never retried.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Malformed event: {0}")]
    Malformed(String),
}

/// Processing pipeline transport errors.
///
/// An explicit `success: false` outcome is not an error; these cover calls
/// that never produced an outcome at all.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline request failed: {0}")]
    Request(String),

    #[error("Invalid pipeline response: {0}")]
    InvalidResponse(String),

    #[error("Pipeline call timed out after {0:?}")]
    Timeout(Duration),
}

/// Handoff state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("Conversation {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Conversation {id} not found")]
    NotFound { id: Uuid },
}

/// Result type alias for the coordinator.
pub type Result<T> = std::result::Result<T, Error>;

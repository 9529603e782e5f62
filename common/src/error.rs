use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Error taxonomy for the data plane.
///
/// Variants map onto the error-handling design's error kinds: transient
/// transport, malformed external data, resource exhaustion, schema
/// mismatch, integrity violation, and unexpected crash. Call sites match on
/// kind, not on message text.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Graph mapper error: {0}")]
    GraphMapper(String),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Ingestion processing error: {0}")]
    Processing(String),
    /// Resource exhaustion: an embedding batch too large for the device.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Runtime embedding dimension diverges from the persisted configuration.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether this error kind warrants a retry under an exponential-backoff
    /// policy, rather than being terminal for the current item.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Reqwest(_) | AppError::ObjectStore(_)
        )
    }
}

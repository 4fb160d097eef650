use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Ingestion queue is full")]
    QueueFull,
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("LLM unavailable: {0}")]
    LLMUnavailable(String),
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Session is busy with a concurrent answer")]
    SessionBusy,
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Internal service error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a retry of the failed downstream call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DeadlineExceeded(_) => true,
            Self::OpenAI(err) => matches!(
                err,
                OpenAIError::Reqwest(_) | OpenAIError::StreamError(_) | OpenAIError::ApiError(_)
            ),
            _ => false,
        }
    }
}

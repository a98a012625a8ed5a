use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),
    #[error("Extraction error: {0}")]
    Extraction(String),
    #[error("Unparseable document: {0}")]
    UnparseableDocument(String),
    #[error("Extraction timed out after {0} seconds")]
    ExtractionTimeout(u64),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Materialization error: {0}")]
    Materialization(String),
    #[error("Worker lease lost: {0}")]
    LeaseLost(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

pub mod assemble;
pub mod cache;
pub mod classify;
pub mod fallback;
pub mod grouping;
pub mod llm;
pub mod parser;
pub mod prompt;
pub mod research;
pub mod retrieval;
pub mod rules;
pub mod runner;
pub mod taxonomy;

use thiserror::Error;

use crate::db::DatabaseError;
use llm::LlmError;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Taxonomy error: {0}")]
    Taxonomy(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Supplier research failed for '{supplier}': {reason}")]
    Research { supplier: String, reason: String },

    #[error("Invalid engine input: {0}")]
    Input(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub mod config;
pub mod db;
pub mod engine;
pub mod models;

pub use config::{EngineConfig, RetrievalConfig};
pub use engine::llm::{LlmClient, LlmError, MockLlmClient};
pub use engine::runner::{ClassificationEngine, RunHandle, RunOptions};
pub use engine::ClassifyError;
pub use models::result::OutputRow;
pub use models::row::TransactionRow;

use tracing_subscriber::EnvFilter;

/// Install a tracing subscriber for binaries and integration harnesses.
///
/// Library consumers that already manage a subscriber should skip this;
/// calling it twice is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

//! Engine tunables.
//!
//! Everything the pipeline treats as a knob lives here: grouping columns,
//! batch sizing, retry policy, worker count, and the retrieval weights.
//! Defaults match observed production values; callers override per run.

use serde::{Deserialize, Serialize};

/// Reserved terminal category for rows the engine could not classify.
pub const UNKNOWN_CATEGORY: &str = "Unknown";

/// Sentinel for a missing grouping-key component. Distinct from the empty
/// string so that "field absent" and "field blank" never collide.
pub const NULL_SENTINEL: &str = "<NULL>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Columns whose normalized values form the invoice key, in order.
    pub grouping_columns: Vec<String>,
    /// Hard cap on uncached rows sent to the LLM in one call.
    pub max_rows_per_batch: usize,
    /// Deduplicated line descriptions kept in an invoice-level prompt.
    pub max_line_descriptions: usize,
    /// Deduplicated GL descriptions kept in an invoice-level prompt.
    pub max_gl_descriptions: usize,
    /// Freshness window for persisted supplier profile snapshots.
    /// `None` accepts any age.
    pub supplier_cache_max_age_days: Option<u32>,
    /// LLM call retries before a batch is routed to fallback.
    pub max_retries: u32,
    /// First retry delay; doubles on each subsequent attempt.
    pub initial_backoff_ms: u64,
    /// Invoice-level worker threads.
    pub max_workers: usize,
    pub retrieval: RetrievalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grouping_columns: vec![
                "invoice_date".to_string(),
                "company".to_string(),
                "supplier_name".to_string(),
                "creation_date".to_string(),
            ],
            max_rows_per_batch: 50,
            max_line_descriptions: 5,
            max_gl_descriptions: 3,
            supplier_cache_max_age_days: None,
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_workers: 4,
            retrieval: RetrievalConfig::default(),
        }
    }
}

/// Weights and budgets for the hybrid taxonomy search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Weight of the token-overlap score in the combined score.
    pub keyword_weight: f32,
    /// Weight of the embedding cosine score in the combined score.
    pub semantic_weight: f32,
    /// Combined-score floor; weaker candidates are dropped.
    pub min_score: f32,
    /// Keyword score above which a path is kept even when the semantic
    /// search missed it entirely.
    pub keyword_rescue_threshold: f32,
    /// Candidates pulled from the embedding index per query variation.
    pub top_k: usize,
    /// L1 groups surfaced to the prompt.
    pub max_l1_categories: usize,
    /// Paths kept per L1 group.
    pub max_paths_per_l1: usize,
    /// Overall path budget across all groups.
    pub max_total_paths: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.4,
            semantic_weight: 0.6,
            min_score: 0.05,
            keyword_rescue_threshold: 0.3,
            top_k: 60,
            max_l1_categories: 6,
            max_paths_per_l1: 10,
            max_total_paths: 60,
        }
    }
}

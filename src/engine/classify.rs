//! Batched LLM classification with validation, correction and fallback.
//!
//! Uncached rows go to the model one invoice at a time: a single-row prompt
//! for one row, an invoice-batch prompt for several, split into consecutive
//! batches when an invoice exceeds the batch cap. Every path the model
//! returns is validated against the taxonomy and corrected when it is a
//! near miss or a bare top-level category.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::{EngineConfig, UNKNOWN_CATEGORY};
use crate::engine::fallback::{fallback_path, log_fallback};
use crate::engine::llm::{LlmClient, LlmError};
use crate::engine::parser::parse_batch_response;
use crate::engine::prompt;
use crate::engine::retrieval::L1Group;
use crate::engine::taxonomy::similar_paths;
use crate::models::{
    Classification, Confidence, Invoice, SupplierProfile, Taxonomy, TransactionRow,
};

/// Error code for rows abandoned by run cancellation.
pub const CANCELLED_ERROR: &str = "RUN_CANCELLED";

#[derive(Debug)]
pub struct RowOutcome {
    pub row_index: usize,
    pub classification: Classification,
    /// Empty on success.
    pub error: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Correction {
    Exact,
    ExpandedL1,
    SimilarPath,
    BestCandidate,
    Unknown,
}

pub struct BatchClassifier<'a> {
    pub llm: &'a dyn LlmClient,
    pub config: &'a EngineConfig,
}

impl BatchClassifier<'_> {
    /// Classify the uncached rows of one invoice.
    ///
    /// `seed_paths` are the paths already resolved for this invoice by
    /// rules or cache; they anchor the majority-vote fallback.
    pub fn classify(
        &self,
        invoice_key: &str,
        rows: &[&TransactionRow],
        profile: &SupplierProfile,
        taxonomy: &Taxonomy,
        groups: &[L1Group],
        seed_paths: &[String],
        cancel: &AtomicBool,
    ) -> Vec<RowOutcome> {
        let mut resolved: Vec<String> = seed_paths.to_vec();
        let candidates = flatten_candidates(groups);
        let supplier_info = prompt::format_supplier_info(profile);
        let taxonomy_sample = prompt::format_taxonomy_sample(groups, taxonomy);
        let system = prompt::system_prompt(taxonomy);

        let mut outcomes = Vec::with_capacity(rows.len());
        for (batch_index, batch) in rows.chunks(self.config.max_rows_per_batch).enumerate() {
            if cancel.load(Ordering::SeqCst) {
                for row in batch {
                    outcomes.push(RowOutcome {
                        row_index: row.row_index,
                        classification: Classification::unknown(),
                        error: CANCELLED_ERROR.to_string(),
                    });
                }
                continue;
            }

            let body = if batch.len() == 1 {
                prompt::single_prompt(
                    &supplier_info,
                    &prompt::format_transaction_info(batch[0]),
                    &taxonomy_sample,
                )
            } else {
                let batch_invoice = Invoice {
                    key: invoice_key.to_string(),
                    rows: batch.iter().map(|r| (*r).clone()).collect(),
                };
                prompt::batch_prompt(
                    &supplier_info,
                    &prompt::format_invoice_info(&batch_invoice, self.config),
                    &taxonomy_sample,
                    batch.len(),
                )
            };

            let fallback = fallback_path(&resolved);
            match self.call_with_retry(&system, &body) {
                Ok(response) => {
                    let report = parse_batch_response(&response, batch.len(), &fallback);
                    if let Some(issue) = &report.issue {
                        log_fallback(
                            invoice_key,
                            batch_index,
                            batch.len(),
                            &format!("{:?}", issue.kind),
                            &issue.raw_prefix,
                            &fallback,
                        );
                    }
                    for (row, raw_path) in batch.iter().zip(&report.paths) {
                        outcomes.push(self.resolve_row(
                            row,
                            raw_path,
                            taxonomy,
                            &candidates,
                            &mut resolved,
                        ));
                    }
                }
                Err(e) => {
                    log_fallback(
                        invoice_key,
                        batch_index,
                        batch.len(),
                        "LlmCallFailed",
                        &e.to_string(),
                        &fallback,
                    );
                    for row in batch {
                        let mut classification =
                            Classification::from_path(&fallback, Confidence::Low);
                        classification.reasoning =
                            "Fallback after repeated LLM call failures".to_string();
                        outcomes.push(RowOutcome {
                            row_index: row.row_index,
                            classification,
                            error: format!("LLM_CALL_FAILED: {e}"),
                        });
                    }
                }
            }
        }
        outcomes
    }

    fn resolve_row(
        &self,
        row: &TransactionRow,
        raw_path: &str,
        taxonomy: &Taxonomy,
        candidates: &[String],
        resolved: &mut Vec<String>,
    ) -> RowOutcome {
        let (path, correction) = validate_and_correct(taxonomy, raw_path, candidates);
        let (confidence, reasoning) = match &correction {
            Correction::Exact => (Confidence::High, String::new()),
            Correction::ExpandedL1 => (
                Confidence::Medium,
                format!("Expanded top-level answer '{raw_path}' to a specific path"),
            ),
            Correction::SimilarPath => (
                Confidence::Medium,
                format!("Corrected invalid path '{raw_path}' to the closest taxonomy path"),
            ),
            Correction::BestCandidate => (
                Confidence::Medium,
                format!("Replaced invalid path '{raw_path}' with the best retrieved candidate"),
            ),
            Correction::Unknown => (
                Confidence::Low,
                format!("No valid taxonomy path recoverable from '{raw_path}'"),
            ),
        };
        if path != UNKNOWN_CATEGORY {
            resolved.push(path.clone());
        }
        let mut classification = Classification::from_path(&path, confidence);
        classification.reasoning = reasoning;
        RowOutcome {
            row_index: row.row_index,
            classification,
            error: String::new(),
        }
    }

    fn call_with_retry(&self, system: &str, body: &str) -> Result<String, LlmError> {
        let attempts = self.config.max_retries.max(1);
        let mut backoff_ms = self.config.initial_backoff_ms;
        let mut last_error = LlmError::MalformedResponse("no attempts made".to_string());

        for attempt in 1..=attempts {
            match self.llm.complete(system, body) {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "LLM call failed");
                    last_error = e;
                    if attempt < attempts {
                        std::thread::sleep(Duration::from_millis(backoff_ms));
                        backoff_ms = backoff_ms.saturating_mul(2);
                    }
                }
            }
        }
        Err(last_error)
    }
}

fn flatten_candidates(groups: &[L1Group]) -> Vec<String> {
    let mut all: Vec<(f32, String)> = groups
        .iter()
        .flat_map(|g| g.paths.iter().map(|p| (p.score, p.path.clone())))
        .collect();
    all.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    all.into_iter().map(|(_, p)| p).collect()
}

/// Map a raw model answer to a valid taxonomy path.
fn validate_and_correct(
    taxonomy: &Taxonomy,
    raw: &str,
    candidates: &[String],
) -> (String, Correction) {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN_CATEGORY) {
        return (UNKNOWN_CATEGORY.to_string(), Correction::Unknown);
    }

    if let Some(canonical) = taxonomy.canonical(trimmed) {
        if !canonical.contains('|') {
            if let Some(expanded) = expand_l1(taxonomy, canonical, candidates) {
                return (expanded, Correction::ExpandedL1);
            }
        }
        return (canonical.to_string(), Correction::Exact);
    }

    // A bare L1 the model invented can still be expandable.
    if !trimmed.contains('|') {
        if let Some(expanded) = expand_l1(taxonomy, trimmed, candidates) {
            return (expanded, Correction::ExpandedL1);
        }
    }

    if let Some(similar) = similar_paths(taxonomy, trimmed, 1).first() {
        return (similar.to_string(), Correction::SimilarPath);
    }
    if let Some(best) = candidates.first() {
        return (best.clone(), Correction::BestCandidate);
    }
    (UNKNOWN_CATEGORY.to_string(), Correction::Unknown)
}

/// Best deeper path under a top-level category: prefer the strongest
/// pre-searched candidate, then the taxonomy's first deeper path.
fn expand_l1(taxonomy: &Taxonomy, l1: &str, candidates: &[String]) -> Option<String> {
    let wanted = l1.trim().to_lowercase();
    if let Some(candidate) = candidates
        .iter()
        .find(|c| Taxonomy::l1_of(c).to_lowercase() == wanted && c.contains('|'))
    {
        return Some(candidate.clone());
    }
    taxonomy
        .paths_under_l1(l1)
        .first()
        .map(|p| p.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::llm::MockLlmClient;
    use crate::engine::retrieval::RetrievalResult;
    use crate::engine::taxonomy::parse_taxonomy;

    fn taxonomy() -> Taxonomy {
        parse_taxonomy(
            "taxonomy:\n  \
             - IT\n  \
             - IT|Cloud|IaaS\n  \
             - IT|Cloud|PaaS\n  \
             - Facilities|Cleaning Services\n",
        )
        .unwrap()
    }

    fn groups() -> Vec<L1Group> {
        vec![L1Group {
            l1: "IT".into(),
            score: 0.9,
            paths: vec![
                RetrievalResult {
                    path: "IT|Cloud|IaaS".into(),
                    score: 0.9,
                    keyword_score: 0.0,
                    semantic_score: 0.0,
                },
                RetrievalResult {
                    path: "IT|Cloud|PaaS".into(),
                    score: 0.5,
                    keyword_score: 0.0,
                    semantic_score: 0.0,
                },
            ],
        }]
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            initial_backoff_ms: 0,
            ..Default::default()
        }
    }

    fn row(index: usize, desc: &str) -> TransactionRow {
        TransactionRow::new(
            index,
            [
                ("supplier_name".to_string(), "AWS".to_string()),
                ("line_description".to_string(), desc.to_string()),
            ]
            .into(),
        )
    }

    fn classify(
        llm: &MockLlmClient,
        config: &EngineConfig,
        rows: &[&TransactionRow],
        seeds: &[String],
    ) -> Vec<RowOutcome> {
        let classifier = BatchClassifier { llm, config };
        classifier.classify(
            "inv-1",
            rows,
            &SupplierProfile::unresearched("AWS"),
            &taxonomy(),
            &groups(),
            seeds,
            &AtomicBool::new(false),
        )
    }

    #[test]
    fn single_row_valid_answer_is_high_confidence() {
        let llm = MockLlmClient::new(vec!["it|cloud|iaas"]);
        let config = test_config();
        let r = row(0, "EC2 usage");
        let outcomes = classify(&llm, &config, &[&r], &[]);

        assert_eq!(llm.calls(), 1);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].classification.path(), "IT|Cloud|IaaS");
        assert_eq!(outcomes[0].classification.confidence, Confidence::High);
        assert!(outcomes[0].error.is_empty());
        assert!(llm.recorded_prompts()[0].contains("exactly one taxonomy path"));
    }

    #[test]
    fn single_path_answer_covers_whole_batch() {
        let llm = MockLlmClient::new(vec!["IT|Cloud|IaaS"]);
        let config = test_config();
        let rows = [row(0, "EC2"), row(1, "S3"), row(2, "EBS")];
        let refs: Vec<&TransactionRow> = rows.iter().collect();
        let outcomes = classify(&llm, &config, &refs, &[]);

        assert_eq!(llm.calls(), 1);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|o| o.classification.path() == "IT|Cloud|IaaS"));
    }

    #[test]
    fn array_answer_maps_per_row() {
        let llm =
            MockLlmClient::new(vec![r#"["IT|Cloud|IaaS", "IT|Cloud|PaaS", "IT|Cloud|IaaS"]"#]);
        let config = test_config();
        let rows = [row(0, "EC2"), row(1, "Lambda"), row(2, "S3")];
        let refs: Vec<&TransactionRow> = rows.iter().collect();
        let outcomes = classify(&llm, &config, &refs, &[]);

        assert_eq!(outcomes[1].classification.path(), "IT|Cloud|PaaS");
        assert_eq!(outcomes[2].classification.path(), "IT|Cloud|IaaS");
    }

    #[test]
    fn bare_l1_expands_to_best_candidate() {
        let llm = MockLlmClient::new(vec!["IT"]);
        let config = test_config();
        let r = row(0, "EC2");
        let outcomes = classify(&llm, &config, &[&r], &[]);

        assert_eq!(outcomes[0].classification.path(), "IT|Cloud|IaaS");
        assert_eq!(outcomes[0].classification.confidence, Confidence::Medium);
        assert!(outcomes[0].classification.reasoning.contains("Expanded"));
    }

    #[test]
    fn near_miss_path_is_corrected() {
        let llm = MockLlmClient::new(vec!["Facilities|Cleaning"]);
        let config = test_config();
        let r = row(0, "Office cleaning");
        let outcomes = classify(&llm, &config, &[&r], &[]);

        assert_eq!(
            outcomes[0].classification.path(),
            "Facilities|Cleaning Services"
        );
        assert_eq!(outcomes[0].classification.confidence, Confidence::Medium);
    }

    #[test]
    fn exhausted_retries_fall_back_to_seeded_majority() {
        let llm = MockLlmClient::with_script(vec![
            Err("down".into()),
            Err("down".into()),
            Err("down".into()),
        ]);
        let config = test_config();
        let r = row(0, "EC2");
        let seeds = vec!["IT|Cloud|IaaS".to_string(), "IT|Cloud|IaaS".to_string()];
        let outcomes = classify(&llm, &config, &[&r], &seeds);

        assert_eq!(llm.calls(), 3);
        assert_eq!(outcomes[0].classification.path(), "IT|Cloud|IaaS");
        assert!(outcomes[0].error.starts_with("LLM_CALL_FAILED"));
    }

    #[test]
    fn earlier_batch_majority_anchors_a_later_failed_batch() {
        let llm = MockLlmClient::with_script(vec![
            Ok("IT|Cloud|IaaS".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
            Err("down".to_string()),
        ]);
        let config = EngineConfig {
            max_rows_per_batch: 2,
            initial_backoff_ms: 0,
            ..Default::default()
        };
        let rows: Vec<TransactionRow> = (0..3).map(|i| row(i, "EC2")).collect();
        let refs: Vec<&TransactionRow> = rows.iter().collect();
        let outcomes = classify(&llm, &config, &refs, &[]);

        // First sub-batch succeeds; its majority carries the failed one.
        assert_eq!(llm.calls(), 4);
        assert_eq!(outcomes[0].classification.path(), "IT|Cloud|IaaS");
        assert_eq!(outcomes[2].classification.path(), "IT|Cloud|IaaS");
        assert!(outcomes[2].error.starts_with("LLM_CALL_FAILED"));
    }

    #[test]
    fn no_seeds_and_garbage_means_unknown() {
        let llm = MockLlmClient::new(vec!["complete nonsense zz"]);
        let config = EngineConfig {
            initial_backoff_ms: 0,
            ..Default::default()
        };
        let classifier = BatchClassifier {
            llm: &llm,
            config: &config,
        };
        let r = row(0, "mystery");
        // Empty candidate groups: no retrieval evidence at all.
        let outcomes = classifier.classify(
            "inv-1",
            &[&r],
            &SupplierProfile::unresearched("AWS"),
            &taxonomy(),
            &[],
            &[],
            &AtomicBool::new(false),
        );
        assert_eq!(outcomes[0].classification.path(), "Unknown");
        assert_eq!(outcomes[0].classification.confidence, Confidence::Low);
    }

    #[test]
    fn cancellation_skips_dispatch_entirely() {
        let llm = MockLlmClient::new(vec!["IT|Cloud|IaaS"]);
        let config = test_config();
        let classifier = BatchClassifier {
            llm: &llm,
            config: &config,
        };
        let r = row(0, "EC2");
        let outcomes = classifier.classify(
            "inv-1",
            &[&r],
            &SupplierProfile::unresearched("AWS"),
            &taxonomy(),
            &groups(),
            &[],
            &AtomicBool::new(true),
        );
        assert_eq!(llm.calls(), 0);
        assert_eq!(outcomes[0].error, CANCELLED_ERROR);
    }

    #[test]
    fn oversized_invoice_splits_into_consecutive_batches() {
        let llm = MockLlmClient::new(vec!["IT|Cloud|IaaS", "IT|Cloud|PaaS"]);
        let config = EngineConfig {
            max_rows_per_batch: 2,
            initial_backoff_ms: 0,
            ..Default::default()
        };
        let rows: Vec<TransactionRow> = (0..3).map(|i| row(i, "EC2")).collect();
        let refs: Vec<&TransactionRow> = rows.iter().collect();
        let outcomes = classify(&llm, &config, &refs, &[]);

        assert_eq!(llm.calls(), 2);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].classification.path(), "IT|Cloud|IaaS");
        assert_eq!(outcomes[2].classification.path(), "IT|Cloud|PaaS");
    }
}

//! Run orchestration.
//!
//! `ClassificationEngine` owns the collaborators (LLM client, optional
//! embedder, researcher, rule store, cache) and drives the per-invoice
//! pipeline: rules, cache, research, retrieval, classification, fallback.
//! Invoices are processed on a bounded scoped-thread pool pulling from a
//! shared work index; rows within an invoice stay sequential.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use uuid::Uuid;

use crate::config::{EngineConfig, UNKNOWN_CATEGORY};
use crate::engine::assemble;
use crate::engine::cache::{CacheManager, TaxonomyBundle};
use crate::engine::classify::{BatchClassifier, CANCELLED_ERROR};
use crate::engine::grouping::group_rows;
use crate::engine::llm::LlmClient;
use crate::engine::research::{NoResearch, SupplierResearcher};
use crate::engine::retrieval::{self, Embedder, L1Group};
use crate::engine::rules::RuleStore;
use crate::engine::ClassifyError;
use crate::models::{Classification, Confidence, Invoice, OutputRow, Rule, TransactionRow};

/// Error code for invoices whose rows all lack a supplier name.
pub const MISSING_SUPPLIER_ERROR: &str = "MISSING_SUPPLIER_NAME";

/// Cooperative cancellation for one run. In-flight LLM batches complete;
/// nothing new is dispatched afterwards.
#[derive(Debug, Clone, Default)]
pub struct RunHandle {
    cancelled: Arc<AtomicBool>,
}

impl RunHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub taxonomy_path: PathBuf,
    /// Dataset name for dataset-scoped rules and cache tagging.
    pub dataset_name: Option<String>,
    pub handle: Option<RunHandle>,
}

impl RunOptions {
    pub fn new(taxonomy_path: impl Into<PathBuf>) -> Self {
        Self {
            taxonomy_path: taxonomy_path.into(),
            dataset_name: None,
            handle: None,
        }
    }

    pub fn with_dataset(mut self, dataset_name: &str) -> Self {
        self.dataset_name = Some(dataset_name.to_string());
        self
    }

    pub fn with_handle(mut self, handle: RunHandle) -> Self {
        self.handle = Some(handle);
        self
    }
}

pub struct ClassificationEngine {
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    embedder: Option<Arc<dyn Embedder>>,
    researcher: Arc<dyn SupplierResearcher>,
    rules: RuleStore,
    cache: CacheManager,
}

impl ClassificationEngine {
    pub fn new(config: EngineConfig, llm: Arc<dyn LlmClient>) -> Self {
        let max_age = config.supplier_cache_max_age_days;
        Self {
            config,
            llm,
            embedder: None,
            researcher: Arc::new(NoResearch),
            rules: RuleStore::new(None),
            cache: CacheManager::new(None, max_age),
        }
    }

    /// Attach the SQLite store backing the classification cache and rules.
    pub fn with_database(self, conn: Connection) -> Self {
        self.with_shared_database(Arc::new(Mutex::new(conn)))
    }

    pub fn with_shared_database(mut self, conn: Arc<Mutex<Connection>>) -> Self {
        self.rules = RuleStore::new(Some(Arc::clone(&conn)));
        self.cache = CacheManager::new(Some(conn), self.config.supplier_cache_max_age_days);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_researcher(mut self, researcher: Arc<dyn SupplierResearcher>) -> Self {
        self.researcher = researcher;
        self
    }

    /// Rule management surface (activation with supersession).
    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// Classify a dataset. Output is positionally one-to-one with input:
    /// same length, same order, every row carrying either a classification
    /// or an explicit error (never both absent).
    pub fn classify_rows(
        &self,
        rows: Vec<TransactionRow>,
        opts: &RunOptions,
    ) -> Result<Vec<OutputRow>, ClassifyError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let row_indexes: Vec<usize> = rows.iter().map(|r| r.row_index).collect();
        let mut slot_of: HashMap<usize, usize> = HashMap::with_capacity(rows.len());
        for (position, &index) in row_indexes.iter().enumerate() {
            if slot_of.insert(index, position).is_some() {
                return Err(ClassifyError::Input(format!(
                    "duplicate row_index {index} in input"
                )));
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let cancel = opts
            .handle
            .as_ref()
            .map(RunHandle::flag)
            .unwrap_or_default();
        let bundle = self
            .cache
            .taxonomy_bundle(&opts.taxonomy_path, self.embedder.as_deref())?;

        let total = rows.len();
        let invoices = group_rows(rows, &self.config.grouping_columns);
        tracing::info!(
            run_id,
            rows = total,
            invoices = invoices.len(),
            dataset = opts.dataset_name.as_deref().unwrap_or(""),
            "classification run started"
        );

        let slots: Mutex<Vec<Option<OutputRow>>> = Mutex::new(vec![None; total]);
        let next = AtomicUsize::new(0);
        let workers = self.config.max_workers.max(1).min(invoices.len());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    if i >= invoices.len() {
                        break;
                    }
                    let outputs = self.process_invoice(
                        &invoices[i],
                        &bundle,
                        opts.dataset_name.as_deref(),
                        &run_id,
                        &cancel,
                    );
                    let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
                    for out in outputs {
                        if let Some(&slot) = slot_of.get(&out.row_index) {
                            slots[slot] = Some(out);
                        }
                    }
                });
            }
        });

        let finished = assemble::finalize(slots.into_inner().unwrap_or_else(|e| e.into_inner()), &row_indexes);
        let errors = finished.iter().filter(|r| !r.error.is_empty()).count();
        tracing::info!(run_id, rows = finished.len(), errors, "classification run finished");
        Ok(finished)
    }

    /// The per-invoice pipeline. Never fails: every problem becomes a
    /// per-row error so one bad invoice cannot sink the run.
    fn process_invoice(
        &self,
        invoice: &Invoice,
        bundle: &TaxonomyBundle,
        dataset_name: Option<&str>,
        run_id: &str,
        cancel: &AtomicBool,
    ) -> Vec<OutputRow> {
        if cancel.load(Ordering::SeqCst) {
            return invoice
                .rows
                .iter()
                .map(|r| OutputRow::failed(r.row_index, CANCELLED_ERROR))
                .collect();
        }

        let Some(supplier) = invoice.supplier_name().map(str::to_string) else {
            tracing::warn!(invoice_key = %invoice.key, "invoice has no supplier name");
            return invoice
                .rows
                .iter()
                .map(|r| OutputRow::failed(r.row_index, MISSING_SUPPLIER_ERROR))
                .collect();
        };

        let rules = self.rules.rules_for(&supplier, dataset_name);

        // Direct mapping pins the whole invoice: no cache read, no LLM.
        if let Some(rule) = &rules.direct_mapping {
            if let Rule::DirectMapping { path, .. } = rule {
                let mut classification = Classification::from_path(path, Confidence::High);
                classification.override_rule_applied = rule.id_tag();
                classification.reasoning = "Supplier direct mapping".to_string();
                let pairs: Vec<(&TransactionRow, &Classification)> = invoice
                    .rows
                    .iter()
                    .map(|r| (r, &classification))
                    .collect();
                self.cache
                    .store_batch(&supplier, &pairs, None, run_id, dataset_name);
                return invoice
                    .rows
                    .iter()
                    .map(|r| OutputRow::ok(r.row_index, classification.clone()))
                    .collect();
            }
        }

        let mut outputs: Vec<OutputRow> = Vec::with_capacity(invoice.len());
        let mut seed_paths: Vec<String> = Vec::new();

        // Row-level transaction rules resolve individual rows up front.
        let mut remaining: Vec<&TransactionRow> = Vec::new();
        for row in &invoice.rows {
            match rules.match_row(row) {
                Some(rule @ Rule::TransactionRule { path, .. }) => {
                    let mut classification = Classification::from_path(path, Confidence::High);
                    classification.override_rule_applied = rule.id_tag();
                    classification.reasoning = "Transaction rule match".to_string();
                    seed_paths.push(classification.path());
                    outputs.push(OutputRow::ok(row.row_index, classification));
                }
                _ => remaining.push(row),
            }
        }

        // Tier-1 cache.
        let cache_hits = self.cache.lookup_batch(&supplier, &remaining);
        let mut uncached: Vec<&TransactionRow> = Vec::new();
        for row in remaining {
            match cache_hits.get(&row.row_index) {
                Some(classification) => {
                    seed_paths.push(classification.path());
                    outputs.push(OutputRow::ok(row.row_index, classification.clone()));
                }
                None => uncached.push(row),
            }
        }
        if uncached.is_empty() {
            return outputs;
        }

        let profile = self
            .cache
            .supplier_profile(&supplier, self.researcher.as_ref());

        let groups: Vec<L1Group> = match &rules.taxonomy_constraint {
            Some(Rule::TaxonomyConstraint { allowed_paths, .. }) => {
                retrieval::constraint_groups(allowed_paths)
            }
            _ => {
                let queries = retrieval::build_queries(invoice, &profile, &self.config);
                let results = match bundle.index.retrieve(
                    &queries,
                    self.embedder.as_deref(),
                    &self.config.retrieval,
                ) {
                    Ok(results) => results,
                    Err(e) => {
                        tracing::warn!(invoice_key = %invoice.key, error = %e,
                            "semantic retrieval failed, falling back to keyword search");
                        bundle
                            .index
                            .retrieve(&queries, None, &self.config.retrieval)
                            .unwrap_or_default()
                    }
                };
                retrieval::group_by_l1(&results, &self.config.retrieval)
            }
        };

        let classifier = BatchClassifier {
            llm: self.llm.as_ref(),
            config: &self.config,
        };
        let outcomes = classifier.classify(
            &invoice.key,
            &uncached,
            &profile,
            &bundle.taxonomy,
            &groups,
            &seed_paths,
            cancel,
        );

        // Write back fresh, real classifications for future runs. Unknown
        // and errored rows stay out of the cache.
        let row_by_index: HashMap<usize, &TransactionRow> =
            uncached.iter().map(|r| (r.row_index, *r)).collect();
        let fresh: Vec<(&TransactionRow, &Classification)> = outcomes
            .iter()
            .filter(|o| o.error.is_empty() && o.classification.path() != UNKNOWN_CATEGORY)
            .filter_map(|o| {
                row_by_index
                    .get(&o.row_index)
                    .map(|row| (*row, &o.classification))
            })
            .collect();
        self.cache
            .store_batch(&supplier, &fresh, Some(&profile), run_id, dataset_name);

        for outcome in outcomes {
            outputs.push(OutputRow {
                row_index: outcome.row_index,
                classification: outcome.classification,
                error: outcome.error,
            });
        }
        outputs
    }
}

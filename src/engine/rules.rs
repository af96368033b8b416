//! Supplier override rules.
//!
//! Lookup precedence, highest first: dataset DirectMapping, global
//! DirectMapping, dataset TransactionRule, global TransactionRule, dataset
//! TaxonomyConstraint, global TaxonomyConstraint. Within a variant and
//! scope, ties resolve by priority then recency (handled in SQL).
//!
//! Lookups memoize per (dataset, supplier) for the life of the store,
//! including negative results, so an invoice-heavy run touches SQLite once
//! per supplier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::db;
use crate::engine::ClassifyError;
use crate::models::{Rule, TransactionRow};

const MAX_MEMO_ENTRIES: usize = 4096;

/// Everything the pipeline needs to know about one supplier's rules.
#[derive(Debug, Default)]
pub struct SupplierRules {
    pub direct_mapping: Option<Rule>,
    pub taxonomy_constraint: Option<Rule>,
    /// Dataset-scoped rules first, then global, each strongest first.
    pub transaction_rules: Vec<Rule>,
}

impl SupplierRules {
    pub fn is_empty(&self) -> bool {
        self.direct_mapping.is_none()
            && self.taxonomy_constraint.is_none()
            && self.transaction_rules.is_empty()
    }

    /// First transaction rule whose condition matches the row. Field values
    /// compare trimmed and case-insensitively.
    pub fn match_row(&self, row: &TransactionRow) -> Option<&Rule> {
        self.transaction_rules.iter().find(|rule| match rule {
            Rule::TransactionRule { field, value, .. } => row
                .get(field)
                .is_some_and(|v| v.eq_ignore_ascii_case(value.trim())),
            Rule::DirectMapping { .. } | Rule::TaxonomyConstraint { .. } => false,
        })
    }
}

pub struct RuleStore {
    conn: Option<Arc<Mutex<Connection>>>,
    memo: Mutex<HashMap<String, Arc<SupplierRules>>>,
}

impl RuleStore {
    pub fn new(conn: Option<Arc<Mutex<Connection>>>) -> Self {
        Self {
            conn,
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn memo_key(supplier: &str, dataset_name: Option<&str>) -> String {
        format!(
            "{}\u{1}{}",
            dataset_name.unwrap_or(""),
            db::normalize_supplier(supplier)
        )
    }

    /// Resolved rules for the supplier. Database failures degrade to an
    /// empty rule set with a warning; classification must not stall on a
    /// rules outage.
    pub fn rules_for(&self, supplier: &str, dataset_name: Option<&str>) -> Arc<SupplierRules> {
        let key = Self::memo_key(supplier, dataset_name);
        {
            let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(rules) = memo.get(&key) {
                return Arc::clone(rules);
            }
        }

        let Some(conn) = &self.conn else {
            return Arc::new(SupplierRules::default());
        };

        let loaded = {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            self.load(&conn, supplier, dataset_name)
        };
        let rules = match loaded {
            Ok(rules) => Arc::new(rules),
            Err(e) => {
                tracing::warn!(supplier, error = %e, "rule lookup failed, proceeding without rules");
                return Arc::new(SupplierRules::default());
            }
        };

        let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        if memo.len() >= MAX_MEMO_ENTRIES {
            memo.clear();
        }
        memo.insert(key, Arc::clone(&rules));
        rules
    }

    fn load(
        &self,
        conn: &Connection,
        supplier: &str,
        dataset_name: Option<&str>,
    ) -> Result<SupplierRules, ClassifyError> {
        let mut direct_mapping = None;
        let mut taxonomy_constraint = None;
        let mut transaction_rules = Vec::new();

        if let Some(dataset) = dataset_name {
            direct_mapping = db::get_direct_mapping(conn, supplier, Some(dataset))?;
            taxonomy_constraint = db::get_taxonomy_constraint(conn, supplier, Some(dataset))?;
            transaction_rules = db::get_transaction_rules(conn, supplier, Some(dataset))?;
        }
        if direct_mapping.is_none() {
            direct_mapping = db::get_direct_mapping(conn, supplier, None)?;
        }
        if taxonomy_constraint.is_none() {
            taxonomy_constraint = db::get_taxonomy_constraint(conn, supplier, None)?;
        }
        transaction_rules.extend(db::get_transaction_rules(conn, supplier, None)?);

        Ok(SupplierRules {
            direct_mapping,
            taxonomy_constraint,
            transaction_rules,
        })
    }

    fn require_conn(&self) -> Result<&Arc<Mutex<Connection>>, ClassifyError> {
        self.conn
            .as_ref()
            .ok_or_else(|| ClassifyError::Input("rule store has no database attached".to_string()))
    }

    fn invalidate(&self) {
        self.memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Activate a direct mapping, superseding the prior active one for the
    /// same supplier and scope.
    pub fn add_direct_mapping(
        &self,
        supplier: &str,
        path: &str,
        dataset_name: Option<&str>,
        priority: i64,
    ) -> Result<i64, ClassifyError> {
        let conn = self.require_conn()?;
        let id = {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            db::insert_direct_mapping(&conn, supplier, path, dataset_name, priority)?
        };
        self.invalidate();
        Ok(id)
    }

    pub fn add_taxonomy_constraint(
        &self,
        supplier: &str,
        allowed_paths: &[String],
        dataset_name: Option<&str>,
        priority: i64,
    ) -> Result<i64, ClassifyError> {
        let conn = self.require_conn()?;
        let id = {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            db::insert_taxonomy_constraint(&conn, supplier, allowed_paths, dataset_name, priority)?
        };
        self.invalidate();
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_transaction_rule(
        &self,
        name: &str,
        supplier: &str,
        field: &str,
        value: &str,
        path: &str,
        dataset_name: Option<&str>,
        priority: i64,
    ) -> Result<i64, ClassifyError> {
        let conn = self.require_conn()?;
        let id = {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            db::insert_transaction_rule(
                &conn, name, supplier, field, value, path, dataset_name, priority,
            )?
        };
        self.invalidate();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn store() -> RuleStore {
        let conn = open_memory_database().unwrap();
        RuleStore::new(Some(Arc::new(Mutex::new(conn))))
    }

    fn row(pairs: &[(&str, &str)]) -> TransactionRow {
        TransactionRow::new(
            0,
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn dataset_mapping_outranks_global() {
        let store = store();
        store.add_direct_mapping("aws", "global|path", None, 0).unwrap();
        store
            .add_direct_mapping("aws", "dataset|path", Some("q3"), 0)
            .unwrap();

        let rules = store.rules_for("AWS", Some("q3"));
        match rules.direct_mapping.as_ref().unwrap() {
            Rule::DirectMapping { path, .. } => assert_eq!(path, "dataset|path"),
            other => panic!("unexpected: {other:?}"),
        }

        let rules = store.rules_for("AWS", Some("other"));
        match rules.direct_mapping.as_ref().unwrap() {
            Rule::DirectMapping { path, .. } => assert_eq!(path, "global|path"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn transaction_rule_matches_case_insensitively() {
        let store = store();
        store
            .add_transaction_rule("vat", "aws", "gl_code", "6100", "tax|vat", None, 0)
            .unwrap();

        let rules = store.rules_for("aws", None);
        assert!(rules.match_row(&row(&[("gl_code", " 6100 ")])).is_some());
        assert!(rules.match_row(&row(&[("gl_code", "6200")])).is_none());
        assert!(rules.match_row(&row(&[])).is_none());
    }

    #[test]
    fn dataset_rules_are_checked_before_global() {
        let store = store();
        store
            .add_transaction_rule("global", "aws", "gl_code", "6100", "g|p", None, 99)
            .unwrap();
        store
            .add_transaction_rule("dataset", "aws", "gl_code", "6100", "d|p", Some("q3"), 0)
            .unwrap();

        let rules = store.rules_for("aws", Some("q3"));
        match rules.match_row(&row(&[("gl_code", "6100")])).unwrap() {
            Rule::TransactionRule { path, .. } => assert_eq!(path, "d|p"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn negative_memo_is_invalidated_by_rule_activation() {
        let store = store();
        assert!(store.rules_for("aws", None).is_empty());

        store.add_direct_mapping("aws", "it|cloud", None, 0).unwrap();
        assert!(store.rules_for("aws", None).direct_mapping.is_some());
    }

    #[test]
    fn no_database_means_no_rules() {
        let store = RuleStore::new(None);
        assert!(store.rules_for("aws", None).is_empty());
        assert!(store.add_direct_mapping("aws", "a|b", None, 0).is_err());
    }
}

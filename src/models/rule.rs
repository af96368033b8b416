use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a rule applies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RuleScope {
    /// Applies only when classifying the named dataset.
    Dataset(String),
    /// Applies to every dataset.
    Global,
}

impl RuleScope {
    /// Dataset name as stored in SQLite; `NULL` column means global.
    pub fn dataset_name(&self) -> Option<&str> {
        match self {
            RuleScope::Dataset(name) => Some(name),
            RuleScope::Global => None,
        }
    }
}

/// A human-curated supplier override.
///
/// Variants are closed on purpose: the lookup precedence in
/// `engine::rules` is an exhaustive `match`, so adding a variant forces
/// every resolution site to say where it ranks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Rule {
    /// Pin every row of the supplier's invoices to one taxonomy path.
    /// Short-circuits the whole pipeline: no cache lookup, no LLM call.
    DirectMapping {
        id: i64,
        supplier_name: String,
        path: String,
        scope: RuleScope,
        priority: i64,
        created_at: DateTime<Utc>,
    },
    /// Restrict the candidate taxonomy to a curated path list; the LLM
    /// still chooses among them.
    TaxonomyConstraint {
        id: i64,
        supplier_name: String,
        allowed_paths: Vec<String>,
        scope: RuleScope,
        priority: i64,
        created_at: DateTime<Utc>,
    },
    /// Row-level override: when `field == value` on a row, that row gets
    /// `path` regardless of the rest of the invoice.
    TransactionRule {
        id: i64,
        name: String,
        supplier_name: String,
        field: String,
        value: String,
        path: String,
        scope: RuleScope,
        priority: i64,
        created_at: DateTime<Utc>,
    },
}

impl Rule {
    pub fn id(&self) -> i64 {
        match self {
            Rule::DirectMapping { id, .. }
            | Rule::TaxonomyConstraint { id, .. }
            | Rule::TransactionRule { id, .. } => *id,
        }
    }

    pub fn supplier_name(&self) -> &str {
        match self {
            Rule::DirectMapping { supplier_name, .. }
            | Rule::TaxonomyConstraint { supplier_name, .. }
            | Rule::TransactionRule { supplier_name, .. } => supplier_name,
        }
    }

    /// Provenance tag written to `override_rule_applied` on output rows.
    pub fn id_tag(&self) -> String {
        match self {
            Rule::DirectMapping { id, .. } => format!("direct_mapping_{id}"),
            Rule::TaxonomyConstraint { id, .. } => format!("taxonomy_constraint_{id}"),
            Rule::TransactionRule { id, .. } => format!("transaction_rule_{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_tag_encodes_variant_and_id() {
        let rule = Rule::DirectMapping {
            id: 42,
            supplier_name: "AWS".into(),
            path: "it|cloud|iaas".into(),
            scope: RuleScope::Global,
            priority: 0,
            created_at: Utc::now(),
        };
        assert_eq!(rule.id_tag(), "direct_mapping_42");
    }

    #[test]
    fn scope_maps_to_nullable_dataset_column() {
        assert_eq!(RuleScope::Global.dataset_name(), None);
        assert_eq!(
            RuleScope::Dataset("q3_spend".into()).dataset_name(),
            Some("q3_spend")
        );
    }
}

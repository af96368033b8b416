use serde::{Deserialize, Serialize};

use super::row::TransactionRow;

/// A group of transaction rows sharing one composite invoice key.
///
/// Rows keep their submission order; the key is the pipe-joined normalized
/// grouping columns (see `engine::grouping`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub key: String,
    pub rows: Vec<TransactionRow>,
}

impl Invoice {
    /// First non-missing supplier name across the invoice's rows.
    pub fn supplier_name(&self) -> Option<&str> {
        self.rows.iter().find_map(|r| r.supplier_name())
    }

    /// First non-missing value of `field` across the invoice's rows.
    pub fn first_value(&self, field: &str) -> Option<&str> {
        self.rows.iter().find_map(|r| r.get(field))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

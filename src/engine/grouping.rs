//! Deterministic invoice grouping.
//!
//! Rows partition by a composite key built from the configured grouping
//! columns, normalized to lowercase. A missing component contributes the
//! `<NULL>` sentinel so that absent and present-but-different values can
//! never collide. Invoice order is first-seen; row order within an invoice
//! is submission order.

use std::collections::HashMap;

use crate::config::NULL_SENTINEL;
use crate::models::{Invoice, TransactionRow};

/// Composite key for one row under the given grouping columns. Literal
/// separators inside values are escaped so distinct key tuples never
/// collide.
pub fn invoice_key(row: &TransactionRow, grouping_columns: &[String]) -> String {
    grouping_columns
        .iter()
        .map(|col| {
            row.get(col)
                .map(|v| v.to_lowercase().replace('\\', "\\\\").replace('|', "\\|"))
                .unwrap_or_else(|| NULL_SENTINEL.to_string())
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Partition rows into invoices. An empty grouping-column list degrades to
/// one singleton invoice per row (legacy per-row classification).
pub fn group_rows(rows: Vec<TransactionRow>, grouping_columns: &[String]) -> Vec<Invoice> {
    if grouping_columns.is_empty() {
        return rows
            .into_iter()
            .map(|row| Invoice {
                key: format!("row:{}", row.row_index),
                rows: vec![row],
            })
            .collect();
    }

    let mut invoices: Vec<Invoice> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let key = invoice_key(&row, grouping_columns);
        match index.get(&key) {
            Some(&i) => invoices[i].rows.push(row),
            None => {
                index.insert(key.clone(), invoices.len());
                invoices.push(Invoice {
                    key,
                    rows: vec![row],
                });
            }
        }
    }
    invoices
}

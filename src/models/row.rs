use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One transaction line as it arrived from the caller's dataset.
///
/// Fields are canonical snake_case column names (`supplier_name`,
/// `gl_description`, `line_description`, `amount`, ...). The engine never
/// mutates input rows; `row_index` pins each row to its position in the
/// submitted dataset so output order can be restored after parallel work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionRow {
    pub row_index: usize,
    pub fields: BTreeMap<String, String>,
}

impl TransactionRow {
    pub fn new(row_index: usize, fields: BTreeMap<String, String>) -> Self {
        Self { row_index, fields }
    }

    /// Field value, treating absent and whitespace-only values as missing.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|v| v.trim())
            .filter(|v| is_valid_value(v))
    }

    pub fn supplier_name(&self) -> Option<&str> {
        self.get("supplier_name")
    }
}

/// Placeholder strings that spreadsheets and upstream exports use for
/// "no value". These never participate in keys, hashes, or prompts.
pub fn is_valid_value(value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() {
        return false;
    }
    !matches!(
        v.to_lowercase().as_str(),
        "nan" | "none" | "null" | "n/a" | "na" | "-"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn blank_and_placeholder_values_are_missing() {
        let r = row(&[
            ("supplier_name", "  "),
            ("gl_description", "nan"),
            ("line_description", "AWS usage"),
        ]);
        assert_eq!(r.supplier_name(), None);
        assert_eq!(r.get("gl_description"), None);
        assert_eq!(r.get("line_description"), Some("AWS usage"));
        assert_eq!(r.get("department"), None);
    }

    #[test]
    fn get_trims_surrounding_whitespace() {
        let r = row(&[("company", "  Acme Corp  ")]);
        assert_eq!(r.get("company"), Some("Acme Corp"));
    }
}

//! Final result assembly.
//!
//! Invoices finish in arbitrary order on the worker pool; this module
//! restores submission order and enforces the one-row-in, one-row-out
//! contract: no row dropped, duplicated, or reordered. A row that somehow
//! has no result (a pipeline bug, never silent data loss) comes back as
//! `Unknown` with an explicit error.

use crate::models::OutputRow;

/// Error code for rows with no produced result.
pub const MISSING_RESULT_ERROR: &str = "MISSING_RESULT";

/// Collapse per-invoice result slots into the final output vector.
///
/// `slots` is indexed by submission position; `row_indexes` maps each
/// position back to the caller's `row_index`.
pub fn finalize(slots: Vec<Option<OutputRow>>, row_indexes: &[usize]) -> Vec<OutputRow> {
    slots
        .into_iter()
        .enumerate()
        .map(|(position, slot)| match slot {
            Some(row) => row,
            None => {
                tracing::error!(position, "row finished the run without a result");
                OutputRow::failed(row_indexes[position], MISSING_RESULT_ERROR)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, Confidence};

    #[test]
    fn preserves_submission_order() {
        let c = Classification::from_path("a|b", Confidence::High);
        let slots = vec![
            Some(OutputRow::ok(10, c.clone())),
            Some(OutputRow::ok(11, c.clone())),
            Some(OutputRow::ok(12, c)),
        ];
        let out = finalize(slots, &[10, 11, 12]);
        assert_eq!(
            out.iter().map(|r| r.row_index).collect::<Vec<_>>(),
            [10, 11, 12]
        );
    }

    #[test]
    fn gaps_surface_as_explicit_errors() {
        let c = Classification::from_path("a|b", Confidence::High);
        let slots = vec![Some(OutputRow::ok(0, c)), None];
        let out = finalize(slots, &[0, 1]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].row_index, 1);
        assert_eq!(out[1].error, MISSING_RESULT_ERROR);
        assert_eq!(out[1].classification.path(), "Unknown");
    }
}

//! Two-tier fallback for rows the LLM could not classify.
//!
//! Tier one reuses the invoice's own evidence: if the rows already resolved
//! (rules, cache, or earlier batches) agree on a majority path, unresolved
//! rows join it. Tier two is the reserved `Unknown` terminal category.

use crate::config::UNKNOWN_CATEGORY;

/// Majority path among already-resolved rows: a path seen more than once,
/// or the only distinct path. An even split between several paths is no
/// majority and falls through to `Unknown`.
pub fn fallback_path(resolved: &[String]) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for path in resolved {
        if path.is_empty() || path == UNKNOWN_CATEGORY {
            continue;
        }
        match counts.iter_mut().find(|(p, _)| *p == path.as_str()) {
            Some((_, n)) => *n += 1,
            None => counts.push((path, 1)),
        }
    }

    if counts.len() == 1 {
        return counts[0].0.to_string();
    }
    let best = counts.iter().map(|(_, n)| *n).max().unwrap_or(0);
    if best > 1 && counts.iter().filter(|(_, n)| *n == best).count() == 1 {
        if let Some((path, _)) = counts.iter().find(|(_, n)| *n == best) {
            return path.to_string();
        }
    }
    UNKNOWN_CATEGORY.to_string()
}

/// Every fallback assignment is logged with enough context to audit later.
pub fn log_fallback(
    invoice_key: &str,
    batch_index: usize,
    row_count: usize,
    failure: &str,
    raw_prefix: &str,
    chosen: &str,
) {
    tracing::warn!(
        invoice_key,
        batch_index,
        row_count,
        failure,
        raw_prefix,
        chosen,
        "fallback classification applied"
    );
}

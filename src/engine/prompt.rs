//! Prompt builders for single-row and invoice-batch classification.

use crate::config::EngineConfig;
use crate::engine::retrieval::L1Group;
use crate::models::{Invoice, SupplierProfile, Taxonomy, TransactionRow};

const MAX_DESC_CHARS: usize = 200;
const MAX_GL_CHARS: usize = 150;
const MAX_FIELD_CHARS: usize = 100;

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Supplier context as a compact JSON object, empty fields omitted.
pub fn format_supplier_info(profile: &SupplierProfile) -> String {
    let mut map = serde_json::Map::new();
    let mut put = |key: &str, value: &str| {
        if !value.trim().is_empty() {
            map.insert(
                key.to_string(),
                serde_json::Value::String(truncate(value.trim(), MAX_DESC_CHARS)),
            );
        }
    };
    put("name", &profile.supplier_name);
    put("industry", &profile.industry);
    put("description", &profile.description);
    put("products_services", &profile.products_services);
    put("website", &profile.website);
    serde_json::to_string_pretty(&serde_json::Value::Object(map)).unwrap_or_default()
}

/// Per-row field sections for a single-row prompt.
pub fn format_transaction_info(row: &TransactionRow) -> String {
    let mut out = String::new();

    let mut section = |title: &str, fields: &[(&str, &str, usize)]| {
        let lines: Vec<String> = fields
            .iter()
            .filter_map(|(label, field, max)| {
                row.get(field)
                    .map(|v| format!("- {label}: {}", truncate(v, *max)))
            })
            .collect();
        if !lines.is_empty() {
            out.push_str(title);
            out.push_str(":\n");
            out.push_str(&lines.join("\n"));
            out.push_str("\n\n");
        }
    };

    section(
        "TRANSACTION CONTEXT",
        &[
            ("Supplier", "supplier_name", MAX_FIELD_CHARS),
            ("Invoice date", "invoice_date", MAX_FIELD_CHARS),
            ("Company", "company", MAX_FIELD_CHARS),
        ],
    );
    section(
        "DESCRIPTIONS",
        &[
            ("Line description", "line_description", MAX_DESC_CHARS),
            ("GL description", "gl_description", MAX_GL_CHARS),
        ],
    );
    section(
        "REFERENCES",
        &[
            ("GL code", "gl_code", MAX_FIELD_CHARS),
            ("PO number", "po_number", MAX_FIELD_CHARS),
        ],
    );
    section(
        "ADDITIONAL",
        &[
            ("Department", "department", MAX_FIELD_CHARS),
            ("Cost center", "cost_center", MAX_FIELD_CHARS),
            ("Amount", "amount", MAX_FIELD_CHARS),
            ("Currency", "currency", MAX_FIELD_CHARS),
        ],
    );

    let missing: Vec<&str> = ["line_description", "gl_description", "department"]
        .into_iter()
        .filter(|f| row.get(f).is_none())
        .collect();
    if missing.is_empty() {
        out.push_str("DATA COMPLETENESS: all description fields present\n");
    } else {
        out.push_str(&format!(
            "DATA COMPLETENESS: missing {}\n",
            missing.join(", ")
        ));
    }
    out
}

/// Invoice-level context: shared header fields stated once, then numbered
/// line items.
pub fn format_invoice_info(invoice: &Invoice, _cfg: &EngineConfig) -> String {
    let mut out = String::from("INVOICE CONTEXT (shared across all lines):\n");
    for (label, field) in [
        ("Supplier", "supplier_name"),
        ("Invoice date", "invoice_date"),
        ("Company", "company"),
        ("PO number", "po_number"),
        ("Department", "department"),
        ("Cost center", "cost_center"),
    ] {
        if let Some(v) = invoice.first_value(field) {
            out.push_str(&format!("- {label}: {}\n", truncate(v, MAX_FIELD_CHARS)));
        }
    }
    if let Some(total) = invoice_total(invoice) {
        out.push_str(&format!("- Total amount: {total:.2}\n"));
    }
    out.push_str(&format!("- Line count: {}\n\nLINE ITEMS:\n", invoice.len()));

    for (i, row) in invoice.rows.iter().enumerate() {
        let desc = row
            .get("line_description")
            .map(|v| truncate(v, MAX_DESC_CHARS))
            .unwrap_or_else(|| "(no description)".to_string());
        let mut line = format!("{}. {desc}", i + 1);
        if let Some(gl) = row.get("gl_description") {
            line.push_str(&format!(" | GL: {}", truncate(gl, MAX_GL_CHARS)));
        }
        if let Some(amount) = row.get("amount") {
            line.push_str(&format!(" | Amount: {amount}"));
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn invoice_total(invoice: &Invoice) -> Option<f64> {
    let amounts: Vec<f64> = invoice
        .rows
        .iter()
        .filter_map(|r| r.get("amount"))
        .filter_map(|a| a.replace(',', "").parse::<f64>().ok())
        .collect();
    if amounts.is_empty() {
        None
    } else {
        Some(amounts.iter().sum())
    }
}

/// Candidate categories, grouped by L1 with the deepest paths first so the
/// model sees the most specific options before the generic ones.
pub fn format_taxonomy_sample(groups: &[L1Group], taxonomy: &Taxonomy) -> String {
    let mut out = String::from("CANDIDATE CATEGORIES:\n");
    for group in groups {
        out.push_str(&format!("\n## {}\n", group.l1));
        let mut paths = group.paths.clone();
        paths.sort_by(|a, b| {
            b.path
                .matches('|')
                .count()
                .cmp(&a.path.matches('|').count())
        });
        for result in &paths {
            out.push_str(&format!("- {}", result.path));
            if result.score > 0.0 {
                out.push_str(&format!(" (relevance {:.2})", result.score));
            }
            if let Some(desc) = taxonomy.description(&result.path) {
                out.push_str(&format!(": {}", truncate(desc, MAX_GL_CHARS)));
            }
            out.push('\n');
        }
    }
    out
}

pub fn system_prompt(taxonomy: &Taxonomy) -> String {
    let mut out = String::from(
        "You are a procurement spend-classification assistant. You assign \
         accounts-payable transactions to categories from the client's spend \
         taxonomy.\n",
    );
    if !taxonomy.client_name.is_empty() {
        out.push_str(&format!("Client: {}\n", taxonomy.client_name));
    }
    if !taxonomy.company_context.is_empty() {
        out.push_str(&format!("Client context: {}\n", taxonomy.company_context));
    }
    out
}

const CLASSIFICATION_RULES: &str = "\
CLASSIFICATION RULES:
1. Choose only from the candidate categories above, copying the full \
pipe-delimited path exactly as written.
2. Never answer with a bare top-level category when a deeper path exists \
under it; pick the most specific path the evidence supports.
3. Tax, VAT, GST or duty lines on an invoice dominated by an underlying \
purchase belong to that purchase's category, not to a tax or finance \
category.
4. If the evidence is genuinely insufficient, answer Unknown.";

/// Prompt for exactly one uncached row.
pub fn single_prompt(supplier_info: &str, transaction_info: &str, taxonomy_sample: &str) -> String {
    format!(
        "SUPPLIER:\n{supplier_info}\n\n{transaction_info}\n{taxonomy_sample}\n\
         {CLASSIFICATION_RULES}\n\n\
         Respond with exactly one taxonomy path and nothing else."
    )
}

/// Prompt for 2..=B uncached rows of one invoice.
pub fn batch_prompt(
    supplier_info: &str,
    invoice_info: &str,
    taxonomy_sample: &str,
    row_count: usize,
) -> String {
    format!(
        "SUPPLIER:\n{supplier_info}\n\n{invoice_info}\n{taxonomy_sample}\n\
         {CLASSIFICATION_RULES}\n\n\
         Classify all {row_count} line items. If every line belongs to the \
         same category, respond with that single taxonomy path and nothing \
         else. Otherwise respond with a JSON array of exactly {row_count} \
         taxonomy paths, one per line item, in line-item order."
    )
}

//! Repository functions for the classification cache and rule tables.
//!
//! Free functions over `&Connection`; callers own locking. Supplier names
//! are normalized (trim + lowercase) before they touch a key column so that
//! "AWS " and "aws" share cache and rule rows.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::DatabaseError;
use crate::models::{Classification, Confidence, Rule, RuleScope, SupplierProfile};

pub fn normalize_supplier(name: &str) -> String {
    name.trim().to_lowercase()
}

fn confidence_as_str(c: Confidence) -> &'static str {
    match c {
        Confidence::High => "high",
        Confidence::Medium => "medium",
        Confidence::Low => "low",
    }
}

fn confidence_from_str(value: &str) -> Result<Confidence, DatabaseError> {
    match value {
        "high" => Ok(Confidence::High),
        "medium" => Ok(Confidence::Medium),
        "low" => Ok(Confidence::Low),
        other => Err(DatabaseError::InvalidEnum {
            field: "confidence".to_string(),
            value: other.to_string(),
        }),
    }
}

fn scope_from(dataset_name: Option<String>) -> RuleScope {
    match dataset_name {
        Some(name) => RuleScope::Dataset(name),
        None => RuleScope::Global,
    }
}

// ── Classification cache ────────────────────────────────────────────────────

/// A cache hit as stored, with its bookkeeping columns.
#[derive(Debug, Clone)]
pub struct CachedClassification {
    pub transaction_hash: String,
    pub classification: Classification,
    pub usage_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// A fresh result to persist for future runs.
#[derive(Debug)]
pub struct NewCacheEntry<'a> {
    pub supplier_name: &'a str,
    pub transaction_hash: String,
    pub classification: &'a Classification,
    pub supplier_profile: Option<&'a SupplierProfile>,
    /// JSON snapshot of the fields that fed the content hash.
    pub transaction_snapshot: Option<String>,
    pub run_id: &'a str,
    pub dataset_name: Option<&'a str>,
}

/// Batch exact-match lookup. Hits increment `usage_count`; misses are
/// simply absent from the returned map.
pub fn get_cached_classifications(
    conn: &Connection,
    supplier_name: &str,
    hashes: &[String],
) -> Result<HashMap<String, CachedClassification>, DatabaseError> {
    let supplier = normalize_supplier(supplier_name);
    let mut stmt = conn.prepare(
        "SELECT transaction_hash, l1, l2, l3, l4, l5, reasoning, confidence,
                override_rule_applied, usage_count, updated_at
         FROM supplier_classifications
         WHERE supplier_name = ?1 AND transaction_hash = ?2",
    )?;

    let mut hits = HashMap::new();
    for hash in hashes {
        let row = stmt
            .query_row(params![supplier, hash], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, DateTime<Utc>>(10)?,
                ))
            })
            .optional()?;

        let Some((hash, l1, l2, l3, l4, l5, reasoning, confidence, rule_tag, count, updated)) = row
        else {
            continue;
        };

        let classification = Classification {
            l1,
            l2,
            l3,
            l4,
            l5,
            override_rule_applied: rule_tag,
            reasoning,
            confidence: confidence_from_str(&confidence)?,
        };
        hits.insert(
            hash.clone(),
            CachedClassification {
                transaction_hash: hash,
                classification,
                usage_count: count + 1,
                updated_at: updated,
            },
        );
    }

    if !hits.is_empty() {
        let mut bump = conn.prepare(
            "UPDATE supplier_classifications
             SET usage_count = usage_count + 1, updated_at = ?3
             WHERE supplier_name = ?1 AND transaction_hash = ?2",
        )?;
        let now = Utc::now();
        for hash in hits.keys() {
            bump.execute(params![supplier, hash, now])?;
        }
    }

    Ok(hits)
}

/// Persist fresh results. Re-storing an existing key replaces the payload
/// and keeps the accumulated `usage_count`.
pub fn store_classifications(
    conn: &Connection,
    entries: &[NewCacheEntry<'_>],
) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO supplier_classifications
                 (supplier_name, transaction_hash, l1, l2, l3, l4, l5, reasoning,
                  confidence, override_rule_applied, supplier_profile_snapshot,
                  transaction_snapshot, run_id, dataset_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)
             ON CONFLICT (supplier_name, transaction_hash) DO UPDATE SET
                 l1 = excluded.l1, l2 = excluded.l2, l3 = excluded.l3,
                 l4 = excluded.l4, l5 = excluded.l5,
                 reasoning = excluded.reasoning,
                 confidence = excluded.confidence,
                 override_rule_applied = excluded.override_rule_applied,
                 supplier_profile_snapshot = excluded.supplier_profile_snapshot,
                 transaction_snapshot = excluded.transaction_snapshot,
                 run_id = excluded.run_id,
                 dataset_name = excluded.dataset_name,
                 updated_at = excluded.updated_at",
        )?;
        let now = Utc::now();
        for entry in entries {
            let profile_json = entry
                .supplier_profile
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| DatabaseError::MalformedPayload(e.to_string()))?;
            let c = entry.classification;
            stmt.execute(params![
                normalize_supplier(entry.supplier_name),
                entry.transaction_hash,
                c.l1,
                c.l2,
                c.l3,
                c.l4,
                c.l5,
                c.reasoning,
                confidence_as_str(c.confidence),
                c.override_rule_applied,
                profile_json,
                entry.transaction_snapshot,
                entry.run_id,
                entry.dataset_name,
                now,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Most recent persisted supplier profile snapshot, if fresh enough.
pub fn get_supplier_profile_snapshot(
    conn: &Connection,
    supplier_name: &str,
    max_age_days: Option<u32>,
) -> Result<Option<SupplierProfile>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT supplier_profile_snapshot, updated_at
             FROM supplier_classifications
             WHERE supplier_name = ?1 AND supplier_profile_snapshot IS NOT NULL
             ORDER BY updated_at DESC, id DESC LIMIT 1",
            params![normalize_supplier(supplier_name)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, DateTime<Utc>>(1)?,
                ))
            },
        )
        .optional()?;

    let Some((json, updated_at)) = row else {
        return Ok(None);
    };
    if let Some(days) = max_age_days {
        if Utc::now() - updated_at > Duration::days(i64::from(days)) {
            return Ok(None);
        }
    }
    let mut profile: SupplierProfile = serde_json::from_str(&json)
        .map_err(|e| DatabaseError::MalformedPayload(e.to_string()))?;
    profile.source = "cache".to_string();
    Ok(Some(profile))
}

// ── Rules ───────────────────────────────────────────────────────────────────

/// Highest-priority active direct mapping for the supplier in the given
/// scope. Ties break toward the newest rule.
pub fn get_direct_mapping(
    conn: &Connection,
    supplier_name: &str,
    dataset_name: Option<&str>,
) -> Result<Option<Rule>, DatabaseError> {
    conn.query_row(
        "SELECT id, supplier_name, path, dataset_name, priority, created_at
         FROM supplier_direct_mappings
         WHERE supplier_name = ?1 AND active = 1 AND dataset_name IS ?2
         ORDER BY priority DESC, id DESC LIMIT 1",
        params![normalize_supplier(supplier_name), dataset_name],
        |row| {
            Ok(Rule::DirectMapping {
                id: row.get(0)?,
                supplier_name: row.get(1)?,
                path: row.get(2)?,
                scope: scope_from(row.get(3)?),
                priority: row.get(4)?,
                created_at: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(DatabaseError::from)
}

pub fn get_taxonomy_constraint(
    conn: &Connection,
    supplier_name: &str,
    dataset_name: Option<&str>,
) -> Result<Option<Rule>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, supplier_name, allowed_paths, dataset_name, priority, created_at
             FROM supplier_taxonomy_constraints
             WHERE supplier_name = ?1 AND active = 1 AND dataset_name IS ?2
             ORDER BY priority DESC, id DESC LIMIT 1",
            params![normalize_supplier(supplier_name), dataset_name],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, DateTime<Utc>>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((id, supplier_name, paths_json, dataset, priority, created_at)) = row else {
        return Ok(None);
    };
    let allowed_paths: Vec<String> = serde_json::from_str(&paths_json)
        .map_err(|e| DatabaseError::MalformedPayload(e.to_string()))?;
    Ok(Some(Rule::TaxonomyConstraint {
        id,
        supplier_name,
        allowed_paths,
        scope: scope_from(dataset),
        priority,
        created_at,
    }))
}

/// All active transaction rules for the supplier in the given scope,
/// strongest first. Condition matching happens at the call site.
pub fn get_transaction_rules(
    conn: &Connection,
    supplier_name: &str,
    dataset_name: Option<&str>,
) -> Result<Vec<Rule>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, supplier_name, field, value, path, dataset_name, priority, created_at
         FROM transaction_rules
         WHERE supplier_name = ?1 AND active = 1 AND dataset_name IS ?2
         ORDER BY priority DESC, id DESC",
    )?;
    let rows = stmt.query_map(
        params![normalize_supplier(supplier_name), dataset_name],
        |row| {
            Ok(Rule::TransactionRule {
                id: row.get(0)?,
                name: row.get(1)?,
                supplier_name: row.get(2)?,
                field: row.get(3)?,
                value: row.get(4)?,
                path: row.get(5)?,
                scope: scope_from(row.get(6)?),
                priority: row.get(7)?,
                created_at: row.get(8)?,
            })
        },
    )?;
    rows.map(|r| r.map_err(DatabaseError::from)).collect()
}

/// Insert a direct mapping, deactivating the previously active mapping for
/// the same supplier and scope in the same transaction.
pub fn insert_direct_mapping(
    conn: &Connection,
    supplier_name: &str,
    path: &str,
    dataset_name: Option<&str>,
    priority: i64,
) -> Result<i64, DatabaseError> {
    let supplier = normalize_supplier(supplier_name);
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE supplier_direct_mappings SET active = 0
         WHERE supplier_name = ?1 AND dataset_name IS ?2 AND active = 1",
        params![supplier, dataset_name],
    )?;
    tx.execute(
        "INSERT INTO supplier_direct_mappings
             (supplier_name, path, dataset_name, priority, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![supplier, path, dataset_name, priority, Utc::now()],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok(id)
}

pub fn insert_taxonomy_constraint(
    conn: &Connection,
    supplier_name: &str,
    allowed_paths: &[String],
    dataset_name: Option<&str>,
    priority: i64,
) -> Result<i64, DatabaseError> {
    let supplier = normalize_supplier(supplier_name);
    let paths_json = serde_json::to_string(allowed_paths)
        .map_err(|e| DatabaseError::MalformedPayload(e.to_string()))?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE supplier_taxonomy_constraints SET active = 0
         WHERE supplier_name = ?1 AND dataset_name IS ?2 AND active = 1",
        params![supplier, dataset_name],
    )?;
    tx.execute(
        "INSERT INTO supplier_taxonomy_constraints
             (supplier_name, allowed_paths, dataset_name, priority, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![supplier, paths_json, dataset_name, priority, Utc::now()],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok(id)
}

/// Insert a transaction rule. Supersession applies per condition field, so
/// rules on different fields coexist.
pub fn insert_transaction_rule(
    conn: &Connection,
    name: &str,
    supplier_name: &str,
    field: &str,
    value: &str,
    path: &str,
    dataset_name: Option<&str>,
    priority: i64,
) -> Result<i64, DatabaseError> {
    let supplier = normalize_supplier(supplier_name);
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE transaction_rules SET active = 0
         WHERE supplier_name = ?1 AND dataset_name IS ?2 AND field = ?3 AND active = 1",
        params![supplier, dataset_name, field],
    )?;
    tx.execute(
        "INSERT INTO transaction_rules
             (name, supplier_name, field, value, path, dataset_name, priority, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            name,
            supplier,
            field,
            value,
            path,
            dataset_name,
            priority,
            Utc::now()
        ],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok(id)
}

//! Layered run cache.
//!
//! Tier 1: exact-match classification cache in SQLite, keyed by normalized
//! supplier plus a stable content hash. Tier 2: supplier profiles, an
//! in-memory map backed by persisted snapshots, with per-supplier
//! single-flight so research runs at most once per supplier per run.
//! Tier 3: parsed taxonomy files and their embedding indexes, memoized by
//! file path.
//!
//! Cache failures never fail a run: reads degrade to misses, writes to a
//! logged warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::db;
use crate::engine::research::SupplierResearcher;
use crate::engine::retrieval::{Embedder, TaxonomyIndex};
use crate::engine::taxonomy::load_taxonomy;
use crate::engine::ClassifyError;
use crate::models::{Classification, SupplierProfile, Taxonomy, TransactionRow};

/// Parsed taxonomy plus its searchable index.
pub struct TaxonomyBundle {
    pub taxonomy: Taxonomy,
    pub index: TaxonomyIndex,
}

pub struct CacheManager {
    conn: Option<Arc<Mutex<Connection>>>,
    max_age_days: Option<u32>,
    profiles: RwLock<HashMap<String, SupplierProfile>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    bundles: RwLock<HashMap<PathBuf, Arc<TaxonomyBundle>>>,
}

/// Stable content hash over the fields that determine a classification.
/// Normalization (trim + lowercase) keeps the hash identical across runs
/// and across cosmetic input differences.
pub fn transaction_hash(row: &TransactionRow) -> String {
    let component = |field: &str| {
        row.get(field)
            .map(|v| v.to_lowercase())
            .unwrap_or_default()
    };
    let material = format!(
        "{}|{}|{}",
        component("gl_description"),
        component("line_description"),
        component("department"),
    );
    let digest = Sha256::digest(material.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

impl CacheManager {
    pub fn new(conn: Option<Arc<Mutex<Connection>>>, max_age_days: Option<u32>) -> Self {
        Self {
            conn,
            max_age_days,
            profiles: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            bundles: RwLock::new(HashMap::new()),
        }
    }

    /// Tier-1 batch lookup. Returns hits keyed by `row_index`, marked with
    /// the `"cache"` provenance tag. Misses are simply absent; a read
    /// failure is a full miss.
    pub fn lookup_batch(
        &self,
        supplier_name: &str,
        rows: &[&TransactionRow],
    ) -> HashMap<usize, Classification> {
        let Some(conn) = &self.conn else {
            return HashMap::new();
        };
        let hashes: Vec<String> = rows.iter().map(|r| transaction_hash(r)).collect();

        let hits = {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            db::get_cached_classifications(&conn, supplier_name, &hashes)
        };
        let hits = match hits {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(supplier_name, error = %e, "cache lookup failed, treating as miss");
                return HashMap::new();
            }
        };

        rows.iter()
            .zip(&hashes)
            .filter_map(|(row, hash)| {
                hits.get(hash).map(|cached| {
                    let mut classification = cached.classification.clone();
                    classification.override_rule_applied = "cache".to_string();
                    (row.row_index, classification)
                })
            })
            .collect()
    }

    /// Tier-1 write-back for freshly classified rows. Failures degrade to a
    /// warning; the caller already holds the results.
    pub fn store_batch(
        &self,
        supplier_name: &str,
        rows: &[(&TransactionRow, &Classification)],
        profile: Option<&SupplierProfile>,
        run_id: &str,
        dataset_name: Option<&str>,
    ) {
        let Some(conn) = &self.conn else {
            return;
        };
        if rows.is_empty() {
            return;
        }

        let snapshots: Vec<String> = rows
            .iter()
            .map(|(row, _)| {
                serde_json::json!({
                    "gl_description": row.get("gl_description").unwrap_or(""),
                    "line_description": row.get("line_description").unwrap_or(""),
                    "department": row.get("department").unwrap_or(""),
                })
                .to_string()
            })
            .collect();
        let entries: Vec<db::NewCacheEntry<'_>> = rows
            .iter()
            .zip(&snapshots)
            .map(|((row, classification), snapshot)| db::NewCacheEntry {
                supplier_name,
                transaction_hash: transaction_hash(row),
                classification,
                supplier_profile: profile,
                transaction_snapshot: Some(snapshot.clone()),
                run_id,
                dataset_name,
            })
            .collect();

        let result = {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            db::store_classifications(&conn, &entries)
        };
        if let Err(e) = result {
            tracing::warn!(supplier_name, error = %e, "cache write failed, results kept in memory only");
        }
    }

    /// Tier-2 profile lookup with single-flight research.
    ///
    /// Order: run-local map, persisted snapshot (within the freshness
    /// window), then the research collaborator. A research failure logs and
    /// yields the default unresearched profile, which is then cached so the
    /// failure is not retried within the run.
    pub fn supplier_profile(
        &self,
        supplier_name: &str,
        researcher: &dyn SupplierResearcher,
    ) -> SupplierProfile {
        let key = db::normalize_supplier(supplier_name);
        if let Some(profile) = self
            .profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return profile.clone();
        }

        let guard = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(inflight.entry(key.clone()).or_default())
        };
        let _held = guard.lock().unwrap_or_else(|e| e.into_inner());

        // Another worker may have resolved it while we waited on the guard.
        if let Some(profile) = self
            .profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return profile.clone();
        }

        let profile = self
            .snapshot_profile(supplier_name)
            .unwrap_or_else(|| match researcher.research(supplier_name) {
                Ok(profile) => profile,
                Err(e) => {
                    tracing::warn!(supplier_name, error = %e, "supplier research failed, using default profile");
                    SupplierProfile::unresearched(supplier_name)
                }
            });

        self.profiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, profile.clone());
        profile
    }

    fn snapshot_profile(&self, supplier_name: &str) -> Option<SupplierProfile> {
        let conn = self.conn.as_ref()?;
        let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
        match db::get_supplier_profile_snapshot(&conn, supplier_name, self.max_age_days) {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(supplier_name, error = %e, "profile snapshot read failed");
                None
            }
        }
    }

    /// Tier-3 taxonomy bundle, memoized by file path. An embedder failure
    /// during index build degrades to a keyword-only index.
    pub fn taxonomy_bundle(
        &self,
        path: &Path,
        embedder: Option<&dyn Embedder>,
    ) -> Result<Arc<TaxonomyBundle>, ClassifyError> {
        if let Some(bundle) = self
            .bundles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
        {
            return Ok(Arc::clone(bundle));
        }

        let taxonomy = load_taxonomy(path)?;
        let index = match TaxonomyIndex::build(&taxonomy, embedder) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "embedding index build failed, keyword search only");
                TaxonomyIndex::build(&taxonomy, None)?
            }
        };
        let bundle = Arc::new(TaxonomyBundle { taxonomy, index });

        let mut bundles = self.bundles.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(
            bundles
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::clone(&bundle)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::engine::research::testing::CountingResearcher;
    use crate::models::Confidence;
    use std::sync::atomic::Ordering;

    fn row(index: usize, pairs: &[(&str, &str)]) -> TransactionRow {
        TransactionRow::new(
            index,
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn manager() -> CacheManager {
        let conn = open_memory_database().unwrap();
        CacheManager::new(Some(Arc::new(Mutex::new(conn))), None)
    }

    #[test]
    fn hash_is_stable_under_cosmetic_differences() {
        let a = row(0, &[
            ("gl_description", "Cloud Hosting"),
            ("line_description", "EC2"),
        ]);
        let b = row(7, &[
            ("gl_description", "  cloud hosting "),
            ("line_description", "ec2"),
            ("amount", "999.99"),
        ]);
        assert_eq!(transaction_hash(&a), transaction_hash(&b));

        let c = row(0, &[
            ("gl_description", "Cloud Hosting"),
            ("line_description", "EC2"),
            ("department", "IT"),
        ]);
        assert_ne!(transaction_hash(&a), transaction_hash(&c));
    }

    #[test]
    fn store_then_lookup_round_trips_with_cache_tag() {
        let cache = manager();
        let r0 = row(0, &[("line_description", "EC2 compute")]);
        let r1 = row(1, &[("line_description", "Office chairs")]);
        let classification = Classification::from_path("it|cloud|iaas", Confidence::High);

        cache.store_batch("AWS", &[(&r0, &classification)], None, "run-1", None);

        let hits = cache.lookup_batch("aws", &[&r0, &r1]);
        assert_eq!(hits.len(), 1);
        let hit = &hits[&0];
        assert_eq!(hit.path(), "it|cloud|iaas");
        assert_eq!(hit.override_rule_applied, "cache");
        assert!(!hits.contains_key(&1));
    }

    #[test]
    fn no_database_degrades_to_pure_miss() {
        let cache = CacheManager::new(None, None);
        let r = row(0, &[("line_description", "EC2")]);
        let c = Classification::from_path("a|b", Confidence::Medium);
        cache.store_batch("AWS", &[(&r, &c)], None, "run-1", None);
        assert!(cache.lookup_batch("AWS", &[&r]).is_empty());
    }

    #[test]
    fn research_runs_once_across_concurrent_workers() {
        let cache = Arc::new(manager());
        let researcher = Arc::new(CountingResearcher::new());

        std::thread::scope(|s| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                let researcher = Arc::clone(&researcher);
                s.spawn(move || {
                    let profile = cache.supplier_profile("AWS", researcher.as_ref());
                    assert_eq!(profile.source, "research");
                });
            }
        });

        assert_eq!(researcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_research_falls_back_and_is_not_retried() {
        let cache = manager();
        let researcher = CountingResearcher::failing();

        let first = cache.supplier_profile("AWS", &researcher);
        assert_eq!(first.source, "default");
        assert_eq!(first.industry, "Unknown");

        let second = cache.supplier_profile("aws", &researcher);
        assert_eq!(second, first);
        assert_eq!(researcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persisted_snapshot_short_circuits_research() {
        let conn = Arc::new(Mutex::new(open_memory_database().unwrap()));
        let first_run = CacheManager::new(Some(Arc::clone(&conn)), Some(30));
        let researcher = CountingResearcher::new();

        let r = row(0, &[("line_description", "EC2")]);
        let c = Classification::from_path("it|cloud", Confidence::High);
        let profile = first_run.supplier_profile("AWS", &researcher);
        first_run.store_batch("AWS", &[(&r, &c)], Some(&profile), "run-1", None);
        assert_eq!(researcher.calls.load(Ordering::SeqCst), 1);

        let second_run = CacheManager::new(Some(conn), Some(30));
        let restored = second_run.supplier_profile("AWS", &researcher);
        assert_eq!(restored.source, "cache");
        assert_eq!(restored.industry, "Technology");
        assert_eq!(researcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn taxonomy_bundle_is_memoized_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taxonomy.yaml");
        std::fs::write(&path, "taxonomy:\n  - IT|Cloud\n").unwrap();

        let cache = CacheManager::new(None, None);
        let a = cache.taxonomy_bundle(&path, None).unwrap();
        let b = cache.taxonomy_bundle(&path, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.taxonomy.paths, ["IT|Cloud"]);
    }
}

//! Hybrid taxonomy retrieval.
//!
//! Candidate paths for a prompt come from two complementary searches over
//! the same index: token overlap (exact plus partial containment) and
//! cosine similarity over an `Embedder`-provided vector space. Queries are
//! multi-variation; a path's semantic score is its best score across
//! variations, boosted slightly when several variations agree on it.

use std::collections::HashMap;

use crate::config::{EngineConfig, RetrievalConfig};
use crate::engine::ClassifyError;
use crate::models::{Invoice, SupplierProfile, Taxonomy};

/// Embedding seam. Real deployments back this with a sentence-embedding
/// model; the engine only needs same-space vectors of equal length.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ClassifyError>;
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub path: String,
    pub score: f32,
    pub keyword_score: f32,
    pub semantic_score: f32,
}

/// One L1 category with its retained candidate paths, strongest first.
#[derive(Debug, Clone)]
pub struct L1Group {
    pub l1: String,
    pub score: f32,
    pub paths: Vec<RetrievalResult>,
}

struct IndexEntry {
    path: String,
    tokens: Vec<String>,
    depth: usize,
    embedding: Option<Vec<f32>>,
}

/// Searchable index over one taxonomy, built once per taxonomy file and
/// memoized for the run.
pub struct TaxonomyIndex {
    entries: Vec<IndexEntry>,
}

impl TaxonomyIndex {
    pub fn build(
        taxonomy: &Taxonomy,
        embedder: Option<&dyn Embedder>,
    ) -> Result<Self, ClassifyError> {
        let mut entries = Vec::with_capacity(taxonomy.paths.len());
        for path in &taxonomy.paths {
            let mut text = path.replace('|', " ");
            if let Some(desc) = taxonomy.description(path) {
                text.push(' ');
                text.push_str(desc);
            }
            let embedding = match embedder {
                Some(e) => Some(e.embed(&text)?),
                None => None,
            };
            entries.push(IndexEntry {
                path: path.clone(),
                tokens: tokenize(&text),
                depth: path.split('|').count(),
                embedding,
            });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the hybrid search for a set of query variations.
    ///
    /// A path enters the result set when any variation surfaced it
    /// semantically, or when its keyword score alone clears the rescue
    /// threshold (strong token evidence the embedding space missed).
    pub fn retrieve(
        &self,
        queries: &[String],
        embedder: Option<&dyn Embedder>,
        cfg: &RetrievalConfig,
    ) -> Result<Vec<RetrievalResult>, ClassifyError> {
        let query_tokens: Vec<Vec<String>> = queries.iter().map(|q| tokenize(q)).collect();

        let mut semantic = vec![0.0f32; self.entries.len()];
        let mut appearances = vec![0u32; self.entries.len()];
        let mut surfaced = vec![false; self.entries.len()];

        if let Some(embedder) = embedder {
            for query in queries {
                let qvec = embedder.embed(query)?;
                let mut sims: Vec<(usize, f32)> = self
                    .entries
                    .iter()
                    .enumerate()
                    .filter_map(|(i, e)| {
                        e.embedding
                            .as_ref()
                            .map(|v| (i, cosine_similarity(&qvec, v)))
                    })
                    .collect();
                sims.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                for &(i, sim) in sims.iter().take(cfg.top_k) {
                    surfaced[i] = true;
                    appearances[i] += 1;
                    if sim > semantic[i] {
                        semantic[i] = sim;
                    }
                }
            }
        }

        let mut results = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            let keyword = query_tokens
                .iter()
                .map(|q| keyword_similarity(q, entry))
                .fold(0.0f32, f32::max);

            if !surfaced[i] && keyword <= cfg.keyword_rescue_threshold && embedder.is_some() {
                continue;
            }
            if embedder.is_none() && keyword <= 0.0 {
                continue;
            }

            let boost = (0.1 * appearances[i].saturating_sub(1) as f32).min(0.2);
            let score = (cfg.keyword_weight * keyword
                + cfg.semantic_weight * semantic[i]
                + boost)
                .clamp(0.0, 1.0);
            if score < cfg.min_score {
                continue;
            }
            results.push(RetrievalResult {
                path: entry.path.clone(),
                score,
                keyword_score: keyword,
                semantic_score: semantic[i],
            });
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }
}

/// Group scored paths by top-level category under the configured budgets.
/// Groups are ranked by their best path plus a small breadth bonus; when the
/// primary selection leaves budget unspent, weaker groups fill the rest.
pub fn group_by_l1(results: &[RetrievalResult], cfg: &RetrievalConfig) -> Vec<L1Group> {
    let mut order: Vec<String> = Vec::new();
    let mut by_l1: HashMap<String, Vec<RetrievalResult>> = HashMap::new();
    for result in results {
        let l1 = Taxonomy::l1_of(&result.path).to_string();
        let key = l1.to_lowercase();
        if !by_l1.contains_key(&key) {
            order.push(l1);
        }
        by_l1.entry(key).or_default().push(result.clone());
    }

    let mut groups: Vec<L1Group> = order
        .into_iter()
        .map(|l1| {
            let mut paths = by_l1.remove(&l1.to_lowercase()).unwrap_or_default();
            paths.truncate(cfg.max_paths_per_l1);
            let best = paths.first().map_or(0.0, |p| p.score);
            let breadth = (0.02 * (paths.len().saturating_sub(1)) as f32).min(0.1);
            L1Group {
                l1,
                score: best + breadth,
                paths,
            }
        })
        .collect();
    groups.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    // Primary selection honors the group cap; weaker groups are admitted
    // afterwards only while path budget remains.
    let mut kept = Vec::new();
    let mut total = 0usize;
    for (i, mut group) in groups.into_iter().enumerate() {
        if total >= cfg.max_total_paths {
            break;
        }
        if i >= cfg.max_l1_categories && total + group.paths.len() > cfg.max_total_paths {
            continue;
        }
        group.paths.truncate(cfg.max_total_paths - total);
        total += group.paths.len();
        kept.push(group);
    }
    kept
}

/// Curated constraint paths grouped verbatim, no scoring.
pub fn constraint_groups(paths: &[String]) -> Vec<L1Group> {
    let results: Vec<RetrievalResult> = paths
        .iter()
        .map(|p| RetrievalResult {
            path: p.clone(),
            score: 0.0,
            keyword_score: 0.0,
            semantic_score: 0.0,
        })
        .collect();

    let mut order: Vec<String> = Vec::new();
    let mut by_l1: HashMap<String, Vec<RetrievalResult>> = HashMap::new();
    for result in &results {
        let l1 = Taxonomy::l1_of(&result.path).to_string();
        let key = l1.to_lowercase();
        if !by_l1.contains_key(&key) {
            order.push(l1);
        }
        by_l1.entry(key).or_default().push(result.clone());
    }
    order
        .into_iter()
        .map(|l1| L1Group {
            paths: by_l1.remove(&l1.to_lowercase()).unwrap_or_default(),
            l1,
            score: 0.0,
        })
        .collect()
}

/// Query variations for one invoice: supplier-focused, description-focused,
/// structured-field, and combined. Blank variations are dropped, duplicates
/// collapse.
pub fn build_queries(
    invoice: &Invoice,
    profile: &SupplierProfile,
    cfg: &EngineConfig,
) -> Vec<String> {
    let line_descs = collect_values(invoice, "line_description", cfg.max_line_descriptions);
    let gl_descs = collect_values(invoice, "gl_description", cfg.max_gl_descriptions);

    let supplier_focused = join_parts(&[
        profile.supplier_name.as_str(),
        profile.industry.as_str(),
        profile.products_services.as_str(),
    ]);
    let description_focused = {
        let mut parts: Vec<&str> = line_descs.iter().map(String::as_str).collect();
        parts.extend(gl_descs.iter().map(String::as_str));
        parts.join(" ")
    };
    let structured = join_parts(&[
        invoice.first_value("department").unwrap_or(""),
        invoice.first_value("cost_center").unwrap_or(""),
        invoice.first_value("gl_code").unwrap_or(""),
    ]);
    let combined = join_parts(&[profile.supplier_name.as_str(), description_focused.as_str()]);

    let mut queries = Vec::new();
    for candidate in [supplier_focused, description_focused, structured, combined] {
        let trimmed = candidate.trim().to_string();
        if !trimmed.is_empty() && !queries.contains(&trimmed) {
            queries.push(trimmed);
        }
    }
    queries
}

/// How convincing the retrieval evidence is, for deciding whether supplier
/// research is worth its cost: `0.7 * best + 0.3 * mean(top_n)`.
pub fn confidence_score(results: &[RetrievalResult], top_n: usize) -> f32 {
    if results.is_empty() || top_n == 0 {
        return 0.0;
    }
    let top: Vec<f32> = results.iter().take(top_n).map(|r| r.score).collect();
    let max = top.iter().copied().fold(0.0f32, f32::max);
    let avg = top.iter().sum::<f32>() / top.len() as f32;
    0.7 * max + 0.3 * avg
}

fn collect_values(invoice: &Invoice, field: &str, limit: usize) -> Vec<String> {
    let mut seen = Vec::new();
    for row in &invoice.rows {
        if let Some(v) = row.get(field) {
            let lowered = v.to_lowercase();
            if !seen.iter().any(|(l, _)| l == &lowered) {
                seen.push((lowered, v.to_string()));
                if seen.len() == limit {
                    break;
                }
            }
        }
    }
    seen.into_iter().map(|(_, v)| v).collect()
}

fn join_parts(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "by", "co", "de", "for", "from", "gmbh", "has", "have",
    "in", "inc", "is", "llc", "ltd", "of", "on", "or", "our", "that", "the", "this", "to", "was",
    "with",
];

/// Lowercase alphanumeric tokens, stopwords and single characters removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn keyword_similarity(query_tokens: &[String], entry: &IndexEntry) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let mut hits = 0.0f32;
    for token in query_tokens {
        if entry.tokens.iter().any(|e| e == token) {
            hits += 1.0;
        } else if token.len() >= 3
            && entry
                .tokens
                .iter()
                .any(|e| e.contains(token.as_str()) || (e.len() >= 3 && token.contains(e.as_str())))
        {
            hits += 0.5;
        }
    }
    if hits == 0.0 {
        return 0.0;
    }
    // The base is scaled under the bonus cap so a saturated token match
    // cannot clamp away the depth preference: on equal token evidence the
    // deeper, more specific path always scores higher.
    let base = (hits / query_tokens.len() as f32).min(1.0) * 0.8;
    let depth_bonus = (0.05 * entry.depth as f32).min(0.2);
    base + depth_bonus
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

//! Taxonomy file loading and path validation.
//!
//! The client taxonomy is a YAML document:
//!
//! ```yaml
//! client_name: Acme Corp
//! company_context: Mid-size manufacturer, EU operations.
//! taxonomy:
//!   - IT|Cloud|IaaS
//!   - IT|Cloud|PaaS
//! taxonomy_descriptions:
//!   IT|Cloud|IaaS: Raw compute, storage and network capacity.
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::engine::retrieval::tokenize;
use crate::engine::ClassifyError;
use crate::models::Taxonomy;

#[derive(Debug, Deserialize)]
struct TaxonomyFile {
    #[serde(default)]
    client_name: String,
    #[serde(default)]
    company_context: String,
    taxonomy: Vec<String>,
    #[serde(default)]
    taxonomy_descriptions: HashMap<String, String>,
}

pub fn load_taxonomy(path: &Path) -> Result<Taxonomy, ClassifyError> {
    let text = std::fs::read_to_string(path)?;
    parse_taxonomy(&text)
}

pub fn parse_taxonomy(text: &str) -> Result<Taxonomy, ClassifyError> {
    let file: TaxonomyFile =
        serde_yaml::from_str(text).map_err(|e| ClassifyError::Taxonomy(e.to_string()))?;

    let mut seen = HashSet::new();
    let paths: Vec<String> = file
        .taxonomy
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty() && seen.insert(p.to_lowercase()))
        .collect();
    if paths.is_empty() {
        return Err(ClassifyError::Taxonomy(
            "taxonomy file contains no paths".to_string(),
        ));
    }

    Ok(Taxonomy {
        paths,
        descriptions: file.taxonomy_descriptions,
        client_name: file.client_name,
        company_context: file.company_context,
    })
}

/// Closest valid paths to an invalid one, by token overlap. Used to correct
/// near-miss LLM output like a truncated or re-worded level name.
pub fn similar_paths<'a>(taxonomy: &'a Taxonomy, invalid: &str, limit: usize) -> Vec<&'a str> {
    let wanted = tokenize(&invalid.replace('|', " "));
    if wanted.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(f32, &str)> = taxonomy
        .paths
        .iter()
        .map(|path| {
            let have: HashSet<String> =
                tokenize(&path.replace('|', " ")).into_iter().collect();
            let mut hits = 0.0f32;
            for token in &wanted {
                if have.contains(token) {
                    hits += 1.0;
                } else if token.len() >= 3
                    && have.iter().any(|h| h.contains(token.as_str()) || token.contains(h.as_str()))
                {
                    hits += 0.5;
                }
            }
            (hits / wanted.len() as f32, path.as_str())
        })
        .filter(|(score, _)| *score > 0.0)
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(limit).map(|(_, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
client_name: Acme Corp
company_context: Mid-size manufacturer.
taxonomy:
  - IT|Cloud|IaaS
  - IT|Cloud|PaaS
  - Facilities|Cleaning Services
taxonomy_descriptions:
  IT|Cloud|IaaS: Raw compute, storage and network capacity.
";

    #[test]
    fn parses_paths_context_and_descriptions() {
        let t = parse_taxonomy(SAMPLE).unwrap();
        assert_eq!(t.paths.len(), 3);
        assert_eq!(t.client_name, "Acme Corp");
        assert!(t.description("IT|Cloud|IaaS").unwrap().contains("compute"));
    }

    #[test]
    fn duplicate_paths_collapse_case_insensitively() {
        let t = parse_taxonomy(
            "taxonomy:\n  - IT|Cloud\n  - it|cloud\n  - '  IT|Cloud  '\n",
        )
        .unwrap();
        assert_eq!(t.paths, ["IT|Cloud"]);
    }

    #[test]
    fn empty_taxonomy_is_an_error() {
        assert!(matches!(
            parse_taxonomy("taxonomy: []\n"),
            Err(ClassifyError::Taxonomy(_))
        ));
    }

    #[test]
    fn similar_paths_ranks_closest_first() {
        let t = parse_taxonomy(SAMPLE).unwrap();
        let suggestions = similar_paths(&t, "it|cloud|infrastructure", 2);
        assert!(!suggestions.is_empty());
        assert!(suggestions[0].starts_with("IT|Cloud"));
    }

    #[test]
    fn similar_paths_empty_for_nonsense() {
        let t = parse_taxonomy(SAMPLE).unwrap();
        assert!(similar_paths(&t, "zz qq", 3).is_empty());
    }
}

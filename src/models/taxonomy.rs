use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A client spend taxonomy: the full set of valid pipe-delimited paths plus
/// optional per-path descriptions and client context used in prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Taxonomy {
    pub paths: Vec<String>,
    pub descriptions: HashMap<String, String>,
    pub client_name: String,
    pub company_context: String,
}

impl Taxonomy {
    /// Case-insensitive membership check; returns the canonical path.
    pub fn canonical(&self, path: &str) -> Option<&str> {
        let wanted = path.trim().to_lowercase();
        self.paths
            .iter()
            .find(|p| p.to_lowercase() == wanted)
            .map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.canonical(path).is_some()
    }

    pub fn description(&self, path: &str) -> Option<&str> {
        self.descriptions.get(path).map(String::as_str)
    }

    /// Top-level category of a path.
    pub fn l1_of(path: &str) -> &str {
        path.split('|').next().unwrap_or(path).trim()
    }

    /// Deeper paths under the given top-level category.
    pub fn paths_under_l1<'a>(&'a self, l1: &str) -> Vec<&'a str> {
        let wanted = l1.trim().to_lowercase();
        self.paths
            .iter()
            .filter(|p| Self::l1_of(p).to_lowercase() == wanted && p.contains('|'))
            .map(String::as_str)
            .collect()
    }
}

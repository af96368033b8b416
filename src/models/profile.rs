use serde::{Deserialize, Serialize};

/// Read-only supplier context produced by the research collaborator and
/// cached per run. Everything here is advisory prompt material; the engine
/// never branches on profile contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupplierProfile {
    pub supplier_name: String,
    pub description: String,
    pub industry: String,
    pub products_services: String,
    pub website: String,
    /// Where the profile came from: "research", "cache", or "default".
    pub source: String,
}

impl SupplierProfile {
    /// Name-only profile used when research is unavailable or failed.
    pub fn unresearched(supplier_name: &str) -> Self {
        Self {
            supplier_name: supplier_name.to_string(),
            description: String::new(),
            industry: "Unknown".to_string(),
            products_services: String::new(),
            website: String::new(),
            source: "default".to_string(),
        }
    }

    /// True when the profile carries more than the bare supplier name.
    pub fn is_researched(&self) -> bool {
        self.source != "default"
    }
}

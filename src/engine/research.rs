//! Supplier research seam.
//!
//! Research (web lookup, canonicalization, enrichment) is a collaborator
//! the engine calls through a trait; the engine itself only guarantees the
//! call happens at most once per supplier per run (see `engine::cache`).

use crate::engine::ClassifyError;
use crate::models::SupplierProfile;

pub trait SupplierResearcher: Send + Sync {
    fn research(&self, supplier_name: &str) -> Result<SupplierProfile, ClassifyError>;
}

/// Default collaborator: no research, name-only profile.
pub struct NoResearch;

impl SupplierResearcher for NoResearch {
    fn research(&self, supplier_name: &str) -> Result<SupplierProfile, ClassifyError> {
        Ok(SupplierProfile::unresearched(supplier_name))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts research calls; used to assert the single-flight guarantee.
    pub struct CountingResearcher {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl CountingResearcher {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    impl SupplierResearcher for CountingResearcher {
        fn research(&self, supplier_name: &str) -> Result<SupplierProfile, ClassifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ClassifyError::Research {
                    supplier: supplier_name.to_string(),
                    reason: "simulated outage".to_string(),
                });
            }
            Ok(SupplierProfile {
                supplier_name: supplier_name.to_string(),
                description: format!("{supplier_name} researched profile"),
                industry: "Technology".to_string(),
                products_services: "Cloud services".to_string(),
                website: String::new(),
                source: "research".to_string(),
            })
        }
    }
}

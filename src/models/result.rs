use serde::{Deserialize, Serialize};

use crate::config::UNKNOWN_CATEGORY;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Resolved taxonomy levels for one row. Unused depth is the empty string,
/// never null, so downstream exports stay rectangular.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub l1: String,
    pub l2: String,
    pub l3: String,
    pub l4: String,
    pub l5: String,
    /// Rule id tag, `"cache"`, or empty when the LLM decided.
    pub override_rule_applied: String,
    pub reasoning: String,
    pub confidence: Confidence,
}

impl Classification {
    /// Split a pipe-delimited path into levels. Depth beyond five is
    /// folded into L5 rather than dropped.
    pub fn from_path(path: &str, confidence: Confidence) -> Self {
        let mut parts: Vec<&str> = path.split('|').map(str::trim).collect();
        if parts.len() > 5 {
            let tail = parts.split_off(4).join("|");
            parts.push("");
            let mut c = Self::levels(&parts);
            c.l5 = tail;
            c.confidence = confidence;
            return c;
        }
        let mut c = Self::levels(&parts);
        c.confidence = confidence;
        c
    }

    fn levels(parts: &[&str]) -> Self {
        let level = |i: usize| parts.get(i).copied().unwrap_or("").to_string();
        Self {
            l1: level(0),
            l2: level(1),
            l3: level(2),
            l4: level(3),
            l5: level(4),
            override_rule_applied: String::new(),
            reasoning: String::new(),
            confidence: Confidence::Medium,
        }
    }

    pub fn unknown() -> Self {
        Self::from_path(UNKNOWN_CATEGORY, Confidence::Low)
    }

    /// Rebuild the pipe-delimited path, trailing empties trimmed.
    pub fn path(&self) -> String {
        let levels = [&self.l1, &self.l2, &self.l3, &self.l4, &self.l5];
        let depth = levels.iter().rposition(|l| !l.is_empty()).map_or(0, |i| i + 1);
        levels[..depth]
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// One output row, in one-to-one positional correspondence with the input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputRow {
    pub row_index: usize,
    pub classification: Classification,
    /// Empty on success; machine-readable code plus detail on failure.
    pub error: String,
}

impl OutputRow {
    pub fn ok(row_index: usize, classification: Classification) -> Self {
        Self {
            row_index,
            classification,
            error: String::new(),
        }
    }

    pub fn failed(row_index: usize, error: impl Into<String>) -> Self {
        Self {
            row_index,
            classification: Classification::unknown(),
            error: error.into(),
        }
    }
}

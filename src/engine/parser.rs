//! LLM response parsing for batch classification.
//!
//! The response contract allows either a bare taxonomy path (applies to
//! every row in the batch) or a JSON array with one path per row. Models
//! drift from the contract in predictable ways, so parsing is an ordered
//! chain: bare path, strict JSON, a regex-recovered bracket block, then a
//! short separator-free token that may be a top-level category. Anything
//! still unparseable becomes the caller-supplied fallback path.

use regex::Regex;
use std::sync::OnceLock;

const RAW_PREFIX_CHARS: usize = 200;
const MAX_BARE_SEGMENT_CHARS: usize = 64;
const MAX_BARE_SEGMENT_WORDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseIssueKind {
    /// Array parsed but held fewer paths than rows; tail padded.
    PartialResponse,
    /// Array parsed but held more paths than rows; tail dropped.
    ResponseTooLong,
    /// Strict JSON failed, bracket block recovered by regex.
    RecoveredFromMalformedJson,
    /// Nothing usable; every row got the fallback path.
    ParseFailed,
}

#[derive(Debug, Clone)]
pub struct ParseIssue {
    pub kind: ParseIssueKind,
    /// First ~200 chars of the raw response, for fallback logging.
    pub raw_prefix: String,
}

#[derive(Debug, Clone)]
pub struct ParseReport {
    /// Exactly one path per expected row, in row order.
    pub paths: Vec<String>,
    pub issue: Option<ParseIssue>,
}

fn bracket_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]").expect("static regex"))
}

fn raw_prefix(response: &str) -> String {
    response.chars().take(RAW_PREFIX_CHARS).collect()
}

/// Strip a markdown code fence if the whole response is wrapped in one.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn clean_path(path: &str) -> String {
    path.trim().trim_matches(['"', '\'', '`']).trim().to_string()
}

/// A short single-line answer with no separator: a depth-1 path, a bare
/// top-level category, or an `Unknown`. Taxonomy validation downstream
/// expands or rejects it; sentence-like refusals stay out.
fn looks_like_bare_segment(body: &str) -> bool {
    !body.is_empty()
        && !body.contains('\n')
        && !body.starts_with('[')
        && body.len() <= MAX_BARE_SEGMENT_CHARS
        && body.split_whitespace().count() <= MAX_BARE_SEGMENT_WORDS
        && !body.ends_with(['.', '!', '?'])
}

/// Parse a classification response into exactly `expected` paths.
///
/// `fallback` fills rows the response failed to cover; validation against
/// the taxonomy happens downstream.
pub fn parse_batch_response(response: &str, expected: usize, fallback: &str) -> ParseReport {
    let body = strip_fence(response);

    // Bare single path: applies to every row in the batch.
    if body.contains('|') && !body.starts_with('[') && !body.contains('\n') {
        return ParseReport {
            paths: vec![clean_path(body); expected],
            issue: None,
        };
    }

    if let Ok(paths) = serde_json::from_str::<Vec<String>>(body) {
        return sized(paths, expected, fallback, response, None);
    }

    if let Some(captures) = bracket_block_re().captures(body) {
        let block = &captures[1];
        let paths: Vec<String> = match serde_json::from_str::<Vec<String>>(&format!("[{block}]")) {
            Ok(paths) => paths,
            Err(_) => block.split(',').map(clean_path).collect(),
        };
        let paths: Vec<String> = paths
            .into_iter()
            .map(|p| clean_path(&p))
            .filter(|p| !p.is_empty())
            .collect();
        if !paths.is_empty() {
            return sized(
                paths,
                expected,
                fallback,
                response,
                Some(ParseIssueKind::RecoveredFromMalformedJson),
            );
        }
    }

    // Last resort: a multi-line bare path answer.
    if let Some(line) = body.lines().map(str::trim).find(|l| l.contains('|')) {
        return ParseReport {
            paths: vec![clean_path(line); expected],
            issue: None,
        };
    }

    if looks_like_bare_segment(body) {
        return ParseReport {
            paths: vec![clean_path(body); expected],
            issue: None,
        };
    }

    ParseReport {
        paths: vec![fallback.to_string(); expected],
        issue: Some(ParseIssue {
            kind: ParseIssueKind::ParseFailed,
            raw_prefix: raw_prefix(response),
        }),
    }
}

fn sized(
    mut paths: Vec<String>,
    expected: usize,
    fallback: &str,
    response: &str,
    recovered: Option<ParseIssueKind>,
) -> ParseReport {
    paths = paths.into_iter().map(|p| clean_path(&p)).collect();
    let issue = if paths.len() < expected {
        paths.resize(expected, fallback.to_string());
        Some(ParseIssueKind::PartialResponse)
    } else if paths.len() > expected {
        paths.truncate(expected);
        Some(ParseIssueKind::ResponseTooLong)
    } else {
        recovered
    };
    ParseReport {
        paths,
        issue: issue.map(|kind| ParseIssue {
            kind,
            raw_prefix: raw_prefix(response),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_path_applies_to_every_row() {
        let report = parse_batch_response("IT|Cloud|IaaS", 3, "Unknown");
        assert_eq!(report.paths, vec!["IT|Cloud|IaaS"; 3]);
        assert!(report.issue.is_none());
    }

    #[test]
    fn bare_path_and_equivalent_array_agree() {
        let single = parse_batch_response("IT|Cloud|IaaS", 3, "Unknown");
        let array = parse_batch_response(
            r#"["IT|Cloud|IaaS", "IT|Cloud|IaaS", "IT|Cloud|IaaS"]"#,
            3,
            "Unknown",
        );
        assert_eq!(single.paths, array.paths);
    }

    #[test]
    fn json_array_maps_one_path_per_row() {
        let report =
            parse_batch_response(r#"["A|B", "C|D"]"#, 2, "Unknown");
        assert_eq!(report.paths, ["A|B", "C|D"]);
        assert!(report.issue.is_none());
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let report =
            parse_batch_response("```json\n[\"A|B\", \"C|D\"]\n```", 2, "Unknown");
        assert_eq!(report.paths, ["A|B", "C|D"]);
    }

    #[test]
    fn short_array_pads_with_fallback() {
        let report = parse_batch_response(r#"["A|B"]"#, 3, "X|Y");
        assert_eq!(report.paths, ["A|B", "X|Y", "X|Y"]);
        assert_eq!(report.issue.unwrap().kind, ParseIssueKind::PartialResponse);
    }

    #[test]
    fn long_array_truncates_preserving_order() {
        let report = parse_batch_response(r#"["A|B", "C|D", "E|F"]"#, 2, "Unknown");
        assert_eq!(report.paths, ["A|B", "C|D"]);
        assert_eq!(report.issue.unwrap().kind, ParseIssueKind::ResponseTooLong);
    }

    #[test]
    fn regex_recovers_chatty_malformed_array() {
        let response = "Sure! Here are the classifications:\n['A|B', 'C|D']\nHope that helps.";
        let report = parse_batch_response(response, 2, "Unknown");
        assert_eq!(report.paths, ["A|B", "C|D"]);
        assert_eq!(
            report.issue.unwrap().kind,
            ParseIssueKind::RecoveredFromMalformedJson
        );
    }

    #[test]
    fn separator_free_answer_survives_for_downstream_validation() {
        let report = parse_batch_response("IT", 1, "Unknown");
        assert_eq!(report.paths, ["IT"]);
        assert!(report.issue.is_none());

        let report = parse_batch_response("Facilities", 2, "X|Y");
        assert_eq!(report.paths, vec!["Facilities"; 2]);
        assert!(report.issue.is_none());
    }

    #[test]
    fn garbage_falls_back_entirely() {
        let report = parse_batch_response("I cannot classify these.", 2, "X|Y");
        assert_eq!(report.paths, ["X|Y", "X|Y"]);
        let issue = report.issue.unwrap();
        assert_eq!(issue.kind, ParseIssueKind::ParseFailed);
        assert!(issue.raw_prefix.starts_with("I cannot"));
    }

    #[test]
    fn raw_prefix_is_bounded() {
        let response = "z".repeat(1000);
        let report = parse_batch_response(&response, 1, "Unknown");
        assert_eq!(report.issue.unwrap().raw_prefix.len(), 200);
    }

    #[test]
    fn quoted_single_path_is_cleaned() {
        let report = parse_batch_response("\"IT|Cloud\"", 1, "Unknown");
        assert_eq!(report.paths, ["IT|Cloud"]);
    }
}

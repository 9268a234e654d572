use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use url::form_urlencoded;

use crate::config::SafetyConfig;

static SQL_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(SELECT|INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE|REPLACE|UNION|JOIN|WHERE|HAVING|GROUP\s+BY|ORDER\s+BY|OR\s+1=1|AND\s+1=1)\b",
    )
    .unwrap_or_else(|e| panic!("invalid SQL keyword pattern: {e}"))
});

static STACKED_QUERY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i);\s*(SELECT|INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE)\b")
        .unwrap_or_else(|e| panic!("invalid stacked query pattern: {e}"))
});

// The closing quote is optional: `' OR '1'='1` leans on the quote the
// surrounding query supplies.
static TAUTOLOGY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)('\s*OR\s*'[\s\w]*'='[\s\w]*'?|"\s*OR\s*"[\s\w]*"="[\s\w]*"?)"#)
        .unwrap_or_else(|e| panic!("invalid tautology pattern: {e}"))
});

/// Values shorter than this are never inspected.
const MIN_INSPECTED_LEN: usize = 3;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Outcome of scanning one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    /// `source` names where the offending value was found.
    Reject { source: &'static str },
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admit)
    }
}

/// Heuristic SQL injection check on a single untrusted value.
pub fn is_sql_injection(value: &str) -> bool {
    if value.len() < MIN_INSPECTED_LEN {
        return false;
    }

    let has_delimiter = value.contains(['\'', '"', ';']);
    if has_delimiter && SQL_KEYWORD.is_match(value) {
        return true;
    }

    STACKED_QUERY.is_match(value) || TAUTOLOGY.is_match(value)
}

/// Depth-first walk over every string leaf of a JSON document.
pub fn scan_json(value: &Value) -> bool {
    match value {
        Value::String(s) => is_sql_injection(s),
        Value::Array(items) => items.iter().any(scan_json),
        Value::Object(map) => map.values().any(scan_json),
        _ => false,
    }
}

/// Check every value of a url-encoded query string or form body.
pub fn scan_pairs(encoded: &[u8]) -> bool {
    form_urlencoded::parse(encoded).any(|(_, value)| is_sql_injection(&value))
}

/// True for `application/x-www-form-urlencoded`, parameters ignored.
pub fn is_form_content_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        ct.split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
    })
}

/// Scan the query string, then a form body or a JSON body.
///
/// A body that is neither a form nor valid JSON is not inspected.
pub fn scan_request(query: Option<&str>, content_type: Option<&str>, body: &[u8]) -> Verdict {
    if query.is_some_and(|q| scan_pairs(q.as_bytes())) {
        return Verdict::Reject { source: "query" };
    }

    if body.is_empty() {
        return Verdict::Admit;
    }

    if is_form_content_type(content_type) && scan_pairs(body) {
        return Verdict::Reject { source: "form" };
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(json) if scan_json(&json) => Verdict::Reject { source: "json" },
        _ => Verdict::Admit,
    }
}

/// Path scoping for the safety filter.
#[derive(Debug, Clone, Default)]
pub struct SafeCheckConfig {
    /// When non-empty, only paths under one of these prefixes are scanned.
    pub allowed_path_prefixes: Vec<String>,
    pub skipped_path_prefixes: Vec<String>,
}

impl SafeCheckConfig {
    pub fn applies_to(&self, path: &str) -> bool {
        let allowed = self.allowed_path_prefixes.is_empty()
            || self
                .allowed_path_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()));
        let skipped = self
            .skipped_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()));

        allowed && !skipped
    }
}

impl From<&SafetyConfig> for SafeCheckConfig {
    fn from(config: &SafetyConfig) -> Self {
        Self {
            allowed_path_prefixes: config.allowed_path_prefixes.clone(),
            skipped_path_prefixes: config.skipped_path_prefixes.clone(),
        }
    }
}

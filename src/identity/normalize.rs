//! Spec normalization used when the hashing tool is unavailable
//!
//! Two representations are derived from a spec text:
//! - structural: the YAML document with volatile directives stripped,
//!   rendered as canonical JSON (sorted keys)
//! - text: every line trimmed, inner whitespace collapsed, blank lines dropped
//!
//! Both are stored as SHA256 fingerprints to keep memoized entries small.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Comparison form of one spec text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSpec {
    /// Fingerprint of the canonical structure, `None` if the text is not
    /// a YAML mapping or sequence
    pub structural: Option<String>,
    /// Fingerprint of the whitespace-normalized text
    pub text: String,
}

impl NormalizedSpec {
    /// Compare structurally when both sides have a structure, else textually
    pub fn equivalent(&self, other: &Self) -> bool {
        match (&self.structural, &other.structural) {
            (Some(a), Some(b)) => a == b,
            _ => self.text == other.text,
        }
    }
}

/// Normalize a spec text, dropping list items that start with any of
/// `volatile_prefixes`
pub fn normalize(text: &str, volatile_prefixes: &[String]) -> NormalizedSpec {
    NormalizedSpec {
        structural: canonical_structure(text, volatile_prefixes).map(|s| fingerprint(&s)),
        text: fingerprint(&collapse_whitespace(text)),
    }
}

/// Trim lines, collapse whitespace runs and drop empty lines
pub fn collapse_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Canonical JSON of the YAML document with volatile directives removed
pub fn canonical_structure(text: &str, volatile_prefixes: &[String]) -> Option<String> {
    let mut value: Value = serde_yaml::from_str(text).ok()?;
    if !matches!(value, Value::Object(_) | Value::Array(_)) {
        return None;
    }
    strip_volatile(&mut value, volatile_prefixes);
    serde_json::to_string(&value).ok()
}

fn strip_volatile(value: &mut Value, prefixes: &[String]) {
    match value {
        Value::Array(items) => {
            items.retain(|item| !is_volatile(item, prefixes));
            for item in items.iter_mut() {
                strip_volatile(item, prefixes);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                strip_volatile(item, prefixes);
            }
        }
        _ => {}
    }
}

fn is_volatile(value: &Value, prefixes: &[String]) -> bool {
    match value {
        Value::String(s) => {
            let s = s.trim();
            prefixes.iter().any(|p| s.starts_with(p.as_str()))
        }
        _ => false,
    }
}

fn fingerprint(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

//! Download-URL extraction from result payloads
//!
//! Remote services bury artifact URLs anywhere in their result value,
//! sometimes inside JSON-encoded strings. Extraction is a depth-first walk
//! over the whole value with a seen-set for de-duplication and a depth
//! bound against pathological nesting.

use std::collections::HashSet;

use serde_json::Value;

/// Nesting depth past which values are ignored.
const MAX_DEPTH: usize = 32;

/// Collect every absolute http(s) URL from a result value, first-seen
/// order, de-duplicated. Strings that look like embedded JSON are parsed
/// and walked too.
pub fn extract_urls(value: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    let mut seen = HashSet::new();
    walk(value, 0, &mut seen, &mut urls);
    urls
}

fn walk(value: &Value, depth: usize, seen: &mut HashSet<String>, urls: &mut Vec<String>) {
    if depth > MAX_DEPTH {
        return;
    }
    match value {
        Value::String(s) => {
            if s.starts_with("http://") || s.starts_with("https://") {
                if seen.insert(s.clone()) {
                    urls.push(s.clone());
                }
            } else if s.starts_with('{') || s.starts_with('[') {
                if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                    walk(&parsed, depth + 1, seen, urls);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, depth + 1, seen, urls);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                walk(item, depth + 1, seen, urls);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

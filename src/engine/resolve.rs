//! Variable resolution -- pure templating over case values.
//!
//! Two substitution grammars are applied in sequence on strings:
//!
//! 1. `${path.to.key}` -- dotted-path lookup against environment variables.
//! 2. `$.records[i].(request|response).path` -- positional lookup into the
//!    run-local list of prior request/response pairs.
//!
//! Unresolved references are left verbatim so a single bad template never
//! aborts a run. A string that is exactly one placeholder resolves to the
//! typed value; after substitution, strings starting with `{` or `[` are
//! tentatively parsed as JSON.

use serde_json::Value;

/// Recursively resolve templates in `value`. Maps and arrays recurse,
/// strings are substituted, everything else passes through unchanged.
pub fn resolve(value: &Value, env_vars: &Value, records: &[Value]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, env_vars, records)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve(v, env_vars, records))
                .collect(),
        ),
        Value::String(s) => resolve_string(s, env_vars, records),
        other => other.clone(),
    }
}

/// Resolve a single string template to a JSON value.
pub fn resolve_string(s: &str, env_vars: &Value, records: &[Value]) -> Value {
    // A string that is exactly one placeholder keeps the looked-up type,
    // so `$.records[0].response.body.id` can yield a number.
    if let Some(v) = whole_token(s, env_vars, records) {
        return match v {
            Value::String(inner) => parse_if_structured(inner),
            typed => typed,
        };
    }

    let substituted = substitute(s, env_vars, records);
    parse_if_structured(substituted)
}

/// Walk a dotted path through objects (by key) and arrays (by index).
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn whole_token(s: &str, env_vars: &Value, records: &[Value]) -> Option<Value> {
    if let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        if !inner.contains('}') && !inner.contains("${") {
            return lookup_path(env_vars, inner).cloned();
        }
    }
    if s.starts_with(RECORDS_PREFIX) {
        let (token_len, value) = parse_records_token(s, records)?;
        if token_len == s.len() {
            return value;
        }
    }
    None
}

fn substitute(s: &str, env_vars: &Value, records: &[Value]) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while !rest.is_empty() {
        if rest.starts_with("${") {
            if let Some(close) = rest.find('}') {
                let path = &rest[2..close];
                match lookup_path(env_vars, path) {
                    Some(v) => out.push_str(&value_to_string(v)),
                    // Unresolved: keep the token verbatim.
                    None => out.push_str(&rest[..=close]),
                }
                rest = &rest[close + 1..];
                continue;
            }
        }
        if rest.starts_with(RECORDS_PREFIX) {
            if let Some((token_len, value)) = parse_records_token(rest, records) {
                match value {
                    Some(v) => out.push_str(&value_to_string(&v)),
                    None => out.push_str(&rest[..token_len]),
                }
                rest = &rest[token_len..];
                continue;
            }
        }
        let mut chars = rest.chars();
        // Unwrap is safe: rest is non-empty.
        out.push(chars.next().unwrap());
        rest = chars.as_str();
    }

    out
}

const RECORDS_PREFIX: &str = "$.records[";

/// Parse a `$.records[i].path` token at the start of `s`.
///
/// Returns the token length and the looked-up value (`None` when the
/// index or path does not resolve, in which case the caller keeps the
/// token verbatim). Returns `None` outright when `s` is not a
/// syntactically valid records token.
fn parse_records_token(s: &str, records: &[Value]) -> Option<(usize, Option<Value>)> {
    let after_bracket = &s[RECORDS_PREFIX.len()..];
    let close = after_bracket.find(']')?;
    let index: usize = after_bracket[..close].parse().ok()?;

    let after_index = &after_bracket[close + 1..];
    let path_start = after_index.strip_prefix('.')?;

    // Path segments: alphanumerics, '_', '-', joined by '.'.
    let mut path_len = 0;
    for c in path_start.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
            path_len += c.len_utf8();
        } else {
            break;
        }
    }
    let path = path_start[..path_len].trim_end_matches('.');
    if path.is_empty() {
        return None;
    }

    let token_len = RECORDS_PREFIX.len() + close + 2 + path.len();
    let value = records
        .get(index)
        .and_then(|record| lookup_path(record, path))
        .cloned();
    Some((token_len, value))
}

/// Render a value the way it should appear inside a larger string:
/// strings raw, everything else as compact JSON.
pub(crate) fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn parse_if_structured(s: String) -> Value {
    let trimmed = s.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(&s) {
            return parsed;
        }
    }
    Value::String(s)
}

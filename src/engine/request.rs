//! Request builder and HTTP executor.
//!
//! Builds a concrete request from an interface, an environment, and a
//! case's overrides (all templated values resolved first), then issues
//! it with a fixed timeout. Every response status code is accepted so
//! the judging step runs uniformly for both branches.

use super::resolve::{self, value_to_string};
use super::EngineError;
use crate::model::{Case, Environment, Interface, RequestRecord, ResponseRecord};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default Content-Type, lowest merge priority.
const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Build the shared HTTP client with the configured per-request timeout.
pub fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// A fully resolved request, ready to send and to record on the case result.
#[derive(Debug, Clone)]
pub struct BuiltRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: serde_json::Map<String, Value>,
    pub body: Option<Value>,
}

impl BuiltRequest {
    pub fn to_record(&self) -> RequestRecord {
        RequestRecord {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            query: self.query.clone(),
        }
    }
}

/// Resolve templates and assemble the request for one case.
pub fn build(
    interface: &Interface,
    environment: &Environment,
    case: &Case,
    records: &[Value],
) -> Result<BuiltRequest, EngineError> {
    if environment.base_url.trim().is_empty() {
        return Err(EngineError::NoBaseUrl);
    }
    let vars = &environment.variables;

    let path = substitute_path(&interface.path, &case.path_params, vars, records);
    let url = format!(
        "{}/{}",
        environment.base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );

    let mut query = serde_json::Map::new();
    for (key, value) in &case.query_params {
        query.insert(key.clone(), resolve::resolve(value, vars, records));
    }

    let method = interface.method.to_uppercase();
    let body = if matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
        case.body
            .as_ref()
            .or(interface.default_body.as_ref())
            .map(|b| resolve::resolve(b, vars, records))
    } else {
        None
    };

    // Merge priority: defaults < environment < case.
    let mut headers: HashMap<String, String> = HashMap::new();
    headers.insert("Content-Type".to_string(), DEFAULT_CONTENT_TYPE.to_string());
    for (k, v) in &environment.headers {
        headers.insert(k.clone(), resolve_header(v, vars, records));
    }
    for (k, v) in &case.headers {
        headers.insert(k.clone(), resolve_header(v, vars, records));
    }
    headers.retain(|name, value| {
        let keep = !(name.eq_ignore_ascii_case("authorization") && is_placeholder_auth(value));
        if !keep {
            tracing::debug!(header=%name, "stripping placeholder authorization header");
        }
        keep
    });

    Ok(BuiltRequest {
        method,
        url,
        headers,
        query,
        body,
    })
}

/// Issue the request. Network and timeout failures surface as case-level
/// errors; non-2xx statuses do not.
pub async fn execute(
    client: &reqwest::Client,
    built: &BuiltRequest,
) -> Result<ResponseRecord, EngineError> {
    let method = reqwest::Method::from_bytes(built.method.as_bytes())
        .map_err(|_| EngineError::Request(format!("invalid HTTP method '{}'", built.method)))?;

    let mut request = client.request(method, &built.url);
    for (name, value) in &built.headers {
        request = request.header(name, value);
    }
    if !built.query.is_empty() {
        let pairs: Vec<(String, String)> = built
            .query
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect();
        request = request.query(&pairs);
    }
    if let Some(body) = &built.body {
        request = request.json(body);
    }

    let start = Instant::now();
    let response = request
        .send()
        .await
        .map_err(|e| EngineError::Request(e.to_string()))?;

    let status_code = response.status().as_u16();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).to_string(),
            )
        })
        .collect();

    let text = response
        .text()
        .await
        .map_err(|e| EngineError::Request(e.to_string()))?;
    let duration_ms = start.elapsed().as_millis() as u64;

    let body = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };

    Ok(ResponseRecord {
        status_code,
        headers,
        body,
        duration_ms,
    })
}

/// Fill `{name}` and `:name` placeholders from resolved path params.
fn substitute_path(
    path: &str,
    params: &serde_json::Map<String, Value>,
    vars: &Value,
    records: &[Value],
) -> String {
    let mut out = path.to_string();
    // Longest keys first so `:id` never clobbers part of `:ident`.
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
    for key in keys {
        let resolved = resolve::resolve(&params[key.as_str()], vars, records);
        let rendered = value_to_string(&resolved);
        out = out.replace(&format!("{{{}}}", key), &rendered);
        out = out.replace(&format!(":{}", key), &rendered);
    }
    out
}

fn resolve_header(value: &str, vars: &Value, records: &[Value]) -> String {
    value_to_string(&resolve::resolve_string(value, vars, records))
}

/// Recognize unfilled Authorization template values so a placeholder
/// credential is never sent.
fn is_placeholder_auth(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("token")
        || trimmed.eq_ignore_ascii_case("bearer")
        || trimmed.eq_ignore_ascii_case("bearer token")
}

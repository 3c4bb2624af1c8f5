//! Assertion sandbox -- isolated evaluation of user-authored scripts.
//!
//! Scripts run inside a locked-down Rhai engine: no filesystem, network,
//! or module access, a bounded operation count, and a hard wall-clock
//! deadline enforced through the progress hook. The bound surface is
//! `status`, `body`, `headers`, `request`, `records`, a `log`/`console`
//! shim, and an `assert` object with `equal`, `deepEqual`, `ok`,
//! `notEqual`, and `status(expected)`.
//!
//! Every sandbox failure (assertion throw, syntax error, timeout, op
//! budget) is converted into a failed outcome; nothing propagates to the
//! orchestrator.

use crate::model::{AssertionOutcome, RequestRecord, ResponseRecord};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Position, Scope};
use serde_json::{Map as JsonMap, Number, Value};
use std::time::{Duration, Instant};

/// Reusable sandbox configuration; each evaluation builds a fresh engine
/// and scope so nothing leaks between cases or runs.
#[derive(Debug, Clone)]
pub struct Sandbox {
    timeout: Duration,
    max_operations: u64,
}

impl Sandbox {
    pub fn new(timeout: Duration, max_operations: u64) -> Self {
        Self {
            timeout,
            max_operations,
        }
    }

    /// Evaluate a script against one case's request/response. Runs on a
    /// blocking thread since Rhai evaluation is synchronous.
    pub async fn evaluate(
        &self,
        script: &str,
        response: &ResponseRecord,
        request: &RequestRecord,
        records: &[Value],
    ) -> AssertionOutcome {
        let sandbox = self.clone();
        let script = script.to_string();
        let response = response.clone();
        let request = request.clone();
        let records = records.to_vec();

        let handle = tokio::task::spawn_blocking(move || {
            sandbox.evaluate_sync(&script, &response, &request, &records)
        });
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => AssertionOutcome::failed(format!("assertion sandbox aborted: {}", e)),
        }
    }

    pub fn evaluate_sync(
        &self,
        script: &str,
        response: &ResponseRecord,
        request: &RequestRecord,
        records: &[Value],
    ) -> AssertionOutcome {
        let engine = self.build_engine();
        let mut scope = self.build_scope(response, request, records);

        match engine.eval_with_scope::<Dynamic>(&mut scope, script) {
            Ok(_) => AssertionOutcome::passed("all assertions passed"),
            Err(e) => AssertionOutcome::failed(e.to_string()),
        }
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);
        engine.set_max_call_levels(64);
        engine.set_max_expr_depths(64, 64);
        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());

        let deadline = Instant::now() + self.timeout;
        engine.on_progress(move |_| {
            if Instant::now() > deadline {
                Some("script timed out".into())
            } else {
                None
            }
        });

        engine.on_print(|msg| tracing::debug!(target: "apipulse::script", "{}", msg));
        engine.on_debug(|msg, _, _| tracing::debug!(target: "apipulse::script", "{}", msg));
        engine.register_fn("log", |msg: Dynamic| {
            tracing::debug!(target: "apipulse::script", "{}", msg);
        });

        engine.register_type_with_name::<AssertApi>("Assert");
        engine.register_fn(
            "equal",
            |_: &mut AssertApi, a: Dynamic, b: Dynamic| -> Result<(), Box<EvalAltResult>> {
                let (a, b) = (from_dynamic(a), from_dynamic(b));
                if loose_equal(&a, &b) {
                    Ok(())
                } else {
                    Err(assertion_error(format!("expected {} to equal {}", a, b)))
                }
            },
        );
        engine.register_fn(
            "deepEqual",
            |_: &mut AssertApi, a: Dynamic, b: Dynamic| -> Result<(), Box<EvalAltResult>> {
                let (a, b) = (from_dynamic(a), from_dynamic(b));
                if a == b {
                    Ok(())
                } else {
                    Err(assertion_error(format!(
                        "expected {} to deeply equal {}",
                        a, b
                    )))
                }
            },
        );
        engine.register_fn(
            "notEqual",
            |_: &mut AssertApi, a: Dynamic, b: Dynamic| -> Result<(), Box<EvalAltResult>> {
                let (a, b) = (from_dynamic(a), from_dynamic(b));
                if a == b {
                    Err(assertion_error(format!("expected {} to not equal {}", a, b)))
                } else {
                    Ok(())
                }
            },
        );
        engine.register_fn(
            "ok",
            |_: &mut AssertApi, v: Dynamic| -> Result<(), Box<EvalAltResult>> {
                let v = from_dynamic(v);
                if truthy(&v) {
                    Ok(())
                } else {
                    Err(assertion_error(format!("expected {} to be truthy", v)))
                }
            },
        );
        engine.register_fn(
            "status",
            |api: &mut AssertApi, expected: i64| -> Result<(), Box<EvalAltResult>> {
                if api.status == expected {
                    Ok(())
                } else {
                    Err(assertion_error(format!(
                        "expected status {}, got {}",
                        expected, api.status
                    )))
                }
            },
        );

        engine.register_type_with_name::<ConsoleApi>("Console");
        engine.register_fn("log", |_: &mut ConsoleApi, msg: Dynamic| {
            tracing::debug!(target: "apipulse::script", "{}", msg);
        });

        engine
    }

    fn build_scope(
        &self,
        response: &ResponseRecord,
        request: &RequestRecord,
        records: &[Value],
    ) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push_constant("status", response.status_code as i64);
        scope.push_dynamic("body", to_dynamic(&response.body));
        scope.push_dynamic(
            "headers",
            to_dynamic(&serde_json::to_value(&response.headers).unwrap_or(Value::Null)),
        );

        let request_value = serde_json::json!({
            "body": request.body.clone().unwrap_or(Value::Null),
            "headers": request.headers,
            "query": request.query,
        });
        scope.push_dynamic("request", to_dynamic(&request_value));
        scope.push_dynamic("records", to_dynamic(&Value::Array(records.to_vec())));

        // Plain variables, not constants: method calls take `&mut self`
        // and Rhai rejects mutating method calls on constants.
        scope.push(
            "assert",
            AssertApi {
                status: response.status_code as i64,
            },
        );
        scope.push("console", ConsoleApi);
        scope
    }
}

/// Default judging policy when no script is configured: passed iff 2xx.
pub fn default_outcome(status_code: u16) -> AssertionOutcome {
    if (200..300).contains(&status_code) {
        AssertionOutcome::passed("status in 2xx range")
    } else {
        AssertionOutcome::failed(format!("expected 2xx status, got {}", status_code))
    }
}

#[derive(Debug, Clone)]
struct AssertApi {
    status: i64,
}

#[derive(Debug, Clone)]
struct ConsoleApi;

fn assertion_error(message: String) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(message.into(), Position::NONE))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Loose equality: numeric values compare by magnitude, strings compare
/// against the rendered form of scalars ("42" equals 42).
fn loose_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    match (a, b) {
        (Value::String(s), other) | (other, Value::String(s))
            if !other.is_string() && !other.is_array() && !other.is_object() =>
        {
            *s == super::resolve::value_to_string(other)
        }
        _ => false,
    }
}

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::from(0_i64)
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let mut arr = Array::new();
            for item in items {
                arr.push(to_dynamic(item));
            }
            Dynamic::from_array(arr)
        }
        Value::Object(map) => {
            let mut rhai_map = Map::new();
            for (key, value) in map {
                rhai_map.insert(key.as_str().into(), to_dynamic(value));
            }
            Dynamic::from_map(rhai_map)
        }
    }
}

fn from_dynamic(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Value::Bool(b);
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Value::Number(Number::from(i));
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        if let Some(num) = Number::from_f64(f) {
            return Value::Number(num);
        }
    }
    if let Some(s) = value.clone().try_cast::<String>() {
        return Value::String(s);
    }
    if let Some(s) = value.clone().try_cast::<rhai::ImmutableString>() {
        return Value::String(s.to_string());
    }
    if let Some(arr) = value.clone().try_cast::<Array>() {
        return Value::Array(arr.into_iter().map(from_dynamic).collect());
    }
    if let Some(map) = value.try_cast::<Map>() {
        let mut json_map = JsonMap::new();
        for (key, value) in map {
            json_map.insert(key.to_string(), from_dynamic(value));
        }
        return Value::Object(json_map);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn sandbox() -> Sandbox {
        Sandbox::new(Duration::from_millis(500), 100_000)
    }

    fn response(status: u16, body: Value) -> ResponseRecord {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        ResponseRecord {
            status_code: status,
            headers,
            body,
            duration_ms: 3,
        }
    }

    fn request() -> RequestRecord {
        RequestRecord {
            method: "GET".into(),
            url: "https://api.test/users".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_status_assertion_passes() {
        let outcome = sandbox()
            .evaluate("assert.status(200)", &response(200, json!({})), &request(), &[])
            .await;
        assert!(outcome.passed);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_status_assertion_fails_on_404() {
        let outcome = sandbox()
            .evaluate("assert.status(200)", &response(404, json!({})), &request(), &[])
            .await;
        assert!(!outcome.passed);
        assert!(!outcome.errors.is_empty());
        assert!(outcome.message.contains("404"));
    }

    #[tokio::test]
    async fn test_body_field_access() {
        let outcome = sandbox()
            .evaluate(
                "assert.equal(body.id, 42)",
                &response(200, json!({ "id": 42 })),
                &request(),
                &[],
            )
            .await;
        assert!(outcome.passed, "{}", outcome.message);
    }

    #[tokio::test]
    async fn test_equal_is_loose_across_numeric_types() {
        let outcome = sandbox()
            .evaluate(
                "assert.equal(body.price, 42)",
                &response(200, json!({ "price": 42.0 })),
                &request(),
                &[],
            )
            .await;
        assert!(outcome.passed, "{}", outcome.message);
    }

    #[tokio::test]
    async fn test_deep_equal_on_objects() {
        let outcome = sandbox()
            .evaluate(
                r#"assert.deepEqual(body.user, #{ "name": "ada", "id": 1 })"#,
                &response(200, json!({ "user": { "name": "ada", "id": 1 } })),
                &request(),
                &[],
            )
            .await;
        assert!(outcome.passed, "{}", outcome.message);
    }

    #[tokio::test]
    async fn test_not_equal_and_ok() {
        let outcome = sandbox()
            .evaluate(
                "assert.notEqual(body.id, 0); assert.ok(body.name)",
                &response(200, json!({ "id": 5, "name": "x" })),
                &request(),
                &[],
            )
            .await;
        assert!(outcome.passed, "{}", outcome.message);
    }

    #[tokio::test]
    async fn test_ok_fails_on_empty_string() {
        let outcome = sandbox()
            .evaluate(
                "assert.ok(body.name)",
                &response(200, json!({ "name": "" })),
                &request(),
                &[],
            )
            .await;
        assert!(!outcome.passed);
    }

    #[tokio::test]
    async fn test_syntax_error_becomes_failed_outcome() {
        let outcome = sandbox()
            .evaluate("this is not rhai ((", &response(200, json!({})), &request(), &[])
            .await;
        assert!(!outcome.passed);
        assert!(!outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_infinite_loop_hits_budget() {
        let outcome = sandbox()
            .evaluate("loop { }", &response(200, json!({})), &request(), &[])
            .await;
        assert!(!outcome.passed);
    }

    #[tokio::test]
    async fn test_records_visible_to_script() {
        let records = vec![json!({ "response": { "body": { "id": 9 } } })];
        let outcome = sandbox()
            .evaluate(
                "assert.equal(records[0].response.body.id, 9)",
                &response(200, json!({})),
                &request(),
                &records,
            )
            .await;
        assert!(outcome.passed, "{}", outcome.message);
    }

    #[tokio::test]
    async fn test_request_bindings_visible() {
        let mut req = request();
        req.body = Some(json!({ "q": "abc" }));
        let outcome = sandbox()
            .evaluate(
                r#"assert.equal(request.body.q, "abc")"#,
                &response(200, json!({})),
                &req,
                &[],
            )
            .await;
        assert!(outcome.passed, "{}", outcome.message);
    }

    #[tokio::test]
    async fn test_log_shim_does_not_fail_script() {
        let outcome = sandbox()
            .evaluate(
                r#"log("hello"); console.log("world"); assert.ok(true)"#,
                &response(200, json!({})),
                &request(),
                &[],
            )
            .await;
        assert!(outcome.passed, "{}", outcome.message);
    }

    #[test]
    fn test_default_rule_2xx_passes() {
        assert!(default_outcome(201).passed);
        assert!(default_outcome(299).passed);
    }

    #[test]
    fn test_default_rule_rejects_others() {
        assert!(!default_outcome(199).passed);
        assert!(!default_outcome(404).passed);
        assert!(!default_outcome(500).passed);
    }
}

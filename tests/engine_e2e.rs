//! End-to-end engine tests against a local mock HTTP server.

use std::collections::HashMap;

use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use apipulse::config::Config;
use apipulse::engine::{orchestrator, EngineContext};
use apipulse::model::{Case, CaseStatus, Environment, Interface, RunStatus, Task, Trigger};
use apipulse::storage;

struct Fixture {
    _dir: tempfile::TempDir,
    ctx: EngineContext,
    project_id: Uuid,
    environment: Environment,
}

impl Fixture {
    fn new(base_url: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("e2e.db");
        let pool = storage::open_pool(db.to_str().unwrap()).unwrap();

        let config = Config {
            request_timeout_secs: 5,
            ..Config::default()
        };
        let ctx = EngineContext::new(pool, &config).unwrap();

        let project_id = Uuid::new_v4();
        let mut environment = Environment::new(project_id, "e2e", base_url);
        environment.is_default = true;
        storage::upsert_environment(&ctx.pool, &environment).unwrap();

        Self {
            _dir: dir,
            ctx,
            project_id,
            environment,
        }
    }

    fn interface(&self, name: &str, method: &str, path: &str) -> Interface {
        let interface = Interface::new(self.project_id, name, method, path);
        storage::upsert_interface(&self.ctx.pool, &interface).unwrap();
        interface
    }

    fn task(&self, cases: Vec<Case>) -> Task {
        let mut task = Task::new(self.project_id, "e2e-task");
        task.cases = cases;
        storage::upsert_task(&self.ctx.pool, &task).unwrap();
        task
    }

    async fn run(&self, task: &Task) -> apipulse::model::RunResult {
        let result_id = Uuid::new_v4();
        orchestrator::run(
            self.ctx.clone(),
            task.clone(),
            self.environment.clone(),
            result_id,
            Trigger::Manual,
            None,
        )
        .await;
        storage::get_result(&self.ctx.pool, result_id)
            .unwrap()
            .expect("result persisted")
    }
}

#[tokio::test]
async fn test_single_passing_case_default_rule() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    let fixture = Fixture::new(&server.uri());
    let iface = fixture.interface("ping", "GET", "/ping");
    let task = fixture.task(vec![Case::new(iface.id, 0)]);

    let result = fixture.run(&task).await;
    assert_eq!(result.status, RunStatus::Passed);
    assert_eq!(result.summary.total, 1);
    assert_eq!(result.summary.passed, 1);
    assert_eq!(result.cases[0].status, CaseStatus::Passed);
    assert_eq!(
        result.cases[0].response.as_ref().unwrap().status_code,
        200
    );
    assert!(result.completed_at.is_some());
}

#[tokio::test]
async fn test_default_rule_accepts_201() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let fixture = Fixture::new(&server.uri());
    let iface = fixture.interface("create-item", "POST", "/items");
    let task = fixture.task(vec![Case::new(iface.id, 0)]);

    let result = fixture.run(&task).await;
    assert_eq!(result.cases[0].status, CaseStatus::Passed);
}

#[tokio::test]
async fn test_assertion_script_failure_on_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let fixture = Fixture::new(&server.uri());
    let iface = fixture.interface("missing", "GET", "/missing");
    let mut case = Case::new(iface.id, 0);
    case.assertion_script = Some("assert.status(200)".into());
    let task = fixture.task(vec![case]);

    let result = fixture.run(&task).await;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.cases[0].status, CaseStatus::Failed);
    let assertion = result.cases[0].assertion.as_ref().unwrap();
    assert!(!assertion.passed);
    assert!(!assertion.errors.is_empty());
}

#[tokio::test]
async fn test_query_param_template_resolves_from_environment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("host", "example.com"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut fixture = Fixture::new(&server.uri());
    fixture.environment.variables = json!({ "host": "example.com" });
    storage::upsert_environment(&fixture.ctx.pool, &fixture.environment).unwrap();

    let iface = fixture.interface("search", "GET", "/search");
    let mut case = Case::new(iface.id, 0);
    case.query_params.insert("host".into(), json!("${host}"));
    let task = fixture.task(vec![case]);

    let result = fixture.run(&task).await;
    // The mock only matches when the query resolved to "example.com".
    assert_eq!(result.cases[0].status, CaseStatus::Passed);
}

#[tokio::test]
async fn test_cross_case_records_reference() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 42 })))
        .mount(&server)
        .await;
    // Second case must send exactly the number 42 as its body and hit
    // the path built from the recorded id.
    Mock::given(method("POST"))
        .and(path("/users/42/echo"))
        .and(body_json(json!(42)))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fixture = Fixture::new(&server.uri());
    let create = fixture.interface("create-user", "POST", "/users");
    let echo = fixture.interface("echo", "POST", "/users/{id}/echo");

    let first = Case::new(create.id, 0);
    let mut second = Case::new(echo.id, 1);
    second
        .path_params
        .insert("id".into(), json!("$.records[0].response.body.id"));
    second.body = Some(json!("$.records[0].response.body.id"));
    let task = fixture.task(vec![first, second]);

    let result = fixture.run(&task).await;
    assert_eq!(result.cases[1].status, CaseStatus::Passed, "{:?}", result.cases[1]);
    assert_eq!(
        result.cases[1].request.as_ref().unwrap().body,
        Some(json!(42))
    );
}

#[tokio::test]
async fn test_unreachable_host_yields_case_error() {
    // Nothing listens on port 9; connection fails fast.
    let fixture = Fixture::new("http://127.0.0.1:9");
    let iface = fixture.interface("ping", "GET", "/ping");
    let task = fixture.task(vec![Case::new(iface.id, 0)]);

    let result = fixture.run(&task).await;
    assert!(matches!(
        result.status,
        RunStatus::Failed | RunStatus::Error
    ));
    assert!(result.summary.error >= 1);
    assert_eq!(result.cases.len(), 1);
    let error = result.cases[0].error.as_ref().unwrap();
    assert!(!error.message.is_empty());
    assert_eq!(error.code, "REQUEST_ERROR");
    // The request was built before the send failed, so its record is
    // kept alongside the error details.
    let request = result.cases[0].request.as_ref().unwrap();
    assert_eq!(request.method, "GET");
    assert_eq!(request.url, "http://127.0.0.1:9/ping");
}

#[tokio::test]
async fn test_unresolved_interface_is_case_local() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fixture = Fixture::new(&server.uri());
    let iface = fixture.interface("ping", "GET", "/ping");

    // First case references an interface that was never stored.
    let ghost = Case::new(Uuid::new_v4(), 0);
    let real = Case::new(iface.id, 1);
    let task = fixture.task(vec![ghost, real]);

    let result = fixture.run(&task).await;
    assert_eq!(result.cases[0].status, CaseStatus::Error);
    assert_eq!(
        result.cases[0].error.as_ref().unwrap().code,
        "INTERFACE_NOT_FOUND"
    );
    // The run continued past the broken case.
    assert_eq!(result.cases[1].status, CaseStatus::Passed);
    assert_eq!(result.summary.error, 1);
    assert_eq!(result.summary.passed, 1);
}

#[tokio::test]
async fn test_missing_base_url_yields_case_error() {
    let fixture = Fixture::new("");
    let iface = fixture.interface("ping", "GET", "/ping");
    let task = fixture.task(vec![Case::new(iface.id, 0)]);

    let result = fixture.run(&task).await;
    assert_eq!(result.cases[0].status, CaseStatus::Error);
    assert_eq!(result.cases[0].error.as_ref().unwrap().code, "NO_BASE_URL");
}

#[tokio::test]
async fn test_cases_execute_in_ascending_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fixture = Fixture::new(&server.uri());
    let a = fixture.interface("a", "GET", "/a");
    let b = fixture.interface("b", "GET", "/b");
    let c = fixture.interface("c", "GET", "/c");

    // Declared out of order on purpose.
    let task = fixture.task(vec![
        Case::new(c.id, 30),
        Case::new(a.id, 10),
        Case::new(b.id, 20),
    ]);

    let result = fixture.run(&task).await;
    let orders: Vec<i64> = result.cases.iter().map(|c| c.order).collect();
    assert_eq!(orders, vec![10, 20, 30]);
    let names: Vec<&str> = result
        .cases
        .iter()
        .map(|c| c.interface_name.as_str())
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    // started_at is monotonically non-decreasing down the list.
    assert!(result
        .cases
        .windows(2)
        .all(|w| w[0].started_at <= w[1].started_at));
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fixture = Fixture::new(&server.uri());
    let iface = fixture.interface("ping", "GET", "/ping");
    let task = fixture.task(vec![Case::new(iface.id, 0), Case::new(iface.id, 1)]);

    let id_a = Uuid::new_v4();
    let id_b = Uuid::new_v4();
    let run_a = orchestrator::run(
        fixture.ctx.clone(),
        task.clone(),
        fixture.environment.clone(),
        id_a,
        Trigger::Manual,
        None,
    );
    let run_b = orchestrator::run(
        fixture.ctx.clone(),
        task.clone(),
        fixture.environment.clone(),
        id_b,
        Trigger::Schedule,
        None,
    );
    tokio::join!(run_a, run_b);

    for id in [id_a, id_b] {
        let result = storage::get_result(&fixture.ctx.pool, id).unwrap().unwrap();
        assert_eq!(result.summary.total, 2);
        assert_eq!(
            result.summary.passed
                + result.summary.failed
                + result.summary.error
                + result.summary.skipped,
            result.summary.total
        );
        assert!(result.cases.iter().all(|c| c.status.is_terminal()));
    }

    let (all, total) = storage::list_results(&fixture.ctx.pool, task.id, 1, 10).unwrap();
    assert_eq!(total, 2);
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_summary_total_fixed_at_creation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fixture = Fixture::new(&server.uri());
    let iface = fixture.interface("ping", "GET", "/ping");
    let mut disabled = Case::new(iface.id, 1);
    disabled.enabled = false;
    let task = fixture.task(vec![Case::new(iface.id, 0), disabled]);

    let result = fixture.run(&task).await;
    // Only the enabled case is counted or traced.
    assert_eq!(result.summary.total, 1);
    assert_eq!(result.cases.len(), 1);
}

#[tokio::test]
async fn test_interface_lookup_built_once_for_duplicate_refs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fixture = Fixture::new(&server.uri());
    let iface = fixture.interface("ping", "GET", "/ping");
    let task = fixture.task(vec![
        Case::new(iface.id, 0),
        Case::new(iface.id, 1),
        Case::new(iface.id, 2),
    ]);

    let result = fixture.run(&task).await;
    assert_eq!(result.summary.passed, 3);
    let interfaces: HashMap<Uuid, usize> =
        result
            .cases
            .iter()
            .fold(HashMap::new(), |mut acc, case| {
                *acc.entry(case.interface_id).or_default() += 1;
                acc
            });
    assert_eq!(interfaces[&iface.id], 3);
}

//! Test execution engine -- orchestrator, resolver, request builder,
//! assertion sandbox.
//!
//! All per-run state (the records list, the result document) is threaded
//! as values through the run, never held on shared engine state, so
//! concurrent runs are independent by construction.

pub mod orchestrator;
pub mod request;
pub mod resolve;
pub mod sandbox;

use crate::model::{Environment, RequestRecord, ResponseRecord, Task, Trigger};
use crate::storage::{self, Pool};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// Case-local failures. Each maps to a stable code persisted on the
/// case result; none of them aborts the surrounding run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("interface {0} not found")]
    InterfaceNotFound(Uuid),
    #[error("environment has no base URL")]
    NoBaseUrl,
    #[error("request failed: {0}")]
    Request(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InterfaceNotFound(_) => "INTERFACE_NOT_FOUND",
            EngineError::NoBaseUrl => "NO_BASE_URL",
            EngineError::Request(_) => "REQUEST_ERROR",
        }
    }
}

/// Shared immutable handles a run executes with.
#[derive(Clone)]
pub struct EngineContext {
    pub pool: Pool,
    pub client: reqwest::Client,
    pub sandbox: sandbox::Sandbox,
}

impl EngineContext {
    pub fn new(pool: Pool, config: &crate::config::Config) -> Result<Self> {
        Ok(Self {
            pool,
            client: request::http_client(config.request_timeout())?,
            sandbox: sandbox::Sandbox::new(config.script_timeout(), config.script_max_ops),
        })
    }
}

/// Shape of one entry in the run-local records list, shared between the
/// resolver (`$.records[i].request.body...`) and the sandbox `records`
/// binding.
pub fn record_entry(request: &RequestRecord, response: &ResponseRecord) -> Value {
    json!({
        "request": {
            "body": request.body.clone().unwrap_or(Value::Null),
            "headers": request.headers,
            "query": request.query,
        },
        "response": {
            "status": response.status_code,
            "body": response.body,
            "headers": response.headers,
        }
    })
}

/// Load the task and its target environment, applying the project
/// default environment fallback.
pub fn load_run_inputs(ctx: &EngineContext, task_id: Uuid) -> Result<(Task, Environment)> {
    let task = storage::get_task(&ctx.pool, task_id)?
        .with_context(|| format!("task {} not found", task_id))?;
    if !task.enabled {
        anyhow::bail!("task {} is disabled", task_id);
    }

    let environment = match task.environment_id {
        Some(env_id) => storage::get_environment(&ctx.pool, env_id)?
            .with_context(|| format!("environment {} not found", env_id))?,
        None => storage::default_environment(&ctx.pool, task.project_id)?
            .with_context(|| format!("project {} has no default environment", task.project_id))?,
    };
    Ok((task, environment))
}

/// Load a task and its environment, then start a run in the background.
/// Returns the result id immediately; completion is asynchronous.
pub async fn start_run(
    ctx: &EngineContext,
    task_id: Uuid,
    trigger: Trigger,
    user: Option<String>,
) -> Result<Uuid> {
    let (task, environment) = load_run_inputs(ctx, task_id)?;

    let result_id = Uuid::new_v4();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        orchestrator::run(ctx, task, environment, result_id, trigger, user).await;
    });

    Ok(result_id)
}

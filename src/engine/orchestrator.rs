//! Execution orchestrator -- drives one task run end to end.
//!
//! Cases execute strictly in ascending order, one at a time, because
//! later cases may reference earlier responses by position. Every
//! per-case failure is converted to that case's terminal status and the
//! loop continues; only a persistence failure outside the per-case
//! boundary aborts the run.

use super::{record_entry, request, sandbox, EngineContext, EngineError};
use crate::model::{
    CaseError, CaseStatus, Environment, Interface, RunResult, RunStatus, Task, Trigger,
};
use crate::storage;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Execute one run. The caller owns result-id uniqueness; this function
/// must not be invoked twice for the same id. All failures are absorbed
/// into the persisted result, never raised.
pub async fn run(
    ctx: EngineContext,
    task: Task,
    environment: Environment,
    result_id: Uuid,
    trigger: Trigger,
    user: Option<String>,
) {
    info!(task=%task.id, result=%result_id, trigger=%trigger, "run started");

    // Normalize interface references once, before the loop; misses are
    // reported per case, not as a run abort.
    let interfaces = load_interfaces(&ctx, &task);

    let mut result = RunResult::new(result_id, &task, environment.id, &interfaces, trigger, user);
    if let Err(e) = storage::save_result(&ctx.pool, &result) {
        error!(result=%result_id, "failed to create result: {}", e);
        return;
    }

    let enabled: Vec<_> = task.enabled_cases().into_iter().cloned().collect();
    // Run-local records list for cross-case references, threaded by value.
    let mut records: Vec<Value> = Vec::new();

    for (index, case) in enabled.iter().enumerate() {
        result.cases[index].status = CaseStatus::Running;
        result.cases[index].started_at = Some(Utc::now());
        if checkpoint_or_abort(&ctx, &mut result).await {
            return;
        }

        match execute_case(&ctx, &interfaces, case, &environment, &records).await {
            Ok(exchange) => {
                let entry = &mut result.cases[index];
                entry.request = Some(exchange.request.clone());
                let response = exchange.response;

                let outcome = match &case.assertion_script {
                    Some(script) => {
                        ctx.sandbox
                            .evaluate(script, &response, &exchange.request, &records)
                            .await
                    }
                    None => sandbox::default_outcome(response.status_code),
                };

                entry.status = if outcome.passed {
                    CaseStatus::Passed
                } else {
                    CaseStatus::Failed
                };
                records.push(record_entry(&exchange.request, &response));
                entry.response = Some(response);
                entry.assertion = Some(outcome);
            }
            Err(e) => {
                warn!(result=%result_id, case=%case.order, code=%e.code(), "case errored: {}", e);
                let CaseFailure { error, request } = e;
                let entry = &mut result.cases[index];
                entry.request = request;
                entry.status = CaseStatus::Error;
                entry.error = Some(CaseError {
                    message: error.to_string(),
                    code: error.code().to_string(),
                });
            }
        }

        let entry = &mut result.cases[index];
        let now = Utc::now();
        entry.completed_at = Some(now);
        if let Some(started) = entry.started_at {
            entry.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
        result.summary.record(result.cases[index].status);

        if checkpoint_or_abort(&ctx, &mut result).await {
            return;
        }
    }

    let status = result.summary.derive_status();
    result.finalize(status);
    if let Err(e) = storage::save_result(&ctx.pool, &result) {
        error!(result=%result_id, "failed to finalize result: {}", e);
        return;
    }

    dispatch_notifications(&task, &result);
    info!(
        result=%result_id,
        status=%result.status,
        passed=%result.summary.passed,
        failed=%result.summary.failed,
        errors=%result.summary.error,
        "run finished"
    );
}

/// Persist the current snapshot. On failure, finalize the whole result
/// as `error` with whatever partial cases exist and stop the run -- the
/// only path that aborts before processing all cases.
async fn checkpoint_or_abort(ctx: &EngineContext, result: &mut RunResult) -> bool {
    match storage::save_result(&ctx.pool, result) {
        Ok(()) => false,
        Err(e) => {
            error!(result=%result.id, "checkpoint failed, aborting run: {}", e);
            result.finalize(RunStatus::Error);
            if let Err(e) = storage::save_result(&ctx.pool, result) {
                error!(result=%result.id, "could not persist aborted result: {}", e);
            }
            true
        }
    }
}

fn load_interfaces(ctx: &EngineContext, task: &Task) -> HashMap<Uuid, Interface> {
    let mut interfaces = HashMap::new();
    for case in task.enabled_cases() {
        if interfaces.contains_key(&case.interface_id) {
            continue;
        }
        match storage::get_interface(&ctx.pool, case.interface_id) {
            Ok(Some(interface)) => {
                interfaces.insert(case.interface_id, interface);
            }
            Ok(None) => {
                warn!(task=%task.id, interface=%case.interface_id, "interface reference does not resolve");
            }
            Err(e) => {
                warn!(task=%task.id, interface=%case.interface_id, "interface lookup failed: {}", e);
            }
        }
    }
    interfaces
}

struct CaseExchange {
    request: crate::model::RequestRecord,
    response: crate::model::ResponseRecord,
}

/// A case failure, with the built request attached when the failure
/// happened after the request was assembled.
struct CaseFailure {
    error: EngineError,
    request: Option<crate::model::RequestRecord>,
}

impl From<EngineError> for CaseFailure {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            request: None,
        }
    }
}

impl CaseFailure {
    fn code(&self) -> &'static str {
        self.error.code()
    }
}

impl std::fmt::Display for CaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

async fn execute_case(
    ctx: &EngineContext,
    interfaces: &HashMap<Uuid, Interface>,
    case: &crate::model::Case,
    environment: &Environment,
    records: &[Value],
) -> Result<CaseExchange, CaseFailure> {
    let interface = interfaces
        .get(&case.interface_id)
        .ok_or(EngineError::InterfaceNotFound(case.interface_id))?;

    let built = request::build(interface, environment, case, records)?;
    let request_record = built.to_record();

    match request::execute(&ctx.client, &built).await {
        Ok(response) => Ok(CaseExchange {
            request: request_record,
            response,
        }),
        Err(error) => Err(CaseFailure {
            error,
            request: Some(request_record),
        }),
    }
}

/// Notification dispatch is an external collaborator; the engine only
/// signals intent here.
fn dispatch_notifications(task: &Task, result: &RunResult) {
    let policy = &task.notifications;
    let wants = match result.status {
        RunStatus::Passed => policy.on_success,
        RunStatus::Failed | RunStatus::Error => policy.on_failure,
        _ => false,
    };
    if wants {
        info!(
            task=%task.id,
            result=%result.id,
            status=%result.status,
            webhook=?policy.webhook_url,
            "notification requested (dispatch handled externally)"
        );
    }
}

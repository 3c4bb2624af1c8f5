use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::{Case, Interface, Task};

/// Terminal and in-flight states of a whole run.
///
/// A result starts at `Running` and transitions to exactly one terminal
/// state, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Error,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Per-case lifecycle: `pending -> running -> terminal`, one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Skipped,
}

impl CaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaseStatus::Passed | CaseStatus::Failed | CaseStatus::Error | CaseStatus::Skipped
        )
    }
}

/// What started the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Schedule,
    Webhook,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::Manual => "manual",
            Trigger::Schedule => "schedule",
            Trigger::Webhook => "webhook",
        };
        write!(f, "{}", s)
    }
}

/// Aggregate counters for one run.
///
/// `total` is fixed when the result is created and never changes; each
/// terminal case increments exactly one of the other buckets, so
/// `passed + failed + error + skipped == total` once the run finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub error: u32,
    pub skipped: u32,
}

impl Summary {
    pub fn with_total(total: u32) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Record one terminal case status. Must be called exactly once per
    /// case, after its terminal status is determined.
    pub fn record(&mut self, status: CaseStatus) {
        match status {
            CaseStatus::Passed => self.passed += 1,
            CaseStatus::Failed => self.failed += 1,
            CaseStatus::Error => self.error += 1,
            CaseStatus::Skipped => self.skipped += 1,
            CaseStatus::Pending | CaseStatus::Running => {
                // Non-terminal statuses are never aggregated.
                tracing::warn!(?status, "attempted to aggregate non-terminal case status");
            }
        }
    }

    pub fn counted(&self) -> u32 {
        self.passed + self.failed + self.error + self.skipped
    }

    /// Task-level verdict derived purely from the counters.
    pub fn derive_status(&self) -> RunStatus {
        if self.failed + self.error > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        }
    }
}

/// The request as actually built and sent for one case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub query: serde_json::Map<String, serde_json::Value>,
}

/// The response observed for one case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Parsed JSON when the body is valid JSON, raw string otherwise.
    #[serde(default)]
    pub body: serde_json::Value,
    pub duration_ms: u64,
}

/// Case-local failure details (network error, unresolved interface, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseError {
    pub message: String,
    pub code: String,
}

/// Verdict produced by the assertion sandbox or the default status rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionOutcome {
    pub passed: bool,
    pub message: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl AssertionOutcome {
    pub fn passed(message: &str) -> Self {
        Self {
            passed: true,
            message: message.to_string(),
            errors: Vec::new(),
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            passed: false,
            errors: vec![message.clone()],
            message,
        }
    }
}

/// Execution trace of one case within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub interface_id: Uuid,
    pub interface_name: String,
    pub order: i64,
    pub status: CaseStatus,
    #[serde(default)]
    pub request: Option<RequestRecord>,
    #[serde(default)]
    pub response: Option<ResponseRecord>,
    #[serde(default)]
    pub error: Option<CaseError>,
    #[serde(default)]
    pub assertion: Option<AssertionOutcome>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CaseResult {
    fn pending(case: &Case, interface_name: &str) -> Self {
        Self {
            interface_id: case.interface_id,
            interface_name: interface_name.to_string(),
            order: case.order,
            status: CaseStatus::Pending,
            request: None,
            response: None,
            error: None,
            assertion: None,
            duration_ms: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One execution record of a task: per-case trace plus aggregate summary.
///
/// Persisted after creation and re-persisted after every case, so a
/// stored result is always a valid snapshot of partial progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub environment_id: Uuid,
    pub status: RunStatus,
    pub summary: Summary,
    pub cases: Vec<CaseResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub triggered_by: Trigger,
    #[serde(default)]
    pub triggered_by_user: Option<String>,
}

impl RunResult {
    /// Snapshot the enabled cases of a task into a fresh running result,
    /// one pending entry per enabled case in ascending order.
    pub fn new(
        id: Uuid,
        task: &Task,
        environment_id: Uuid,
        interfaces: &HashMap<Uuid, Interface>,
        triggered_by: Trigger,
        triggered_by_user: Option<String>,
    ) -> Self {
        let enabled = task.enabled_cases();
        let cases: Vec<CaseResult> = enabled
            .iter()
            .map(|case| {
                let name = interfaces
                    .get(&case.interface_id)
                    .map(|i| i.name.as_str())
                    .unwrap_or("(unresolved interface)");
                CaseResult::pending(case, name)
            })
            .collect();

        Self {
            id,
            task_id: task.id,
            environment_id,
            status: RunStatus::Running,
            summary: Summary::with_total(cases.len() as u32),
            cases,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            triggered_by,
            triggered_by_user,
        }
    }

    /// Move to a terminal status and stamp completion time/duration.
    pub fn finalize(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_cases(n: usize) -> (Task, HashMap<Uuid, Interface>) {
        let project = Uuid::new_v4();
        let mut task = Task::new(project, "t");
        let mut interfaces = HashMap::new();
        for i in 0..n {
            let iface = Interface::new(project, &format!("iface-{}", i), "GET", "/ping");
            task.cases.push(Case::new(iface.id, i as i64));
            interfaces.insert(iface.id, iface);
        }
        (task, interfaces)
    }

    #[test]
    fn test_new_result_snapshots_enabled_cases() {
        let (mut task, interfaces) = task_with_cases(3);
        task.cases[1].enabled = false;

        let result = RunResult::new(
            Uuid::new_v4(),
            &task,
            Uuid::new_v4(),
            &interfaces,
            Trigger::Manual,
            None,
        );

        assert_eq!(result.status, RunStatus::Running);
        assert_eq!(result.summary.total, 2);
        assert_eq!(result.cases.len(), 2);
        assert!(result.cases.iter().all(|c| c.status == CaseStatus::Pending));
        assert!(result.cases.windows(2).all(|w| w[0].order < w[1].order));
    }

    #[test]
    fn test_summary_buckets_sum_to_total() {
        let mut summary = Summary::with_total(4);
        summary.record(CaseStatus::Passed);
        summary.record(CaseStatus::Failed);
        summary.record(CaseStatus::Error);
        summary.record(CaseStatus::Skipped);
        assert_eq!(summary.counted(), summary.total);
        assert_eq!(summary.derive_status(), RunStatus::Failed);
    }

    #[test]
    fn test_summary_ignores_non_terminal() {
        let mut summary = Summary::with_total(1);
        summary.record(CaseStatus::Running);
        summary.record(CaseStatus::Pending);
        assert_eq!(summary.counted(), 0);
    }

    #[test]
    fn test_derive_status_all_passed() {
        let mut summary = Summary::with_total(2);
        summary.record(CaseStatus::Passed);
        summary.record(CaseStatus::Passed);
        assert_eq!(summary.derive_status(), RunStatus::Passed);
    }

    #[test]
    fn test_finalize_stamps_completion() {
        let (task, interfaces) = task_with_cases(1);
        let mut result = RunResult::new(
            Uuid::new_v4(),
            &task,
            Uuid::new_v4(),
            &interfaces,
            Trigger::Schedule,
            None,
        );
        result.finalize(RunStatus::Passed);
        assert_eq!(result.status, RunStatus::Passed);
        assert!(result.completed_at.is_some());
        assert!(result.duration_ms.is_some());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&CaseStatus::Skipped).unwrap(),
            "\"skipped\""
        );
        assert_eq!(
            serde_json::to_string(&Trigger::Schedule).unwrap(),
            "\"schedule\""
        );
    }
}

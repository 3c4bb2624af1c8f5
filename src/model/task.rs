use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One configured API call within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub interface_id: Uuid,
    /// Execution position, unique within the task. Cases run in
    /// ascending order because later cases may reference earlier
    /// responses by position.
    pub order: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-case headers, highest merge priority.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Body override; falls back to the interface default body.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub path_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub query_params: serde_json::Map<String, serde_json::Value>,
    /// Optional assertion script; when absent the default 2xx rule applies.
    #[serde(default)]
    pub assertion_script: Option<String>,
}

impl Case {
    pub fn new(interface_id: Uuid, order: i64) -> Self {
        Self {
            interface_id,
            order,
            enabled: true,
            headers: HashMap::new(),
            body: None,
            path_params: serde_json::Map::new(),
            query_params: serde_json::Map::new(),
            assertion_script: None,
        }
    }
}

/// Cron trigger settings for a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cron: String,
    /// Informational; cron expressions are evaluated in UTC.
    #[serde(default)]
    pub timezone: String,
}

/// Notification policy. Dispatch itself is an external collaborator;
/// the engine only invokes the hook on finalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationPolicy {
    #[serde(default)]
    pub on_success: bool,
    #[serde(default)]
    pub on_failure: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// A persisted definition of an ordered set of API calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    /// Target environment; `None` falls back to the project default.
    #[serde(default)]
    pub environment_id: Option<Uuid>,
    #[serde(default)]
    pub cases: Vec<Case>,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub notifications: NotificationPolicy,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Task {
    pub fn new(project_id: Uuid, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.to_string(),
            environment_id: None,
            cases: Vec::new(),
            schedule: Schedule::default(),
            notifications: NotificationPolicy::default(),
            enabled: true,
        }
    }

    /// Enabled cases in ascending execution order, captured once at run start.
    pub fn enabled_cases(&self) -> Vec<&Case> {
        let mut cases: Vec<&Case> = self.cases.iter().filter(|c| c.enabled).collect();
        cases.sort_by_key(|c| c.order);
        cases
    }
}

fn default_true() -> bool {
    true
}

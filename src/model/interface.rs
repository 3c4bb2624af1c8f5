use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A previously defined API endpoint a case executes against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    /// HTTP method, upper-case ("GET", "POST", ...).
    pub method: String,
    /// Path relative to the environment base URL. May contain `{name}`
    /// or `:name` placeholders filled from case path params.
    pub path: String,
    /// Default request body; a case body override takes precedence.
    #[serde(default)]
    pub default_body: Option<serde_json::Value>,
}

impl Interface {
    pub fn new(project_id: Uuid, name: &str, method: &str, path: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.to_string(),
            method: method.to_uppercase(),
            path: path.to_string(),
            default_body: None,
        }
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A named target environment: base URL plus default headers and variables.
///
/// Variables may be nested (`${auth.token}` resolves through objects);
/// headers are flat string pairs. At most one environment per project
/// carries `is_default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    /// Nested key -> value map used by `${path.to.key}` templates.
    #[serde(default)]
    pub variables: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub is_default: bool,
}

impl Environment {
    pub fn new(project_id: Uuid, name: &str, base_url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.to_string(),
            base_url: base_url.to_string(),
            variables: serde_json::Value::Object(Default::default()),
            headers: HashMap::new(),
            is_default: false,
        }
    }
}

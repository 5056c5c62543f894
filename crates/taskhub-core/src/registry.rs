//! Registry: resolves `task_id` -> (validator, command builder).
//!
//! Dynamic task discovery from a plugin directory has no safe Rust
//! analogue, so task definitions are a static manifest handed to the
//! registry at construction time instead — each one a capability-set pair
//! of plain functions.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Builds `argv` from validated parameters.
pub type CommandBuilder = Arc<dyn Fn(&serde_json::Value) -> Result<Vec<String>, ValidationError> + Send + Sync>;

/// A task's registered definition: identity, policy, and the two callables
/// the core needs to validate params and build a command.
#[derive(Clone)]
pub struct TaskDefinition {
    pub task_id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub version: String,
    pub params_schema: serde_json::Value,
    pub concurrency_limit: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub is_enabled: bool,
    pub command_builder: CommandBuilder,
}

impl TaskDefinition {
    /// Validate `params` against this task's JSON Schema and return the
    /// normalized object. Unknown-but-schema-valid keys pass through
    /// untouched (no key stripping is performed — the schema is authoritative).
    pub fn validate(&self, params: &serde_json::Value) -> Result<serde_json::Value, ValidationError> {
        let validator = jsonschema::JSONSchema::compile(&self.params_schema)
            .map_err(|e| ValidationError::SchemaMismatch(format!("invalid schema: {e}")))?;
        if let Err(errors) = validator.validate(params) {
            let msg = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            return Err(ValidationError::SchemaMismatch(msg));
        }
        Ok(params.clone())
    }

    pub fn build_command(&self, params: &serde_json::Value) -> Result<Vec<String>, ValidationError> {
        (self.command_builder)(params)
    }
}

/// Canonical schema hash: sha256 of the schema serialized with sorted keys.
pub fn schema_hash(schema: &serde_json::Value) -> String {
    let canonical = canonicalize(schema);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recursively sorts object keys so the JSON text is stable across runs,
/// matching `json.dumps(schema, sort_keys=True)`.
fn canonicalize(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut sorted: std::collections::BTreeMap<String, serde_json::Value> = std::collections::BTreeMap::new();
                for (k, v) in map {
                    sorted.insert(k.clone(), sort(v));
                }
                serde_json::to_value(sorted).unwrap()
            }
            serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}

/// In-memory resolver built from a static manifest of [`TaskDefinition`]s.
pub struct Registry {
    tasks: HashMap<String, TaskDefinition>,
}

impl Registry {
    pub fn new(definitions: Vec<TaskDefinition>) -> Self {
        let tasks = definitions.into_iter().map(|d| (d.task_id.clone(), d)).collect();
        Registry { tasks }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.tasks.get(task_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_hash_is_stable_under_key_reordering() {
        let a = serde_json::json!({"type": "object", "properties": {"a": 1, "b": 2}});
        let b = serde_json::json!({"properties": {"b": 2, "a": 1}, "type": "object"});
        assert_eq!(schema_hash(&a), schema_hash(&b));
    }

    #[test]
    fn schema_hash_changes_with_content() {
        let a = serde_json::json!({"type": "object"});
        let b = serde_json::json!({"type": "array"});
        assert_ne!(schema_hash(&a), schema_hash(&b));
    }

    #[test]
    fn validate_rejects_params_outside_schema() {
        let def = TaskDefinition {
            task_id: "t".to_string(),
            name: "t".to_string(),
            description: String::new(),
            tags: vec![],
            version: "1.0.0".to_string(),
            params_schema: serde_json::json!({
                "type": "object",
                "properties": {"count": {"type": "integer"}},
                "required": ["count"],
                "additionalProperties": false
            }),
            concurrency_limit: None,
            timeout_seconds: None,
            is_enabled: true,
            command_builder: Arc::new(|_| Ok(vec![])),
        };

        assert!(def.validate(&serde_json::json!({"count": 3})).is_ok());
        assert!(def.validate(&serde_json::json!({"count": "not a number"})).is_err());
        assert!(def.validate(&serde_json::json!({})).is_err());
    }
}

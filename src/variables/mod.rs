//! Session variables and the template language that reads them.
//!
//! The store is created by the runner and lives for exactly one run. Handlers
//! never write it directly: they return assignments that the dispatcher merges
//! after a successful step.

mod condition;
mod template;

pub use condition::{Condition, ConditionContext, StepStatus};
pub use template::{random_hex, referenced_variables, Builtin, Producer, Resolved, Segment, Template};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One captured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionVariable {
    pub value: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Step that produced the value, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    vars: BTreeMap<String, SessionVariable>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or overwrite `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, description: &str) {
        self.insert(key.into(), value.into(), description, None);
    }

    /// Store or overwrite `key`, recording the step that produced it.
    pub fn set_from_step(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        description: &str,
        step_id: &str,
    ) {
        self.insert(key.into(), value.into(), description, Some(step_id.to_string()));
    }

    /// Store a JSON value coerced to its string form.
    pub fn set_json(&mut self, key: impl Into<String>, value: &Value, description: &str) {
        self.set(key, value_to_string(value), description);
    }

    fn insert(&mut self, key: String, value: String, description: &str, step: Option<String>) {
        tracing::debug!(key = %key, step = ?step, "Setting session variable");
        self.vars.insert(
            key,
            SessionVariable {
                value,
                description: description.to_string(),
                created_at: Utc::now(),
                step,
            },
        );
    }

    /// The stored value, or `None` when the key was never set. An empty
    /// string is a stored value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|v| v.value.as_str())
    }

    pub fn get_variable(&self, key: &str) -> Option<&SessionVariable> {
        self.vars.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SessionVariable)> {
        self.vars.iter()
    }

    /// Owned copy of every variable, for the run manifest.
    pub fn snapshot(&self) -> BTreeMap<String, SessionVariable> {
        self.vars.clone()
    }

    /// Resolve every template expression in `text`. Unresolved expressions
    /// are left verbatim and logged.
    pub fn resolve(&self, text: &str) -> String {
        self.resolve_with_report(text).text
    }

    /// Like [`resolve`](Self::resolve), also returning what stayed unresolved.
    pub fn resolve_with_report(&self, text: &str) -> Resolved {
        let resolved = self.render(text);
        for expr in &resolved.unresolved {
            tracing::warn!(expression = %expr, "Unresolved template expression left verbatim");
        }
        resolved
    }

    fn render(&self, text: &str) -> Resolved {
        Template::parse(text).render(|name| self.get(name).map(str::to_string))
    }

    /// Resolve every string leaf of a JSON value. Keys and non-string scalars
    /// are untouched.
    pub fn resolve_value(&self, value: &Value) -> Value {
        self.resolve_value_with_report(value).0
    }

    /// Like [`resolve_value`](Self::resolve_value), also returning the
    /// distinct unresolved expressions across the whole value.
    pub fn resolve_value_with_report(&self, value: &Value) -> (Value, Vec<String>) {
        let mut unresolved = Vec::new();
        let resolved = self.resolve_value_inner(value, &mut unresolved);
        for expr in &unresolved {
            tracing::warn!(expression = %expr, "Unresolved template expression left verbatim");
        }
        (resolved, unresolved)
    }

    fn resolve_value_inner(&self, value: &Value, unresolved: &mut Vec<String>) -> Value {
        match value {
            Value::String(s) => {
                let out = self.render(s);
                for expr in out.unresolved {
                    if !unresolved.contains(&expr) {
                        unresolved.push(expr);
                    }
                }
                Value::String(out.text)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_value_inner(v, unresolved))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value_inner(v, unresolved)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// String form used when a JSON value becomes a session variable. Strings
/// are taken as-is, `null` becomes empty, everything else is its JSON text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_overwrite() {
        let mut store = VariableStore::new();
        assert_eq!(store.get("k"), None);
        store.set("k", "v1", "first");
        assert_eq!(store.get("k"), Some("v1"));
        store.set("k", "v2", "second");
        assert_eq!(store.get("k"), Some("v2"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_variable("k").unwrap().description, "second");
    }

    #[test]
    fn test_empty_value_is_not_missing() {
        let mut store = VariableStore::new();
        store.set("empty", "", "");
        assert_eq!(store.get("empty"), Some(""));
        assert_eq!(store.resolve("[{{empty}}]"), "[]");
    }

    #[test]
    fn test_set_json_coercion() {
        let mut store = VariableStore::new();
        store.set_json("n", &json!(42), "");
        store.set_json("b", &json!(true), "");
        store.set_json("s", &json!("text"), "");
        store.set_json("z", &Value::Null, "");
        store.set_json("o", &json!({"a": 1}), "");
        assert_eq!(store.get("n"), Some("42"));
        assert_eq!(store.get("b"), Some("true"));
        assert_eq!(store.get("s"), Some("text"));
        assert_eq!(store.get("z"), Some(""));
        assert_eq!(store.get("o"), Some(r#"{"a":1}"#));
    }

    #[test]
    fn test_resolve_examples() {
        let mut store = VariableStore::new();
        store.set("a", "1", "");
        store.set("b", "2", "");
        assert_eq!(store.resolve("{{a}}-{{b}}"), "1-2");
        assert_eq!(store.resolve("{{missing}}"), "{{missing}}");
        let report = store.resolve_with_report("{{missing}}");
        assert_eq!(report.unresolved, vec!["missing".to_string()]);
    }

    #[test]
    fn test_resolve_value_recurses() {
        let mut store = VariableStore::new();
        store.set("url", "http://localhost:6123", "");
        let config = json!({
            "url": "{{url}}/api",
            "{{url}}": "keys stay",
            "nested": {"list": ["{{url}}", 3, true, null, "{{gone}}"]},
            "timeout": 5
        });
        let (resolved, unresolved) = store.resolve_value_with_report(&config);
        assert_eq!(resolved["url"], "http://localhost:6123/api");
        assert_eq!(resolved["{{url}}"], "keys stay");
        assert_eq!(resolved["nested"]["list"][0], "http://localhost:6123");
        assert_eq!(resolved["nested"]["list"][1], 3);
        assert_eq!(resolved["nested"]["list"][3], Value::Null);
        assert_eq!(resolved["nested"]["list"][4], "{{gone}}");
        assert_eq!(resolved["timeout"], 5);
        assert_eq!(unresolved, vec!["gone".to_string()]);
    }

    #[test]
    fn test_step_attribution() {
        let mut store = VariableStore::new();
        store.set_from_step("token", "abc", "API token", "login");
        let var = store.get_variable("token").unwrap();
        assert_eq!(var.step.as_deref(), Some("login"));
        let snap = store.snapshot();
        assert_eq!(snap["token"].value, "abc");
    }
}

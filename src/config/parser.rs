use super::Script;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Load a script document from disk.
    pub fn load_script<P: AsRef<Path>>(&self, path: P) -> Result<Script> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| Error::ScriptLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        self.parse_script(&content).map_err(|e| match e {
            Error::Json(json) => Error::ScriptLoad {
                path: path.display().to_string(),
                reason: json.to_string(),
            },
            other => other,
        })
    }

    /// Parse a script from JSON text.
    pub fn parse_script(&self, content: &str) -> Result<Script> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        if !value.is_object() {
            return Err(Error::ScriptLoad {
                path: "<inline>".to_string(),
                reason: "top-level value must be a JSON object".to_string(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

use super::{parse_duration_string, InstanceMode, Script};
use crate::dispatch::HandlerRegistry;
use crate::error::{Error, Result};
use crate::variables::Condition;
use std::collections::HashSet;

impl Script {
    /// Statically validate the script before any step runs.
    ///
    /// Every structural problem is collected into a single
    /// `Error::ScriptValidation`. Problems that do not stop a run (unknown
    /// settings, steps with no registered handler) come back as warnings.
    pub fn validate(&self, registry: &HandlerRegistry) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        let mut warnings = Vec::new();

        if self.script_name.trim().is_empty() {
            problems.push("'script_name' must not be empty".to_string());
        }

        let settings = &self.settings;
        if settings.use_temp_instance && settings.use_existing_instance {
            problems.push(
                "'use_temp_instance' and 'use_existing_instance' cannot both be true".to_string(),
            );
        }

        for (field, raw) in settings.instance.duration_fields() {
            if let Some(raw) = raw {
                if parse_duration_string(raw).is_none() {
                    problems.push(format!(
                        "settings.instance.{} has invalid duration '{}'. Use formats like '500ms', '30s', '1m'",
                        field, raw
                    ));
                }
            }
        }

        if let Some([lo, hi]) = settings.instance.port_range {
            if lo == 0 || hi <= lo {
                problems.push(format!(
                    "settings.instance.port_range [{}, {}] must be a non-empty range of non-zero ports",
                    lo, hi
                ));
            }
        }

        for key in settings.extra.keys() {
            warnings.push(format!("Unrecognized setting '{}' is ignored", key));
        }

        let mut seen = HashSet::new();
        let has_instance = settings.instance_mode() != InstanceMode::None;
        for (index, step) in self.steps.iter().enumerate() {
            let label = if step.id.is_empty() {
                format!("step #{}", index + 1)
            } else {
                format!("step '{}'", step.id)
            };

            if step.id.trim().is_empty() {
                problems.push(format!("{} has no 'id'", label));
            } else if !seen.insert(step.id.as_str()) {
                problems.push(format!("Duplicate step id '{}'", step.id));
            }

            if step.step_type.trim().is_empty() {
                problems.push(format!("{} has no 'type'", label));
            }

            match step.action.as_deref() {
                None => problems.push(format!("{} has no 'action'", label)),
                Some(a) if a.trim().is_empty() => {
                    problems.push(format!("{} has an empty 'action'", label))
                }
                Some(action) => {
                    if !step.step_type.is_empty() && !registry.contains(&step.step_type, action)
                    {
                        warnings.push(format!(
                            "{} uses '{}/{}', which has no registered handler",
                            label, step.step_type, action
                        ));
                    }
                }
            }

            if !step.config.is_object() {
                problems.push(format!("{} 'config' must be a JSON object", label));
            }

            if let Some(ref expr) = step.condition {
                if let Err(e) = Condition::parse(expr) {
                    problems.push(format!("{} has an invalid condition: {}", label, e));
                }
            }

            if step.is_instance_step() && !has_instance {
                warnings.push(format!(
                    "{} is an instance step but neither 'use_temp_instance' nor 'use_existing_instance' is set",
                    label
                ));
            }
        }

        if problems.is_empty() {
            Ok(warnings)
        } else {
            Err(Error::ScriptValidation(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Parser;
    use crate::dispatch::HandlerRegistry;
    use crate::error::Error;
    use crate::handlers::register_builtin;

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry).unwrap();
        registry
    }

    fn problems(json: &str) -> Vec<String> {
        let script = Parser::new().parse_script(json).unwrap();
        match script.validate(&registry()) {
            Err(Error::ScriptValidation(p)) => p,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_script_passes() {
        let script = Parser::new()
            .parse_script(
                r#"{"script_name": "ok", "steps": [
                    {"id": "a", "type": "test", "action": "set_session_variables",
                     "config": {"variables": {"x": 1}}}
                ]}"#,
            )
            .unwrap();
        let warnings = script.validate(&registry()).unwrap();
        assert!(warnings.is_empty(), "{:?}", warnings);
    }

    #[test]
    fn test_duplicate_ids_and_missing_action() {
        let p = problems(
            r#"{"script_name": "dup", "steps": [
                {"id": "a", "type": "test", "action": "set_session_variables"},
                {"id": "a", "type": "test"}
            ]}"#,
        );
        assert!(p.iter().any(|m| m.contains("Duplicate step id 'a'")));
        assert!(p.iter().any(|m| m.contains("no 'action'")));
    }

    #[test]
    fn test_mutually_exclusive_instance_modes() {
        let p = problems(
            r#"{"script_name": "both", "settings":
                {"use_temp_instance": true, "use_existing_instance": true}, "steps": []}"#,
        );
        assert_eq!(p.len(), 1);
        assert!(p[0].contains("cannot both be true"));
    }

    #[test]
    fn test_bad_condition_and_duration() {
        let p = problems(
            r#"{"script_name": "bad", "settings": {"instance": {"readiness_timeout": "soon"}},
                "steps": [{"id": "a", "type": "test", "action": "set_session_variables",
                           "condition": "defined(x"}]}"#,
        );
        assert!(p.iter().any(|m| m.contains("readiness_timeout")));
        assert!(p.iter().any(|m| m.contains("invalid condition")));
    }

    #[test]
    fn test_unregistered_type_is_a_warning() {
        let script = Parser::new()
            .parse_script(
                r#"{"script_name": "w", "settings": {"slow_motion": 10},
                    "steps": [{"id": "b", "type": "bogus", "action": "nope"}]}"#,
            )
            .unwrap();
        let warnings = script.validate(&registry()).unwrap();
        assert!(warnings.iter().any(|w| w.contains("bogus/nope")));
        assert!(warnings.iter().any(|w| w.contains("slow_motion")));
    }

    #[test]
    fn test_empty_type_is_rejected() {
        let p = problems(r#"{"script_name": "t", "steps": [{"id": "a", "action": "x"}]}"#);
        assert!(p.iter().any(|m| m.contains("no 'type'")));
    }
}

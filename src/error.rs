//! Engine error types with fix suggestions

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FLOW-001: Unsupported project schema '{schema}' (expected '{expected}')")]
    BadSchema { schema: String, expected: &'static str },

    // ─────────────────────────────────────────────────────────────
    // Graph compilation errors (FLOW-010 to FLOW-013)
    // ─────────────────────────────────────────────────────────────
    #[error("FLOW-010: Duplicate flow name '{flow}'")]
    DuplicateFlow { flow: String },

    #[error("FLOW-011: Duplicate component id '{component}' in flow '{flow}'")]
    DuplicateComponent { flow: String, component: String },

    #[error("FLOW-012: Connection references unknown component '{component}' in flow '{flow}'")]
    UnknownEndpoint { flow: String, component: String },

    #[error("FLOW-013: Unknown handler '{handler}' for component '{component}' in flow '{flow}'")]
    UnknownHandler {
        flow: String,
        component: String,
        handler: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Invocation errors (FLOW-020 to FLOW-021) - fatal at run time
    // ─────────────────────────────────────────────────────────────
    #[error("FLOW-020: Unknown action '{action}'")]
    UnknownAction { action: String },

    #[error("FLOW-021: Action '{action}' has no start component")]
    MissingStart { action: String },
}

impl FixSuggestion for EngineError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            EngineError::YamlParse(_) => Some("Check YAML syntax: indentation and quoting"),
            EngineError::Io(_) => Some("Check file path and permissions"),
            EngineError::BadSchema { .. } => {
                Some("Set `schema: flowrt/project@0.1` at the top of the project file")
            }
            EngineError::DuplicateFlow { .. } => Some("Give every flow a unique name"),
            EngineError::DuplicateComponent { .. } => {
                Some("Give every component in a flow a unique id")
            }
            EngineError::UnknownEndpoint { .. } => {
                Some("Connections must reference component ids declared in the same flow")
            }
            EngineError::UnknownHandler { .. } => {
                Some("Register the handler in the HandlerRegistry before loading the project")
            }
            EngineError::UnknownAction { .. } => {
                Some("call-action must name a flow with `role: action`")
            }
            EngineError::MissingStart { .. } => {
                Some("Add a component with `kind: start` to the action flow")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_errors_carry_codes() {
        let err = EngineError::MissingStart {
            action: "save".into(),
        };
        assert!(err.to_string().contains("FLOW-021"));
        assert!(err.to_string().contains("save"));
    }

    #[test]
    fn every_variant_has_a_suggestion() {
        let errs = [
            EngineError::BadSchema {
                schema: "x".into(),
                expected: "y",
            },
            EngineError::DuplicateFlow { flow: "f".into() },
            EngineError::UnknownAction { action: "a".into() },
        ];
        for e in errs {
            assert!(e.fix_suggestion().is_some());
        }
    }
}

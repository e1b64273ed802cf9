use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalidFile,
    ConfigInvalidValue,

    ValidationInvalidArgument,

    RuleDuplicateId,
    RuleInvalid,

    RenameCollision,
    PersistFailed,
    RunIdempotencyViolation,
    RunLogNotFound,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalidFile => "config.invalid_file",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::RuleDuplicateId => "rule.duplicate_id",
            ErrorCode::RuleInvalid => "rule.invalid",

            ErrorCode::RenameCollision => "rename.collision",
            ErrorCode::PersistFailed => "persist.failed",
            ErrorCode::RunIdempotencyViolation => "run.idempotency_violation",
            ErrorCode::RunLogNotFound => "run_log.not_found",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidFileDetails {
    pub path: String,
    pub format: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDetails {
    pub rule_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameCollisionDetails {
    pub kind: String,
    pub old_name: String,
    pub new_name: String,
    pub conflicts_with: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistFailedDetails {
    pub path: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyViolationDetails {
    pub rule_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalJsonErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn config_invalid_file(
        path: impl Into<String>,
        format: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let details = to_details(ConfigInvalidFileDetails {
            path: path.into(),
            format: format.into(),
            error: error.into(),
        });

        Self::new(
            ErrorCode::ConfigInvalidFile,
            "Invalid ruleset file",
            details,
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let details = to_details(ConfigInvalidValueDetails {
            key: key.into(),
            value,
            problem: problem.into(),
        });

        Self::new(
            ErrorCode::ConfigInvalidValue,
            "Invalid configuration value",
            details,
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
    ) -> Self {
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.into(),
        });

        Self::new(
            ErrorCode::ValidationInvalidArgument,
            "Invalid argument",
            details,
        )
    }

    pub fn rule_duplicate_id(rule_id: impl Into<String>) -> Self {
        let rule_id = rule_id.into();
        let message = format!("Rule id '{}' is registered more than once", rule_id);
        let details = to_details(RuleDetails {
            rule_id,
            problem: None,
        });

        Self::new(ErrorCode::RuleDuplicateId, message, details)
            .with_hint("Every rule in a ruleset needs a unique id")
    }

    pub fn rule_invalid(rule_id: impl Into<String>, problem: impl Into<String>) -> Self {
        let rule_id = rule_id.into();
        let problem = problem.into();
        let message = format!("Rule '{}' is invalid: {}", rule_id, problem);
        let details = to_details(RuleDetails {
            rule_id,
            problem: Some(problem),
        });

        Self::new(ErrorCode::RuleInvalid, message, details)
    }

    pub fn rename_collision(
        kind: impl Into<String>,
        old_name: impl Into<String>,
        new_name: impl Into<String>,
        conflicts_with: impl Into<String>,
    ) -> Self {
        let old_name = old_name.into();
        let new_name = new_name.into();
        let message = format!(
            "Renaming '{}' to '{}' collides with an existing entity",
            old_name, new_name
        );
        let details = to_details(RenameCollisionDetails {
            kind: kind.into(),
            old_name,
            new_name,
            conflicts_with: conflicts_with.into(),
        });

        Self::new(ErrorCode::RenameCollision, message, details)
    }

    pub fn persist_failed(path: impl Into<String>, error: impl Into<String>, attempts: u32) -> Self {
        let path = path.into();
        let message = format!("Failed to write {}", path);
        let details = to_details(PersistFailedDetails {
            path,
            error: error.into(),
            attempts,
        });

        let mut err = Self::new(ErrorCode::PersistFailed, message, details);
        err.retryable = Some(true);
        err
    }

    pub fn idempotency_violation(rule_ids: Vec<String>) -> Self {
        let message = format!(
            "Rules still match after the pass: {}",
            rule_ids.join(", ")
        );
        let details = to_details(IdempotencyViolationDetails { rule_ids });

        Self::new(ErrorCode::RunIdempotencyViolation, message, details)
            .with_hint("Re-run to converge, or check for rules that undo each other")
    }

    pub fn run_log_not_found(path: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::RunLogNotFound,
            "No run log found",
            serde_json::json!({ "path": path.into() }),
        )
        .with_hint("Run 'retrofit run' without --dry-run first")
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalIoErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalJsonErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalJsonError, "JSON error", details)
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_dotted_and_stable() {
        assert_eq!(ErrorCode::RuleDuplicateId.as_str(), "rule.duplicate_id");
        assert_eq!(ErrorCode::RenameCollision.as_str(), "rename.collision");
        assert_eq!(ErrorCode::PersistFailed.as_str(), "persist.failed");
    }

    #[test]
    fn duplicate_rule_carries_id_and_hint() {
        let err = Error::rule_duplicate_id("share-plus");
        assert_eq!(err.code, ErrorCode::RuleDuplicateId);
        assert_eq!(err.details["ruleId"], "share-plus");
        assert!(!err.hints.is_empty());
        assert!(err.to_string().contains("share-plus"));
    }

    #[test]
    fn persist_failure_is_retryable() {
        let err = Error::persist_failed("lib/a.dart", "permission denied", 2);
        assert_eq!(err.retryable, Some(true));
        assert_eq!(err.details["attempts"], 2);
    }

    #[test]
    fn rename_collision_details() {
        let err = Error::rename_collision("file", "P.ext", "Q.ext", "R.ext");
        assert_eq!(err.details["newName"], "Q.ext");
        assert_eq!(err.details["conflictsWith"], "R.ext");
    }
}

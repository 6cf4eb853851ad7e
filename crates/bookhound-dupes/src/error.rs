use std::fmt;

use bookhound_core::{BookId, CoreError};
use serde::Serialize;
use thiserror::Error;

/// One problem with one match rule, found before a run starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleError {
    /// Position of the rule in the submitted list.
    pub rule: usize,
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl RuleError {
    pub fn new(rule: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            rule,
            field: field.to_string(),
            algorithm: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn for_algorithm(mut self, algorithm: &str) -> Self {
        self.algorithm = Some(algorithm.to_string());
        self
    }

    pub fn with_details(mut self, details: Option<String>) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule {} ({})", self.rule + 1, self.field)?;
        if let Some(algorithm) = &self.algorithm {
            write!(f, " [{algorithm}]")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

/// An algorithm failed while hashing one book; the book was skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationError {
    pub book_id: BookId,
    pub field: String,
    pub algorithm: String,
    pub settings: serde_json::Value,
    pub message: String,
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "book {}: {} on {} failed: {} (settings {})",
            self.book_id, self.algorithm, self.field, self.message, self.settings
        )
    }
}

#[derive(Debug, Error)]
pub enum DupesError {
    #[error("invalid match rules: {}", join_rule_errors(.0))]
    Validation(Vec<RuleError>),

    #[error("cannot open target library: {0}")]
    TargetUnavailable(#[source] CoreError),

    #[error("unknown rule set: {0}")]
    UnknownRuleSet(String),

    #[error("rule set already exists: {0}")]
    RuleSetExists(String),

    #[error("no duplicate group {0}")]
    GroupNotFound(usize),

    #[error("no duplicate report; run a duplicate check first")]
    NoReport,

    #[error("no duplicate group is selected")]
    NoCurrentGroup,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_rule_errors(errors: &[RuleError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, DupesError>;

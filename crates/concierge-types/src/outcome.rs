use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ClarificationRequest;

/// What a tool executor hands back; relayed to the user, never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnrecognizedReason {
    NoConfidentCandidate,
    OracleTimeout,
    OracleFailed,
}

/// User-facing failure taxonomy of a turn.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnError {
    #[error("unrecognized intent ({reason:?})")]
    UnrecognizedIntent { reason: UnrecognizedReason },
    #[error("`{tool}` is missing {missing:?} and has invalid {invalid:?}")]
    ValidationIncomplete {
        tool: String,
        missing: Vec<String>,
        invalid: Vec<String>,
    },
    #[error("gave up on `{tool}` after {rounds} clarification rounds")]
    ClarificationLimitExceeded { tool: String, rounds: u32 },
    #[error("`{tool}` failed: {message}")]
    ExecutionError { tool: String, message: String },
    #[error("`{tool}` did not respond within {timeout_ms}ms")]
    ExecutionTimeout { tool: String, timeout_ms: u64 },
}

impl TurnError {
    pub fn code(&self) -> &'static str {
        match self {
            TurnError::UnrecognizedIntent { .. } => "UNRECOGNIZED_INTENT",
            TurnError::ValidationIncomplete { .. } => "VALIDATION_INCOMPLETE",
            TurnError::ClarificationLimitExceeded { .. } => "CLARIFICATION_LIMIT_EXCEEDED",
            TurnError::ExecutionError { .. } => "EXECUTION_ERROR",
            TurnError::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnOutcome {
    Clarify(ClarificationRequest),
    Dispatched {
        tool: String,
        task_id: String,
        result: ToolResult,
    },
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
    Failed(TurnError),
}

impl TurnOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            TurnOutcome::Clarify(_) => "clarify",
            TurnOutcome::Dispatched { .. } => "dispatched",
            TurnOutcome::Cancelled { .. } => "cancelled",
            TurnOutcome::Failed(_) => "failed",
        }
    }

    /// Text the surrounding shell speaks or prints back to the user.
    pub fn reply(&self) -> String {
        match self {
            TurnOutcome::Clarify(request) => request.prompt.clone(),
            TurnOutcome::Dispatched { result, .. } if result.output.trim().is_empty() => {
                "Done.".to_string()
            }
            TurnOutcome::Dispatched { result, .. } => result.output.clone(),
            TurnOutcome::Cancelled { tool: Some(tool) } => {
                format!("Okay, I've cancelled the {}.", tool.replace('_', " "))
            }
            TurnOutcome::Cancelled { tool: None } => {
                "There's nothing in progress to cancel.".to_string()
            }
            TurnOutcome::Failed(err) => match err {
                TurnError::UnrecognizedIntent { .. } => {
                    "Sorry, I didn't understand that. Could you rephrase?".to_string()
                }
                TurnError::ValidationIncomplete { tool, .. } => {
                    format!("I still need a few details for {}.", tool.replace('_', " "))
                }
                TurnError::ClarificationLimitExceeded { tool, .. } => format!(
                    "I couldn't get everything I needed for {}, so I've dropped it. Let's start over whenever you're ready.",
                    tool.replace('_', " ")
                ),
                TurnError::ExecutionError { tool, .. } => format!(
                    "I couldn't complete {}. Say \"try again\" if you'd like me to retry.",
                    tool.replace('_', " ")
                ),
                TurnError::ExecutionTimeout { tool, .. } => format!(
                    "The {} request didn't respond, so I can't tell whether it went through. Say \"try again\" to retry.",
                    tool.replace('_', " ")
                ),
            },
        }
    }
}

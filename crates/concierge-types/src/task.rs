use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::FieldMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Collecting,
    Ready,
    Dispatched,
    Abandoned,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Collecting => "collecting",
            TaskStatus::Ready => "ready",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Abandoned)
    }

    /// Legal edges of the task lifecycle. `Ready -> Abandoned` covers a
    /// ready task that failed to execute and is then cancelled or superseded.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Collecting, TaskStatus::Ready)
                | (TaskStatus::Collecting, TaskStatus::Abandoned)
                | (TaskStatus::Ready, TaskStatus::Dispatched)
                | (TaskStatus::Ready, TaskStatus::Collecting)
                | (TaskStatus::Ready, TaskStatus::Abandoned)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbandonReason {
    Cancelled,
    Superseded { by_tool: String },
    ClarificationLimit { rounds: u32 },
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::Cancelled => "cancelled",
            AbandonReason::Superseded { .. } => "superseded",
            AbandonReason::ClarificationLimit { .. } => "clarification_limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
}

/// One in-progress multi-turn operation against a single tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub fields: FieldMap,
    pub status: TaskStatus,
    #[serde(default)]
    pub clarification_rounds: u32,
    /// Field named by the latest clarification question, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandon_reason: Option<AbandonReason>,
    #[serde(default)]
    pub transitions: Vec<TaskTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActiveTask {
    pub fn new(tool: impl Into<String>, fields: FieldMap) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.into(),
            fields,
            status: TaskStatus::Collecting,
            clarification_rounds: 0,
            pending_field: None,
            abandon_reason: None,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Status the task held right before its latest transition.
    pub fn previous_status(&self) -> Option<TaskStatus> {
        self.transitions.last().map(|t| t.from)
    }

    pub fn filled_summary(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k.replace('_', " "), v.display()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatched_is_only_reachable_from_ready() {
        assert!(TaskStatus::Ready.can_transition_to(TaskStatus::Dispatched));
        assert!(!TaskStatus::Collecting.can_transition_to(TaskStatus::Dispatched));
        assert!(!TaskStatus::Abandoned.can_transition_to(TaskStatus::Dispatched));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [TaskStatus::Dispatched, TaskStatus::Abandoned] {
            for to in [
                TaskStatus::Collecting,
                TaskStatus::Ready,
                TaskStatus::Dispatched,
                TaskStatus::Abandoned,
            ] {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn new_task_starts_collecting_with_zero_rounds() {
        let task = ActiveTask::new("reminder_create", FieldMap::new());
        assert_eq!(task.status, TaskStatus::Collecting);
        assert_eq!(task.clarification_rounds, 0);
        assert!(task.previous_status().is_none());
    }
}

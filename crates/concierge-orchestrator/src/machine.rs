use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use concierge_tools::{validate, NormalizeContext, ToolExecutor, Validation};
use concierge_types::{
    AbandonReason, ActiveTask, IntentCandidate, Session, TaskStatus, TaskTransition, ToolResult,
    ToolSchema,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_max_clarification_rounds")]
    pub max_clarification_rounds: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_clarification_rounds() -> u32 {
    3
}

fn default_history_limit() -> usize {
    8
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_clarification_rounds: default_max_clarification_rounds(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task `{task_id}` cannot move from {} to {}", .from.as_str(), .to.as_str())]
    Illegal {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("session has no current task")]
    NoCurrentTask,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("task `{task_id}` is {} and cannot be dispatched", .status.as_str())]
    NotReady { task_id: String, status: TaskStatus },
    #[error("`{tool}` failed: {message}")]
    ExecutionFailed { tool: String, message: String },
    #[error("`{tool}` did not answer within {timeout_ms}ms")]
    TimedOut { tool: String, timeout_ms: u64 },
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// How `start_or_continue` placed the candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStart {
    Continued { task_id: String },
    Created {
        task_id: String,
        superseded: Option<ActiveTask>,
    },
}

impl TaskStart {
    pub fn task_id(&self) -> &str {
        match self {
            TaskStart::Continued { task_id } | TaskStart::Created { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub task: ActiveTask,
    pub result: ToolResult,
}

/// Moves `task` along one lifecycle edge and records it.
pub fn transition(task: &mut ActiveTask, to: TaskStatus) -> Result<(), TransitionError> {
    let from = task.status;
    if !from.can_transition_to(to) {
        return Err(TransitionError::Illegal {
            task_id: task.id.clone(),
            from,
            to,
        });
    }
    task.touch();
    task.transitions.push(TaskTransition {
        from,
        to,
        at: task.updated_at,
    });
    task.status = to;
    debug!(
        task_id = %task.id,
        tool = %task.tool,
        from = from.as_str(),
        to = to.as_str(),
        "task transition"
    );
    Ok(())
}

/// Owns every mutation of a session's current task.
#[derive(Debug, Clone, Default)]
pub struct TaskMachine {
    config: TaskConfig,
}

impl TaskMachine {
    pub fn new(config: TaskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Merges the candidate into the current task when it continues a
    /// collecting task of the same tool; otherwise supersedes whatever is
    /// current and opens a fresh task. Keys outside `schema` and blank values
    /// never enter the task.
    pub fn start_or_continue(
        &self,
        session: &mut Session,
        schema: &ToolSchema,
        candidate: &IntentCandidate,
    ) -> Result<TaskStart, TransitionError> {
        let incoming = candidate
            .fields
            .iter()
            .filter(|(name, value)| schema.has_field(name) && !value.is_blank())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect::<Vec<_>>();

        if let Some(task) = session.current.as_mut() {
            let continues = candidate.continues_current
                && task.tool == candidate.tool
                && task.status == TaskStatus::Collecting;
            if continues {
                for (name, value) in incoming {
                    task.fields.insert(name, value);
                }
                task.touch();
                return Ok(TaskStart::Continued {
                    task_id: task.id.clone(),
                });
            }
        }

        let superseded = match session.current.as_ref().map(|t| t.status) {
            Some(status) if !status.is_terminal() => self.abandon(
                session,
                AbandonReason::Superseded {
                    by_tool: candidate.tool.clone(),
                },
            )?,
            Some(_) => {
                session.archive_current(self.config.history_limit);
                None
            }
            None => None,
        };

        let task = ActiveTask::new(candidate.tool.clone(), incoming.into_iter().collect());
        let task_id = task.id.clone();
        info!(task_id = %task_id, tool = %task.tool, "task started");
        session.current = Some(task);
        session.touch();
        Ok(TaskStart::Created {
            task_id,
            superseded,
        })
    }

    /// Validates the current task. Accepted replaces its fields with the
    /// normalized map and marks it ready; Rejected leaves it collecting.
    pub fn check_ready(
        &self,
        session: &mut Session,
        schema: &ToolSchema,
        ctx: &NormalizeContext<'_>,
    ) -> Result<Validation, TransitionError> {
        let task = session
            .current
            .as_mut()
            .ok_or(TransitionError::NoCurrentTask)?;
        let validation = validate(schema, &task.fields, ctx);
        match &validation {
            Validation::Accepted(normalized) => {
                task.fields = normalized.clone();
                task.pending_field = None;
                if task.status == TaskStatus::Collecting {
                    transition(task, TaskStatus::Ready)?;
                } else {
                    task.touch();
                }
            }
            Validation::Rejected(_) => {
                if task.status == TaskStatus::Ready {
                    transition(task, TaskStatus::Collecting)?;
                }
            }
        }
        Ok(validation)
    }

    /// Invokes the executor for a ready task, bounded by `timeout`. Only a
    /// successful call moves the task to dispatched and into history; on
    /// failure or timeout it stays ready so the user can retry explicitly.
    pub async fn dispatch(
        &self,
        session: &mut Session,
        schema: &ToolSchema,
        executor: &dyn ToolExecutor,
        timeout: Duration,
    ) -> Result<Dispatched, DispatchError> {
        let task = session
            .current
            .as_ref()
            .ok_or(TransitionError::NoCurrentTask)?;
        if task.status != TaskStatus::Ready {
            return Err(DispatchError::NotReady {
                task_id: task.id.clone(),
                status: task.status,
            });
        }
        let tool = task.tool.clone();
        let args = schema.args_json(&task.fields);

        let result = match tokio::time::timeout(timeout, executor.execute(&tool, args)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                return Err(DispatchError::ExecutionFailed {
                    tool,
                    message: err.to_string(),
                })
            }
            Err(_) => {
                return Err(DispatchError::TimedOut {
                    tool,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        let task = session
            .current
            .as_mut()
            .ok_or(TransitionError::NoCurrentTask)?;
        transition(task, TaskStatus::Dispatched)?;
        let task = task.clone();
        session.archive_current(self.config.history_limit);
        info!(task_id = %task.id, tool = %task.tool, "task dispatched");
        Ok(Dispatched { task, result })
    }

    /// Ends the current task. Returns the archived task, or `None` when the
    /// session had nothing current.
    pub fn abandon(
        &self,
        session: &mut Session,
        reason: AbandonReason,
    ) -> Result<Option<ActiveTask>, TransitionError> {
        let Some(task) = session.current.as_mut() else {
            return Ok(None);
        };
        transition(task, TaskStatus::Abandoned)?;
        info!(task_id = %task.id, tool = %task.tool, reason = reason.as_str(), "task abandoned");
        task.abandon_reason = Some(reason);
        task.pending_field = None;
        Ok(session.archive_current(self.config.history_limit).cloned())
    }

    /// True once the current task has used up its clarification rounds.
    pub fn limit_reached(&self, task: &ActiveTask) -> bool {
        task.clarification_rounds >= self.config.max_clarification_rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use concierge_tools::builtin_catalog;
    use concierge_types::{FieldSpec, FieldType, FieldValue, Preferences};
    use serde_json::{json, Value};

    fn schema(name: &str) -> ToolSchema {
        builtin_catalog()
            .into_iter()
            .find(|s| s.name == name)
            .expect("schema")
    }

    fn candidate(tool: &str, continues: bool, fields: &[(&str, &str)]) -> IntentCandidate {
        let mut c = IntentCandidate::new(tool, 0.9);
        c.continues_current = continues;
        c.fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::raw(*v)))
            .collect();
        c
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).expect("date")
    }

    struct Answer(Result<&'static str, &'static str>, Option<Duration>);

    #[async_trait]
    impl ToolExecutor for Answer {
        async fn execute(&self, _tool: &str, args: Value) -> anyhow::Result<ToolResult> {
            if let Some(delay) = self.1 {
                tokio::time::sleep(delay).await;
            }
            match self.0 {
                Ok(output) => Ok(ToolResult {
                    output: output.to_string(),
                    metadata: args,
                }),
                Err(message) => anyhow::bail!(message),
            }
        }
    }

    #[test]
    fn later_values_win_and_disjoint_fields_accumulate() {
        let machine = TaskMachine::default();
        let reminder = schema("reminder_create");
        let mut session = Session::new("s", Preferences::default());
        let first = candidate("reminder_create", false, &[("title", "gym"), ("time", "6pm")]);
        machine
            .start_or_continue(&mut session, &reminder, &first)
            .expect("start");
        let followup = candidate("reminder_create", true, &[("time", "7pm"), ("date", "friday")]);
        let start = machine
            .start_or_continue(&mut session, &reminder, &followup)
            .expect("continue");
        assert!(matches!(start, TaskStart::Continued { .. }));
        let task = session.current.as_ref().expect("task");
        assert_eq!(task.fields["title"], FieldValue::raw("gym"));
        assert_eq!(task.fields["time"], FieldValue::raw("7pm"));
        assert_eq!(task.fields["date"], FieldValue::raw("friday"));
    }

    #[test]
    fn unknown_keys_and_blank_values_never_enter_task() {
        let machine = TaskMachine::default();
        let reminder = schema("reminder_create");
        let mut session = Session::new("s", Preferences::default());
        machine
            .start_or_continue(
                &mut session,
                &reminder,
                &candidate(
                    "reminder_create",
                    false,
                    &[("title", "gym"), ("mood", "great"), ("time", " ")],
                ),
            )
            .expect("start");
        let task = session.current.as_ref().expect("task");
        assert_eq!(task.fields.keys().collect::<Vec<_>>(), vec!["title"]);
    }

    #[test]
    fn different_tool_supersedes_current_task() {
        let machine = TaskMachine::default();
        let mut session = Session::new("s", Preferences::default());
        machine
            .start_or_continue(
                &mut session,
                &schema("reminder_create"),
                &candidate("reminder_create", false, &[]),
            )
            .expect("start");
        let start = machine
            .start_or_continue(&mut session, &schema("weather"), &candidate("weather", false, &[]))
            .expect("switch");
        let TaskStart::Created { superseded: Some(old), .. } = start else {
            panic!("expected supersede");
        };
        assert_eq!(old.status, TaskStatus::Abandoned);
        assert_eq!(
            old.abandon_reason,
            Some(AbandonReason::Superseded { by_tool: "weather".to_string() })
        );
        assert_eq!(session.history.len(), 1);
        assert_eq!(session.current.as_ref().map(|t| t.tool.as_str()), Some("weather"));
    }

    #[test]
    fn check_ready_normalizes_and_moves_to_ready() {
        let machine = TaskMachine::default();
        let reminder = schema("reminder_create");
        let prefs = Preferences::default();
        let ctx = NormalizeContext::new(today(), &prefs);
        let mut session = Session::new("s", prefs.clone());
        machine
            .start_or_continue(
                &mut session,
                &reminder,
                &candidate(
                    "reminder_create",
                    false,
                    &[("title", "call Jim"), ("date", "tomorrow"), ("time", "2pm")],
                ),
            )
            .expect("start");
        let validation = machine.check_ready(&mut session, &reminder, &ctx).expect("check");
        assert!(validation.is_accepted());
        let task = session.current.as_ref().expect("task");
        assert_eq!(task.status, TaskStatus::Ready);
        assert!(task.fields.values().all(FieldValue::is_normalized));
    }

    #[test]
    fn ready_task_that_stops_validating_returns_to_collecting() {
        let machine = TaskMachine::default();
        let search = schema("web_search");
        let prefs = Preferences::default();
        let ctx = NormalizeContext::new(today(), &prefs);
        let mut session = Session::new("s", prefs.clone());
        machine
            .start_or_continue(
                &mut session,
                &search,
                &candidate("web_search", false, &[("query", "tide tables")]),
            )
            .expect("start");
        machine.check_ready(&mut session, &search, &ctx).expect("check");
        assert_eq!(session.current.as_ref().map(|t| t.status), Some(TaskStatus::Ready));

        let stricter = search
            .clone()
            .field(FieldSpec::required("site", FieldType::String));
        let validation = machine.check_ready(&mut session, &stricter, &ctx).expect("recheck");
        let Validation::Rejected(rejection) = validation else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.missing, vec!["site".to_string()]);

        let task = session.current.as_ref().expect("task");
        assert_eq!(task.status, TaskStatus::Collecting);
        assert_eq!(task.previous_status(), Some(TaskStatus::Ready));
        let last = task.transitions.last().expect("transition");
        assert_eq!((last.from, last.to), (TaskStatus::Ready, TaskStatus::Collecting));
        assert_eq!(task.fields.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_requires_ready_and_archives_on_success() {
        let machine = TaskMachine::default();
        let search = schema("web_search");
        let prefs = Preferences::default();
        let ctx = NormalizeContext::new(today(), &prefs);
        let mut session = Session::new("s", prefs.clone());
        machine
            .start_or_continue(&mut session, &search, &candidate("web_search", false, &[]))
            .expect("start");
        let ok = Answer(Ok("results"), None);
        let err = machine
            .dispatch(&mut session, &search, &ok, Duration::from_secs(1))
            .await
            .expect_err("collecting task");
        assert!(matches!(err, DispatchError::NotReady { status: TaskStatus::Collecting, .. }));

        machine
            .start_or_continue(
                &mut session,
                &search,
                &candidate("web_search", true, &[("query", "rust traits")]),
            )
            .expect("continue");
        machine.check_ready(&mut session, &search, &ctx).expect("check");
        let done = machine
            .dispatch(&mut session, &search, &ok, Duration::from_secs(1))
            .await
            .expect("dispatch");
        assert_eq!(done.result.output, "results");
        assert_eq!(done.result.metadata, json!({ "query": "rust traits" }));
        assert_eq!(done.task.status, TaskStatus::Dispatched);
        assert_eq!(done.task.previous_status(), Some(TaskStatus::Ready));
        assert!(session.current.is_none());
        assert_eq!(session.last_finished().map(|t| t.id.clone()), Some(done.task.id));
    }

    #[tokio::test]
    async fn failed_or_slow_execution_leaves_task_ready() {
        let machine = TaskMachine::default();
        let search = schema("web_search");
        let prefs = Preferences::default();
        let ctx = NormalizeContext::new(today(), &prefs);
        let mut session = Session::new("s", prefs.clone());
        machine
            .start_or_continue(
                &mut session,
                &search,
                &candidate("web_search", false, &[("query", "tides")]),
            )
            .expect("start");
        machine.check_ready(&mut session, &search, &ctx).expect("check");

        let failing = Answer(Err("backend down"), None);
        let err = machine
            .dispatch(&mut session, &search, &failing, Duration::from_secs(1))
            .await
            .expect_err("failure");
        assert!(matches!(err, DispatchError::ExecutionFailed { .. }));

        let slow = Answer(Ok("late"), Some(Duration::from_millis(200)));
        let err = machine
            .dispatch(&mut session, &search, &slow, Duration::from_millis(20))
            .await
            .expect_err("timeout");
        assert_eq!(
            err,
            DispatchError::TimedOut { tool: "web_search".to_string(), timeout_ms: 20 }
        );
        assert_eq!(session.current.as_ref().map(|t| t.status), Some(TaskStatus::Ready));
    }

    #[test]
    fn abandon_without_current_task_is_a_no_op() {
        let machine = TaskMachine::default();
        let mut session = Session::new("s", Preferences::default());
        assert_eq!(machine.abandon(&mut session, AbandonReason::Cancelled), Ok(None));
    }

    #[test]
    fn illegal_transition_is_reported() {
        let mut task = ActiveTask::new("web_search", Default::default());
        let err = transition(&mut task, TaskStatus::Dispatched).expect_err("illegal");
        assert_eq!(
            err.to_string(),
            format!("task `{}` cannot move from collecting to dispatched", task.id)
        );
    }
}

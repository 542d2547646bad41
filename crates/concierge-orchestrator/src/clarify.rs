use std::collections::{BTreeMap, HashMap};

use concierge_tools::Rejection;
use concierge_types::{ActiveTask, ClarificationRequest, ToolSchema};

const DEFAULT_TEMPLATE: &str = "What should the {field} be?";
const INVALID_LEAD: &str = "I couldn't use \"{value}\" for the {field} ({reason}).";

/// Prompt templates keyed `"<tool>.<field>"`, with `"<tool>.*"` and
/// `"*.<field>"` as fallbacks in that order. Placeholders: `{field}`,
/// `{tool}`.
#[derive(Debug, Clone, Default)]
pub struct PromptTemplates {
    templates: HashMap<String, String>,
}

impl PromptTemplates {
    pub fn builtin() -> Self {
        let pairs = [
            (
                "calendar_create.title",
                "I didn't catch the title for your event. What should I call it?",
            ),
            (
                "calendar_create.date",
                "What day is the event? (for example tomorrow, Friday or March 8)",
            ),
            ("calendar_create.time", "What time should it start? (for example 3pm or 15:00)"),
            ("reminder_create.title", "What should I remind you about?"),
            ("reminder_create.date", "Which day should I remind you?"),
            ("reminder_create.time", "What time should I remind you? (for example 9am)"),
            ("calendar_search.query", "Which event should I look for?"),
            ("email_send.to", "Who should I send this email to?"),
            ("email_send.subject", "What should the subject line be?"),
            ("weather.location", "Which city should I check the weather for?"),
            ("web_search.query", "What would you like me to search for?"),
            ("app_launch.app_name", "Which application would you like me to open?"),
            ("terminal.command", "Which command should I run?"),
            ("memory_lookup.query", "What should I try to remember?"),
            ("*.date", "Which day is that for?"),
            ("*.time", "What time should that be?"),
        ];
        Self {
            templates: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn with_overrides(mut self, overrides: &BTreeMap<String, String>) -> Self {
        for (key, template) in overrides {
            self.templates.insert(key.clone(), template.clone());
        }
        self
    }

    pub fn lookup(&self, tool: &str, field: &str) -> Option<&str> {
        [
            format!("{tool}.{field}"),
            format!("{tool}.*"),
            format!("*.{field}"),
        ]
        .iter()
        .find_map(|key| self.templates.get(key))
        .map(String::as_str)
    }
}

/// Turns a rejected validation into the single next question.
#[derive(Debug, Clone)]
pub struct ClarificationManager {
    templates: PromptTemplates,
}

impl Default for ClarificationManager {
    fn default() -> Self {
        Self::new(PromptTemplates::builtin())
    }
}

impl ClarificationManager {
    pub fn new(templates: PromptTemplates) -> Self {
        Self { templates }
    }

    /// Targets the first missing field in schema order, else the first invalid
    /// one, and counts one clarification round on `task`. Returns `None` only
    /// for an empty rejection, which leaves the task untouched.
    pub fn next_question(
        &self,
        task: &mut ActiveTask,
        schema: &ToolSchema,
        rejection: &Rejection,
        alternatives: Vec<String>,
    ) -> Option<ClarificationRequest> {
        let field = rejection
            .missing
            .first()
            .or_else(|| rejection.invalid.first().map(|f| &f.field))?
            .clone();
        let display = schema
            .get_field(&field)
            .map(|spec| spec.display_name())
            .unwrap_or_else(|| field.replace('_', " "));

        let question = self
            .templates
            .lookup(&schema.name, &field)
            .unwrap_or(DEFAULT_TEMPLATE)
            .replace("{field}", &display)
            .replace("{tool}", &schema.name.replace('_', " "));

        let mut parts = Vec::new();
        if let Some(invalid) = rejection.invalid_field(&field) {
            parts.push(
                INVALID_LEAD
                    .replace("{value}", &invalid.value)
                    .replace("{field}", &display)
                    .replace("{reason}", &invalid.reason),
            );
        }
        parts.push(question);
        let filled = task
            .fields
            .iter()
            .filter(|(name, _)| **name != field && rejection.invalid_field(name).is_none())
            .map(|(name, value)| format!("{}: {}", name.replace('_', " "), value.display()))
            .collect::<Vec<_>>();
        if !filled.is_empty() {
            parts.push(format!("I have: {}.", filled.join(", ")));
        }

        task.clarification_rounds = task.clarification_rounds.saturating_add(1);
        task.pending_field = Some(field.clone());
        task.touch();

        Some(ClarificationRequest {
            tool: schema.name.clone(),
            field,
            prompt: parts.join(" "),
            round: task.clarification_rounds,
            alternatives,
        })
    }
}

use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use concierge_types::{FieldSpec, FieldType, ToolSchema};

use crate::{Hypothesis, LanguageOracle, OracleRequest};

struct IntentRule {
    tool: &'static str,
    patterns: Vec<Regex>,
}

fn rule(tool: &'static str, patterns: &[&str]) -> IntentRule {
    IntentRule {
        tool,
        patterns: patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).expect("intent regex"))
            .collect(),
    }
}

static RULES: Lazy<Vec<IntentRule>> = Lazy::new(|| {
    vec![
        rule(
            "calendar_create",
            &[
                r"\b(schedule|create|add|plan|set up|book)\b.*\b(meeting|event|appointment)\b",
                r"\b(tomorrow|today|tonight|next week|next month)\b.*\b(at|@)\b.*\d+",
                r"\b(gym|workout|dinner|lunch|meeting)\b.*\b(at|@)\b.*\d+",
                r"\bgoing to\b.*\b(gym|meeting|appointment|dinner|lunch)\b",
                r"\b(calendar|schedule)\b.*\b(for|at)\b",
            ],
        ),
        rule(
            "reminder_create",
            &[
                r"\bremind me\b",
                r"\b(set|add|create)\b.*\breminder\b",
                r"\bdon'?t let me forget\b",
                r"\b(tomorrow|today|tonight|next week)\b.*\b(at|@)\b.*\d+",
            ],
        ),
        rule(
            "calendar_check",
            &[
                r"\b(check|show|what's|whats)\b.*\b(calendar|schedule|events|meetings)\b",
                r"\b(what do i have|what's on my)\b",
                r"\b(upcoming|next)\b.*\b(events|meetings|appointments)\b",
                r"\b(free|available|busy)\b.*\b(today|tomorrow|next week)\b",
            ],
        ),
        rule(
            "calendar_search",
            &[
                r"\b(find|search|look for)\b.*\b(event|meeting|appointment)s?\b",
                r"\b(when was|when is|when's)\b.*\b(meeting|event|appointment)\b",
            ],
        ),
        rule(
            "email_send",
            &[
                r"\b(send|write|compose)\b.*\b(email|message|mail)\b",
                r"\b(email|mail)\b.*\b(to|about)\b",
                r"[\w.+-]+@[\w-]+\.[\w.]+",
            ],
        ),
        rule(
            "email_read",
            &[
                r"\b(check|read|show)\b.*\b(email|emails|mail|inbox)\b",
                r"\b(any new|latest|unread)\b.*\b(email|emails|mail|messages)\b",
            ],
        ),
        rule(
            "weather",
            &[
                r"\b(weather|temperature|forecast)\b",
                r"\b(how's|what's|whats)\b.*\b(weather|temperature)\b",
                r"\b(rain|raining|sunny|cloudy|hot|cold|umbrella)\b.*\b(today|tomorrow|outside)\b",
            ],
        ),
        rule(
            "web_search",
            &[
                r"\b(search|google|look up)\b",
                r"\b(what is|who is|how to)\b",
                r"\b(browse|web|internet)\b",
            ],
        ),
        rule(
            "app_launch",
            &[
                r"\b(open|launch|start)\b.*\b(app|application|program)\b",
                r"\b(open|launch|start)\s+(chrome|firefox|safari|spotify|slack|discord|teams|terminal|notes)\b",
            ],
        ),
        rule(
            "terminal",
            &[
                r"\b(run|execute)\s+((the|a)\s+)?(shell\s+)?command\b",
                r"\bin (the |a )?(terminal|shell)\b",
                r"\bgit\s+(status|commit|push|pull|log|diff)\b",
                r"\b(npm|pip|cargo|docker)\s+\w+",
                r"\b(run|execute)\s+(sudo|ls|pwd|cat|echo|make|python3?|git|npm|pip|cargo|docker)\b",
            ],
        ),
        rule(
            "memory_lookup",
            &[
                r"\b(remember|recall)\b.*\b(say|said|tell|told|mention|mentioned)\b",
                r"\bwhat did (i|we|you)\b",
                r"\b(previous|earlier|before|last time)\b.*\b(conversation|discussion|talked|chat)\b",
            ],
        ),
    ]
});

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("extractor regex")
}

static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:(?:the )?day after tomorrow|today|tonight|tomorrow(?: morning| afternoon| evening| night)?|yesterday|next week|next month|in (?:\d+|an?|one|two|three|four|five|six|seven|eight|nine|ten) (?:days?|weeks?)|(?:next |this )?(?:monday|tuesday|wednesday|thursday|friday|saturday|sunday)|\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{4}|(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.? \d{1,2}(?:st|nd|rd|th)?(?:,? \d{4})?|\d{1,2}(?:st|nd|rd|th)? (?:of )?(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*(?: \d{4})?)\b")
});
static TIME_RE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:\d{1,2}(?::\d{2})?\s*(?:(?:am|pm)\b|a\.m\.|p\.m\.)|\d{1,2}(?::\d{2})?\s+(?:in the (?:morning|afternoon|evening)|at night)|\d{1,2}:\d{2}|\d{1,2}\s*o'?clock(?:\s*(?:am|pm)\b)?|noon|midnight)")
});
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| re(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}"));
static REMIND_TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:remind me (?:to|about)|don'?t let me forget (?:to|about)?)\s*(.+?)(?:\s+(?:tomorrow|today|tonight|on|at|by|next|this|in)\b.*)?[.?!]?$")
});
static GOING_TO_RE: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)\bgoing to (?:the |a |an )?([\w'-]+)"));
static SCHEDULE_TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:schedule|book|create|add|plan|set up)\s+(?:a |an |the |my )?(.+?)(?:\s+(?:at|for|on|tomorrow|today|tonight|next|this|with|in)\b.*)?[.?!]?$")
});
static ACTIVITY_RE: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)\b(gym|workout|dinner|lunch|breakfast|meeting|call)\b.*\b(?:at|@)\s*\d"));
static SUBJECT_RE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:about|regarding|subject:?)\s+(.+?)(?:\s+(?:saying|that says)\b.*)?[.?!]?$")
});
static BODY_RE: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)\b(?:saying|that says)\s+(.+?)[.?!]?$"));
static SEARCH_QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:search(?: the web)? for|look up|google|find out|find)\s+(.+?)[.?!]?$")
});
static QUESTION_QUERY_RE: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)\b((?:what is|who is|how to)\s+.+?)[.?!]?$"));
static MEMORY_QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:remember|recall|what did (?:i|we|you) (?:say|tell you|mention))\s+(?:about\s+)?(.+?)[.?!]?$")
});
static CALENDAR_QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:find|search(?: for)?|look for|when (?:was|is)|when's)\s+(?:my |the |a |an )?(.+?)(?:\s+(?:event|meeting|appointment)s?)?[.?!]?$")
});
static COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    re(r#"(?i)\b(?:run|execute)\s+(?:(?:the|a)\s+)?(?:shell\s+)?(?:command\s*)?["'`]?(.+?)["'`]?(?:\s+in (?:the |a )?(?:terminal|shell))?[.?!]?$"#)
});
static TOOLING_COMMAND_RE: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)\b((?:git|npm|pip|cargo|docker)\s+.+?)[.?!]?$"));
static APP_RE: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)\b(?:open|launch|start)\s+(?:the\s+)?([\w.]+)"));
static LOCATION_RE: Lazy<Regex> =
    Lazy::new(|| re(r"\b(?:in|for|at)\s+([A-Z][\w'-]*(?:\s+[A-Z][\w'-]*)*)"));
static ANSWER_LEAD_RE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)^(?:it'?s|it is|call it|make it|name it|the|to|for|at|on|uh|um|ok|okay)\s+")
});

const GENERIC_TITLES: &[&str] = &[
    "meeting",
    "event",
    "appointment",
    "reminder",
    "something",
    "it",
    "calendar event",
];

/// Offline oracle built from regex intent rules and field extractors.
///
/// A tool scores 0.6 for its first matching pattern and 0.15 for each
/// further one, capped at 0.95. Utterances that match no rule but arrive
/// while a task awaits a field are read as the answer to that question.
#[derive(Debug, Clone, Default)]
pub struct KeywordOracle;

impl KeywordOracle {
    pub fn new() -> Self {
        Self
    }
}

fn score(matches: usize) -> f32 {
    if matches == 0 {
        0.0
    } else {
        (0.6 + 0.15 * (matches as f32 - 1.0)).min(0.95)
    }
}

fn capture(regex: &Regex, text: &str) -> Option<String> {
    regex
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn title_for(tool: &str, text: &str) -> Option<String> {
    let title = match tool {
        "reminder_create" => capture(&REMIND_TITLE_RE, text),
        _ => capture(&GOING_TO_RE, text)
            .or_else(|| capture(&SCHEDULE_TITLE_RE, text))
            .or_else(|| capture(&ACTIVITY_RE, text)),
    }?;
    let lowered = title.to_lowercase();
    if GENERIC_TITLES.contains(&lowered.as_str()) {
        None
    } else {
        Some(title)
    }
}

fn extract_field(tool: &str, spec: &FieldSpec, text: &str) -> Option<String> {
    match &spec.field_type {
        FieldType::Date => DATE_RE.find(text).map(|m| m.as_str().to_string()),
        FieldType::Time => TIME_RE.find(text).map(|m| m.as_str().to_string()),
        FieldType::Enum { options } => {
            let lowered = text.to_lowercase();
            options
                .iter()
                .find(|opt| {
                    lowered
                        .split(|c: char| !c.is_alphanumeric())
                        .any(|word| word == opt.to_lowercase())
                })
                .cloned()
        }
        FieldType::String | FieldType::FreeText => match (tool, spec.name.as_str()) {
            (_, "title") => title_for(tool, text),
            (_, "to") => EMAIL_RE.find(text).map(|m| m.as_str().to_string()),
            (_, "subject") => capture(&SUBJECT_RE, text),
            (_, "body") => capture(&BODY_RE, text),
            ("memory_lookup", "query") => capture(&MEMORY_QUERY_RE, text),
            ("calendar_search", "query") => capture(&CALENDAR_QUERY_RE, text),
            (_, "command") => capture(&COMMAND_RE, text)
                .filter(|cmd| !cmd.eq_ignore_ascii_case("command"))
                .or_else(|| capture(&TOOLING_COMMAND_RE, text)),
            (_, "query") => capture(&SEARCH_QUERY_RE, text)
                .or_else(|| capture(&QUESTION_QUERY_RE, text)),
            (_, "app_name") => capture(&APP_RE, text)
                .filter(|app| !matches!(app.to_lowercase().as_str(), "app" | "application" | "program")),
            (_, "location") => capture(&LOCATION_RE, text),
            _ => None,
        },
    }
}

fn extract_fields(schema: &ToolSchema, text: &str) -> BTreeMap<String, String> {
    schema
        .fields
        .iter()
        .filter_map(|spec| extract_field(&schema.name, spec, text).map(|v| (spec.name.clone(), v)))
        .collect()
}

/// Strips conversational lead-ins from a bare answer ("it's call Jim" -> "call Jim").
fn clean_answer(text: &str) -> String {
    let mut answer = text.trim().trim_end_matches(['.', '!', '?']).to_string();
    while let Some(m) = ANSWER_LEAD_RE.find(&answer) {
        answer = answer[m.end()..].to_string();
    }
    answer.trim().to_string()
}

#[async_trait]
impl LanguageOracle for KeywordOracle {
    fn id(&self) -> &str {
        "keyword"
    }

    async fn infer(&self, request: &OracleRequest<'_>) -> anyhow::Result<Vec<Hypothesis>> {
        let text = request.utterance;
        let current_tool = request.current_task.as_ref().map(|t| t.tool.as_str());
        let mut hypotheses = Vec::new();
        let mut any_rule_matched = false;

        for schema in request.tools {
            let matches = RULES
                .iter()
                .find(|r| r.tool == schema.name)
                .map(|r| r.patterns.iter().filter(|p| p.is_match(text)).count())
                .unwrap_or(0);
            let is_current = current_tool == Some(schema.name.as_str());
            if matches == 0 && !is_current {
                continue;
            }
            if matches > 0 && !is_current {
                any_rule_matched = true;
            }
            let fields = extract_fields(schema, text);
            let mut confidence = score(matches);
            if is_current && !fields.is_empty() {
                confidence = confidence.max(0.5);
            }
            if confidence > 0.0 {
                hypotheses.push(Hypothesis {
                    tool: schema.name.clone(),
                    confidence,
                    fields,
                });
            }
        }

        if let Some(context) = &request.current_task {
            let awaiting = context.awaiting_field.as_deref();
            let schema = request.tools.iter().find(|s| s.name == context.tool);
            if let (Some(field), Some(schema), false) = (awaiting, schema, any_rule_matched) {
                let answer = clean_answer(text);
                let is_text = schema
                    .get_field(field)
                    .map(|spec| matches!(spec.field_type, FieldType::String | FieldType::FreeText))
                    .unwrap_or(false);
                let short = answer.split_whitespace().count() <= 4;
                let slot = hypotheses.iter_mut().find(|h| h.tool == context.tool);
                let already = slot.as_ref().is_some_and(|h| h.fields.contains_key(field));
                if !answer.is_empty() && !already && (is_text || short) {
                    match slot {
                        Some(h) => {
                            h.fields.insert(field.to_string(), answer);
                        }
                        None => hypotheses.push(
                            Hypothesis::new(context.tool.clone(), 0.5).with_field(field, answer),
                        ),
                    }
                }
            }
        }

        hypotheses.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(hypotheses)
    }
}

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use concierge_providers::{Hypothesis, LanguageOracle, OracleRequest, TaskContext};
use concierge_tools::ToolRegistry;
use concierge_types::{
    FieldMap, FieldValue, IntentCandidate, Preferences, Session, Speaker, TaskStatus, ToolSchema,
};

use crate::config::RouterConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("oracle `{oracle}` did not answer within {timeout_ms}ms")]
    OracleTimeout { oracle: String, timeout_ms: u64 },
    #[error("oracle `{oracle}` failed: {message}")]
    OracleFailed { oracle: String, message: String },
}

/// Ranked candidates for one utterance, best first. Empty means nothing
/// cleared the confidence floor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routing {
    pub candidates: Vec<IntentCandidate>,
    pub topic_switch: bool,
}

impl Routing {
    pub fn primary(&self) -> Option<&IntentCandidate> {
        self.candidates.first()
    }

    /// Tool names of the fallback candidates, excluding the primary's tool.
    pub fn alternatives(&self) -> Vec<String> {
        let primary = self.primary().map(|c| c.tool.as_str());
        self.candidates
            .iter()
            .skip(1)
            .filter(|c| Some(c.tool.as_str()) != primary)
            .map(|c| c.tool.clone())
            .collect()
    }
}

pub struct IntentRouter {
    registry: ToolRegistry,
    oracle: Arc<dyn LanguageOracle>,
    config: RouterConfig,
}

impl IntentRouter {
    pub fn new(registry: ToolRegistry, oracle: Arc<dyn LanguageOracle>, config: RouterConfig) -> Self {
        Self {
            registry,
            oracle,
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn oracle_id(&self) -> &str {
        self.oracle.id()
    }

    /// Asks the oracle once, then filters, demotes, biases toward the
    /// collecting task, ranks and applies the floor.
    pub async fn route(&self, utterance: &str, session: &Session) -> Result<Routing, RouteError> {
        let request = OracleRequest {
            utterance,
            tools: self.registry.all(),
            current_task: session.current.as_ref().map(TaskContext::from_task),
            recent_turns: session
                .recent_turns
                .iter()
                .map(|turn| {
                    let who = match turn.speaker {
                        Speaker::User => "user",
                        Speaker::Assistant => "assistant",
                    };
                    format!("{who}: {}", turn.text)
                })
                .collect(),
        };

        let timeout_ms = self.config.oracle_timeout_ms;
        let hypotheses = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.oracle.infer(&request),
        )
        .await
        {
            Ok(Ok(hypotheses)) => hypotheses,
            Ok(Err(err)) => {
                return Err(RouteError::OracleFailed {
                    oracle: self.oracle.id().to_string(),
                    message: err.to_string(),
                })
            }
            Err(_) => {
                return Err(RouteError::OracleTimeout {
                    oracle: self.oracle.id().to_string(),
                    timeout_ms,
                })
            }
        };

        Ok(self.rank(utterance, session, hypotheses))
    }

    fn rank(&self, utterance: &str, session: &Session, hypotheses: Vec<Hypothesis>) -> Routing {
        let mut candidates: Vec<IntentCandidate> = Vec::new();
        for hypothesis in hypotheses {
            let Ok(schema) = self.registry.lookup(&hypothesis.tool) else {
                warn!(tool = %hypothesis.tool, oracle = self.oracle.id(), "oracle named an unknown tool");
                continue;
            };
            let mut candidate = IntentCandidate::new(
                hypothesis.tool.clone(),
                sanitize_confidence(hypothesis.confidence),
            );
            candidate.fields = schema_fields(schema, hypothesis);
            if !has_evidence(schema, &candidate.fields, &session.preferences) {
                candidate.confidence *= self.config.no_evidence_penalty;
            }
            match candidates.iter_mut().find(|c| c.tool == candidate.tool) {
                Some(existing) if existing.confidence >= candidate.confidence => {}
                Some(existing) => *existing = candidate,
                None => candidates.push(candidate),
            }
        }

        let collecting = session
            .current
            .as_ref()
            .filter(|task| task.status == TaskStatus::Collecting);
        let mut topic_switch = false;
        if let Some(task) = collecting {
            topic_switch = contains_phrase(utterance, &self.config.new_task_phrases)
                || candidates.iter().any(|c| {
                    c.tool != task.tool
                        && c.confidence >= self.config.topic_switch_confidence
                        && self
                            .registry
                            .lookup(&c.tool)
                            .map(|schema| schema.required_fields().any(|f| c.fields.contains_key(&f.name)))
                            .unwrap_or(false)
                });
            if !topic_switch {
                match candidates.iter_mut().find(|c| c.tool == task.tool) {
                    Some(current) => {
                        current.confidence = (current.confidence + self.config.continuity_margin).min(1.0);
                        current.continues_current = true;
                    }
                    None => {
                        let mut synthetic = IntentCandidate::new(
                            task.tool.clone(),
                            self.config.continuity_margin.max(self.config.confidence_floor),
                        );
                        synthetic.continues_current = true;
                        candidates.push(synthetic);
                    }
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.continues_current.cmp(&a.continues_current))
                .then_with(|| self.registry.position(&a.tool).cmp(&self.registry.position(&b.tool)))
        });
        candidates.retain(|c| c.confidence >= self.config.confidence_floor);

        debug!(
            oracle = self.oracle.id(),
            topic_switch,
            ranked = ?candidates.iter().map(|c| (c.tool.as_str(), c.confidence)).collect::<Vec<_>>(),
            "routed utterance"
        );
        Routing {
            candidates,
            topic_switch,
        }
    }
}

fn sanitize_confidence(raw: f32) -> f32 {
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 1.0)
    }
}

fn schema_fields(schema: &ToolSchema, hypothesis: Hypothesis) -> FieldMap {
    hypothesis
        .fields
        .into_iter()
        .filter(|(name, value)| {
            let known = schema.has_field(name);
            if !known {
                debug!(tool = %schema.name, field = %name, "dropping field outside schema");
            }
            known && !value.trim().is_empty()
        })
        .map(|(name, value)| (name, FieldValue::raw(value)))
        .collect()
}

/// A tool with required fields needs at least one of them extracted, or
/// available from a session preference, to count as supported.
fn has_evidence(schema: &ToolSchema, fields: &FieldMap, preferences: &Preferences) -> bool {
    if !schema.has_required_fields() {
        return true;
    }
    schema.required_fields().any(|spec| {
        fields.contains_key(&spec.name)
            || spec
                .preference_default
                .as_deref()
                .and_then(|key| preferences.get(key))
                .is_some()
    })
}

const FILLER_WORDS: &[&str] = &[
    "ok", "okay", "no", "please", "actually", "just", "oh", "um", "uh", "hey",
];

fn normalize_phrase(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when the whole utterance, minus leading filler and a trailing
/// "please", is one of `phrases`.
pub fn matches_command(utterance: &str, phrases: &[String]) -> bool {
    let normalized = normalize_phrase(utterance);
    let mut words = normalized.split(' ').filter(|w| !w.is_empty()).collect::<Vec<_>>();
    while words.first().is_some_and(|w| FILLER_WORDS.contains(w)) {
        words.remove(0);
    }
    while words.last().is_some_and(|w| matches!(*w, "please" | "thanks")) {
        words.pop();
    }
    if words.is_empty() {
        return false;
    }
    let core = words.join(" ");
    phrases.iter().any(|p| normalize_phrase(p) == core)
}

/// Word-boundary containment of any phrase.
pub fn contains_phrase(utterance: &str, phrases: &[String]) -> bool {
    let padded = format!(" {} ", normalize_phrase(utterance));
    phrases.iter().any(|p| {
        let phrase = normalize_phrase(p);
        !phrase.is_empty() && padded.contains(&format!(" {phrase} "))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_providers::ScriptedOracle;
    use concierge_types::ActiveTask;

    fn router(oracle: ScriptedOracle) -> IntentRouter {
        IntentRouter::new(
            ToolRegistry::with_builtin_tools().expect("registry"),
            Arc::new(oracle),
            RouterConfig::default(),
        )
    }

    fn tools(routing: &Routing) -> Vec<&str> {
        routing.candidates.iter().map(|c| c.tool.as_str()).collect()
    }

    fn collecting(session: &mut Session, tool: &str) {
        session.current = Some(ActiveTask::new(tool, FieldMap::new()));
    }

    #[tokio::test]
    async fn unsupported_high_prior_tool_is_demoted() {
        let oracle = ScriptedOracle::new().on(
            "I'm going to the gym",
            vec![
                Hypothesis::new("email_send", 0.8),
                Hypothesis::new("calendar_create", 0.6).with_field("title", "gym"),
            ],
        );
        let session = Session::new("s", Preferences::default());
        let routing = router(oracle)
            .route("I'm going to the gym", &session)
            .await
            .expect("route");
        assert_eq!(routing.primary().map(|c| c.tool.as_str()), Some("calendar_create"));
        assert_eq!(routing.alternatives(), vec!["email_send".to_string()]);
        let email = &routing.candidates[1];
        assert!((email.confidence - 0.48).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unknown_tools_fields_and_low_confidence_are_dropped() {
        let oracle = ScriptedOracle::new().on(
            "play some jazz",
            vec![
                Hypothesis::new("music_play", 0.95),
                Hypothesis::new("web_search", 0.5)
                    .with_field("query", "jazz")
                    .with_field("genre", "jazz")
                    .with_field("", "x"),
                Hypothesis::new("app_launch", 0.2).with_field("app_name", "Spotify"),
            ],
        );
        let session = Session::new("s", Preferences::default());
        let routing = router(oracle).route("play some jazz", &session).await.expect("route");
        assert_eq!(tools(&routing), vec!["web_search"]);
        let fields = &routing.candidates[0].fields;
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("query"), Some(&FieldValue::raw("jazz")));
    }

    #[tokio::test]
    async fn nothing_above_floor_is_empty() {
        let oracle =
            ScriptedOracle::new().on("hmm", vec![Hypothesis::new("web_search", 0.3).with_field("query", "hmm")]);
        let session = Session::new("s", Preferences::default());
        let routing = router(oracle).route("hmm", &session).await.expect("route");
        assert!(routing.candidates.is_empty());
    }

    #[tokio::test]
    async fn preference_default_counts_as_evidence() {
        let oracle = ScriptedOracle::new().on("how's the weather", vec![Hypothesis::new("weather", 0.7)]);
        let prefs = Preferences {
            location: Some("Oslo".to_string()),
            ..Preferences::default()
        };
        let with_default = Session::new("s", prefs);
        let routing = router(oracle.clone())
            .route("how's the weather", &with_default)
            .await
            .expect("route");
        assert!((routing.candidates[0].confidence - 0.7).abs() < 1e-6);

        let without = Session::new("s", Preferences::default());
        let routing = router(oracle).route("how's the weather", &without).await.expect("route");
        assert!((routing.candidates[0].confidence - 0.42).abs() < 1e-6);
    }

    #[tokio::test]
    async fn collecting_task_gets_boost_or_synthetic_continuation() {
        let oracle = ScriptedOracle::new()
            .on(
                "at 3pm",
                vec![
                    Hypothesis::new("calendar_create", 0.5).with_field("time", "3pm"),
                    Hypothesis::new("reminder_create", 0.55).with_field("time", "3pm"),
                ],
            )
            .on("the dentist", vec![]);
        let router = router(oracle);
        let mut session = Session::new("s", Preferences::default());
        collecting(&mut session, "calendar_create");

        let boosted = router.route("at 3pm", &session).await.expect("route");
        let primary = boosted.primary().expect("primary");
        assert_eq!(primary.tool, "calendar_create");
        assert!(primary.continues_current);
        assert!((primary.confidence - 0.75).abs() < 1e-6);
        assert!(!boosted.candidates[1].continues_current);

        let vague = router.route("the dentist", &session).await.expect("route");
        assert_eq!(tools(&vague), vec!["calendar_create"]);
        assert!(vague.candidates[0].continues_current);
        assert!(vague.candidates[0].fields.is_empty());
        assert!((vague.candidates[0].confidence - 0.35).abs() < 1e-6);
    }

    #[tokio::test]
    async fn strong_supported_other_tool_is_a_topic_switch() {
        let oracle = ScriptedOracle::new().on(
            "what's the weather in Paris",
            vec![
                Hypothesis::new("weather", 0.9).with_field("location", "Paris"),
                Hypothesis::new("reminder_create", 0.4),
            ],
        );
        let mut session = Session::new("s", Preferences::default());
        collecting(&mut session, "reminder_create");
        let routing = router(oracle)
            .route("what's the weather in Paris", &session)
            .await
            .expect("route");
        assert!(routing.topic_switch);
        assert_eq!(tools(&routing), vec!["weather"]);
        assert!(!routing.candidates[0].continues_current);
    }

    #[tokio::test]
    async fn new_task_phrase_suppresses_continuity() {
        let oracle = ScriptedOracle::new().on(
            "search for flights instead",
            vec![Hypothesis::new("web_search", 0.5).with_field("query", "flights")],
        );
        let mut session = Session::new("s", Preferences::default());
        collecting(&mut session, "email_send");
        let routing = router(oracle)
            .route("search for flights instead", &session)
            .await
            .expect("route");
        assert!(routing.topic_switch);
        assert_eq!(tools(&routing), vec!["web_search"]);
    }

    #[tokio::test]
    async fn ties_follow_registry_order() {
        let oracle = ScriptedOracle::new().on(
            "gym at 6pm tomorrow",
            vec![
                Hypothesis::new("reminder_create", 0.6).with_field("title", "gym"),
                Hypothesis::new("calendar_create", 0.6).with_field("title", "gym"),
            ],
        );
        let session = Session::new("s", Preferences::default());
        let routing = router(oracle)
            .route("gym at 6pm tomorrow", &session)
            .await
            .expect("route");
        assert_eq!(tools(&routing), vec!["calendar_create", "reminder_create"]);
    }

    #[tokio::test]
    async fn oracle_timeout_and_failure_are_distinct() {
        let slow = IntentRouter::new(
            ToolRegistry::with_builtin_tools().expect("registry"),
            Arc::new(ScriptedOracle::new().with_delay(Duration::from_millis(200))),
            RouterConfig {
                oracle_timeout_ms: 20,
                ..RouterConfig::default()
            },
        );
        let session = Session::new("s", Preferences::default());
        let err = slow.route("hello", &session).await.expect_err("timeout");
        assert_eq!(
            err,
            RouteError::OracleTimeout {
                oracle: "scripted".to_string(),
                timeout_ms: 20
            }
        );

        let broken = router(ScriptedOracle::new().failing("model offline"));
        let err = broken.route("hello", &session).await.expect_err("failure");
        assert!(matches!(err, RouteError::OracleFailed { ref message, .. } if message == "model offline"));
    }

    #[tokio::test]
    async fn oracle_sees_current_task_and_recent_turns() {
        let oracle = ScriptedOracle::new();
        let router = router(oracle.clone());
        let mut session = Session::new("s", Preferences::default());
        collecting(&mut session, "weather");
        if let Some(task) = session.current.as_mut() {
            task.pending_field = Some("location".to_string());
        }
        session.record_turn(Speaker::User, "weather please", 12);
        router.route("Berlin", &session).await.expect("route");
        let seen = oracle.requests().await;
        let context = seen[0].1.as_ref().expect("context");
        assert_eq!(context.tool, "weather");
        assert_eq!(context.awaiting_field.as_deref(), Some("location"));
    }

    #[test]
    fn commands_match_whole_utterance_minus_filler() {
        let cancel = RouterConfig::default().cancel_phrases;
        assert!(matches_command("Cancel that.", &cancel));
        assert!(matches_command("oh, never mind", &cancel));
        assert!(matches_command("okay just stop please", &cancel));
        assert!(!matches_command("stop the music", &cancel));
        assert!(!matches_command("please", &cancel));
        assert!(contains_phrase("Start over: new email", &RouterConfig::default().new_task_phrases));
        assert!(!contains_phrase("steady", &["instead".to_string()]));
    }
}

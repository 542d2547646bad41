use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{Hypothesis, LanguageOracle, OracleRequest};

/// Oracle backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatOracle {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl ChatOracle {
    pub fn new(base_url: &str, model: String, api_key: Option<String>) -> Self {
        Self {
            base_url: normalize_base(base_url),
            model,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client: Client::new(),
        }
    }
}

const INSTRUCTION: &str = "You route requests for a personal assistant. \
Given the user's utterance, the tool catalog and the task currently in progress, \
reply with ONLY a JSON array. Each element is \
{\"tool\": <catalog name>, \"confidence\": <0..1>, \"fields\": {<field name>: <text as the user said it>}}. \
List every plausible tool, most likely first. Copy dates and times verbatim (\"tomorrow\", \"2pm\"); \
do not convert them. Omit fields you cannot find. Reply [] when no tool fits.";

pub(crate) fn build_prompt(request: &OracleRequest<'_>) -> String {
    let catalog = request
        .tools
        .iter()
        .map(|t| t.catalog_entry())
        .collect::<Vec<_>>();
    let context = json!({
        "utterance": request.utterance,
        "tools": catalog,
        "current_task": request.current_task,
        "recent_turns": request.recent_turns,
    });
    format!("{INSTRUCTION}\n\n{context}")
}

#[derive(Deserialize)]
struct WireHypothesis {
    tool: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

/// Reads the model's reply as a hypothesis list, tolerating code fences and
/// chatter around the array.
pub(crate) fn parse_hypotheses(text: &str) -> anyhow::Result<Vec<Hypothesis>> {
    let start = text.find('[');
    let end = text.rfind(']');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => anyhow::bail!(
            "oracle reply is not a JSON array: {}",
            truncate_for_error(text, 200)
        ),
    };
    let wire: Vec<WireHypothesis> = serde_json::from_str(body)?;
    Ok(wire
        .into_iter()
        .map(|h| Hypothesis {
            tool: h.tool,
            confidence: h.confidence.clamp(0.0, 1.0),
            fields: h
                .fields
                .into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k, s)),
                    Value::Null => None,
                    other => Some((k, other.to_string())),
                })
                .collect::<BTreeMap<_, _>>(),
        })
        .collect())
}

#[async_trait]
impl LanguageOracle for ChatOracle {
    fn id(&self) -> &str {
        "chat"
    }

    async fn infer(&self, request: &OracleRequest<'_>) -> anyhow::Result<Vec<Hypothesis>> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(&json!({
            "model": self.model,
            "messages": [{"role": "user", "content": build_prompt(request)}],
            "temperature": 0,
            "stream": false,
        }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("oracle request failed with status {}", status));
            anyhow::bail!(detail);
        }
        let Some(text) = extract_openai_text(&value) else {
            anyhow::bail!(
                "oracle returned no completion content for model `{}` (response: {})",
                self.model,
                truncate_for_error(&value.to_string(), 500)
            );
        };
        debug!(model = %self.model, "oracle replied");
        parse_hypotheses(&text)
    }
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut cut = max_len;
    while !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &input[..cut])
}

fn extract_openai_text(value: &Value) -> Option<String> {
    value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|choice| {
            choice
                .get("message")
                .and_then(|m| m.get("content"))
                .or_else(|| choice.get("text"))
        })
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

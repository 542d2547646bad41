use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use concierge_types::{ActiveTask, ToolSchema};

mod chat;
mod keyword;
mod scripted;

pub use chat::ChatOracle;
pub use keyword::KeywordOracle;
pub use scripted::ScriptedOracle;

/// One plausible reading of an utterance as returned by an oracle: a tool,
/// how sure the oracle is, and whatever raw field text it could pull out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub tool: String,
    pub confidence: f32,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Hypothesis {
    pub fn new(tool: impl Into<String>, confidence: f32) -> Self {
        Self {
            tool: tool.into(),
            confidence,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// The session's current task as shown to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub tool: String,
    pub status: String,
    pub filled: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_field: Option<String>,
}

impl TaskContext {
    pub fn from_task(task: &ActiveTask) -> Self {
        Self {
            tool: task.tool.clone(),
            status: task.status.as_str().to_string(),
            filled: task
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.display()))
                .collect(),
            awaiting_field: task.pending_field.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OracleRequest<'a> {
    pub utterance: &'a str,
    pub tools: &'a [ToolSchema],
    pub current_task: Option<TaskContext>,
    pub recent_turns: Vec<String>,
}

#[async_trait]
pub trait LanguageOracle: Send + Sync {
    fn id(&self) -> &str;
    async fn infer(&self, request: &OracleRequest<'_>) -> anyhow::Result<Vec<Hypothesis>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    #[default]
    Keyword,
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OracleConfig {
    #[serde(default)]
    pub kind: OracleKind,
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

pub fn build_oracle(config: &OracleConfig) -> anyhow::Result<Arc<dyn LanguageOracle>> {
    match config.kind {
        OracleKind::Keyword => Ok(Arc::new(KeywordOracle::new())),
        OracleKind::Chat => {
            let Some(url) = config.url.as_deref().filter(|u| !u.trim().is_empty()) else {
                anyhow::bail!("chat oracle needs `oracle.url` (or CONCIERGE_ORACLE_URL)");
            };
            let model = config
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "gpt-4o-mini".to_string());
            Ok(Arc::new(ChatOracle::new(url, model, config.api_key.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_oracle_requires_url() {
        let config = OracleConfig {
            kind: OracleKind::Chat,
            ..OracleConfig::default()
        };
        let err = build_oracle(&config).err().expect("missing url");
        assert!(err.to_string().contains("oracle.url"));
    }

    #[test]
    fn default_config_builds_keyword_oracle() {
        let oracle = build_oracle(&OracleConfig::default()).expect("oracle");
        assert_eq!(oracle.id(), "keyword");
    }
}

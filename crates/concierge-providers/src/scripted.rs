use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{Hypothesis, LanguageOracle, OracleRequest, TaskContext};

/// Answers from fixed fixtures keyed by utterance (case and surrounding
/// whitespace ignored). Unknown utterances yield no hypotheses.
#[derive(Clone, Default)]
pub struct ScriptedOracle {
    fixtures: HashMap<String, Vec<Hypothesis>>,
    delay: Option<Duration>,
    failure: Option<String>,
    seen: Arc<Mutex<Vec<(String, Option<TaskContext>)>>>,
}

fn fixture_key(utterance: &str) -> String {
    utterance.trim().to_lowercase()
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, utterance: &str, hypotheses: Vec<Hypothesis>) -> Self {
        self.fixtures.insert(fixture_key(utterance), hypotheses);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Utterances received so far with the task context that came with them.
    pub async fn requests(&self) -> Vec<(String, Option<TaskContext>)> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl LanguageOracle for ScriptedOracle {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn infer(&self, request: &OracleRequest<'_>) -> anyhow::Result<Vec<Hypothesis>> {
        self.seen
            .lock()
            .await
            .push((request.utterance.to_string(), request.current_task.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            anyhow::bail!(message.clone());
        }
        Ok(self
            .fixtures
            .get(&fixture_key(request.utterance))
            .cloned()
            .unwrap_or_default())
    }
}

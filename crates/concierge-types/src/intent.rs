use serde::{Deserialize, Serialize};

use crate::FieldMap;

/// One routed reading of an utterance. Lives for a single turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentCandidate {
    pub tool: String,
    pub confidence: f32,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub continues_current: bool,
}

impl IntentCandidate {
    pub fn new(tool: impl Into<String>, confidence: f32) -> Self {
        Self {
            tool: tool.into(),
            confidence,
            fields: FieldMap::new(),
            continues_current: false,
        }
    }
}

/// The single question asked after a rejected validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub tool: String,
    pub field: String,
    pub prompt: String,
    pub round: u32,
    /// Other tools the router considered, offered if the user rejects the reading.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<String>,
}

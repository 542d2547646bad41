use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::ActiveTask;

/// Per-user defaults consulted by normalizers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Preferences {
    #[serde(default)]
    pub timezone_offset_minutes: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Preferences {
    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "location" => self.location.as_deref(),
            other => self.extra.get(other).map(String::as_str),
        }
        .filter(|v| !v.trim().is_empty())
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.timezone_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn local_today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset()).date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Conversation-scoped state. Exactly one task may be current; finished
/// tasks move into a bounded history and are never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<ActiveTask>,
    #[serde(default)]
    pub history: VecDeque<ActiveTask>,
    #[serde(default)]
    pub recent_turns: VecDeque<TurnRecord>,
    #[serde(default)]
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, preferences: Preferences) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            current: None,
            history: VecDeque::new(),
            recent_turns: VecDeque::new(),
            preferences,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn record_turn(&mut self, speaker: Speaker, text: impl Into<String>, limit: usize) {
        self.recent_turns.push_back(TurnRecord {
            speaker,
            text: text.into(),
            at: Utc::now(),
        });
        while self.recent_turns.len() > limit.max(1) {
            self.recent_turns.pop_front();
        }
        self.updated_at = Utc::now();
    }

    /// Moves the current task into history, newest first.
    pub fn archive_current(&mut self, limit: usize) -> Option<&ActiveTask> {
        let task = self.current.take()?;
        self.history.push_front(task);
        self.history.truncate(limit.max(1));
        self.updated_at = Utc::now();
        self.history.front()
    }

    pub fn last_finished(&self) -> Option<&ActiveTask> {
        self.history.front()
    }
}

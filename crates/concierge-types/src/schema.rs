use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Field values keyed by field name. A `BTreeMap` keeps serialized tasks stable.
pub type FieldMap = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    String,
    FreeText,
    Date,
    Time,
    Enum { options: Vec<String> },
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::FreeText => "free_text",
            FieldType::Date => "date",
            FieldType::Time => "time",
            FieldType::Enum { .. } => "enum",
        }
    }

    pub fn default_normalizer(&self) -> Normalizer {
        match self {
            FieldType::String | FieldType::FreeText => Normalizer::Text,
            FieldType::Date => Normalizer::RelativeDate,
            FieldType::Time => Normalizer::ClockTime,
            FieldType::Enum { .. } => Normalizer::EnumChoice,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalizer {
    Text,
    RelativeDate,
    ClockTime,
    EnumChoice,
    EmailAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalizer: Option<Normalizer>,
    /// Session preference key consulted when the field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference_default: Option<String>,
    /// Risky values (see `concierge_tools::looks_dangerous`) are held for
    /// manual review instead of executed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_confirmation: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            field_type,
            required: true,
            normalizer: None,
            preference_default: None,
            requires_confirmation: false,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_preference_default(mut self, key: impl Into<String>) -> Self {
        self.preference_default = Some(key.into());
        self
    }

    pub fn with_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn effective_normalizer(&self) -> Normalizer {
        self.normalizer
            .unwrap_or_else(|| self.field_type.default_normalizer())
    }

    /// Human form of the field name used in prompts ("app_name" -> "app name").
    pub fn display_name(&self) -> String {
        self.name.replace('_', " ")
    }
}

/// Declared shape of one tool. Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.get_field(name).is_some()
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn has_required_fields(&self) -> bool {
        self.fields.iter().any(|f| f.required)
    }

    /// Compact catalog entry handed to the language-understanding oracle.
    pub fn catalog_entry(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "fields": self.fields.iter().map(|f| json!({
                "name": f.name,
                "type": f.field_type.as_str(),
                "required": f.required,
                "description": f.description,
            })).collect::<Vec<_>>(),
        })
    }

    /// Executor arguments; keys outside the schema are never emitted.
    pub fn args_json(&self, values: &FieldMap) -> Value {
        let mut args = serde_json::Map::new();
        for spec in &self.fields {
            if let Some(value) = values.get(&spec.name) {
                args.insert(spec.name.clone(), value.to_json());
            }
        }
        Value::Object(args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    /// Extracted text that has not passed a normalizer yet.
    Raw(String),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Choice(String),
}

impl FieldValue {
    pub fn raw(value: impl Into<String>) -> Self {
        FieldValue::Raw(value.into())
    }

    pub fn is_normalized(&self) -> bool {
        !matches!(self, FieldValue::Raw(_))
    }

    /// True for raw text that is empty once trimmed; such values count as absent.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Raw(s) | FieldValue::Text(s) | FieldValue::Choice(s) => s.trim().is_empty(),
            FieldValue::Date(_) | FieldValue::Time(_) => false,
        }
    }

    pub fn display(&self) -> String {
        match self {
            FieldValue::Raw(s) | FieldValue::Text(s) | FieldValue::Choice(s) => s.clone(),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Time(t) => t.format("%H:%M").to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::String(self.display())
    }
}

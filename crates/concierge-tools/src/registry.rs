use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use concierge_types::{FieldType, Normalizer, ToolSchema};
use thiserror::Error;

use crate::catalog::builtin_catalog;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown tool `{0}`")]
    NotFound(String),
    #[error(transparent)]
    InvalidSchema(#[from] ToolSchemaValidationError),
}

/// Static catalog of tool schemas. Built once, then shared read-only across
/// sessions; clones are cheap and need no locking.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    schemas: Arc<Vec<ToolSchema>>,
    index: Arc<HashMap<String, usize>>,
}

impl ToolRegistry {
    pub fn new(schemas: Vec<ToolSchema>) -> Result<Self, RegistryError> {
        validate_tool_schemas(&schemas)?;
        let index = schemas
            .iter()
            .enumerate()
            .map(|(idx, schema)| (schema.name.clone(), idx))
            .collect::<HashMap<_, _>>();
        Ok(Self {
            schemas: Arc::new(schemas),
            index: Arc::new(index),
        })
    }

    pub fn with_builtin_tools() -> Result<Self, RegistryError> {
        Self::new(builtin_catalog())
    }

    /// Built-in catalog followed by `extra`. An extra schema with a built-in
    /// name replaces the built-in one in place.
    pub fn with_extra_tools(extra: Vec<ToolSchema>) -> Result<Self, RegistryError> {
        let mut schemas = builtin_catalog();
        for schema in extra {
            match schemas.iter_mut().find(|s| s.name == schema.name) {
                Some(slot) => *slot = schema,
                None => schemas.push(schema),
            }
        }
        Self::new(schemas)
    }

    pub fn lookup(&self, name: &str) -> Result<&ToolSchema, RegistryError> {
        self.index
            .get(name)
            .and_then(|idx| self.schemas.get(*idx))
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn all(&self) -> &[ToolSchema] {
        &self.schemas
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Declaration order, used as the final routing tie-break.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    let mut names = HashSet::new();
    for (idx, schema) in schemas.iter().enumerate() {
        let fail = |path: String, reason: &str| ToolSchemaValidationError {
            tool_name: schema.name.clone(),
            path,
            reason: reason.to_string(),
        };
        if schema.name.trim().is_empty() {
            return Err(fail(format!("$[{idx}].name"), "tool name is empty"));
        }
        if !names.insert(schema.name.as_str()) {
            return Err(fail(format!("$[{idx}].name"), "duplicate tool name"));
        }
        validate_fields(schema)?;
    }
    Ok(())
}

fn validate_fields(schema: &ToolSchema) -> Result<(), ToolSchemaValidationError> {
    let mut seen = HashSet::new();
    for (idx, field) in schema.fields.iter().enumerate() {
        let path = format!("$.fields[{idx}]");
        let reason = if field.name.trim().is_empty() {
            Some("field name is empty")
        } else if !seen.insert(field.name.as_str()) {
            Some("duplicate field name")
        } else {
            match (&field.field_type, field.effective_normalizer()) {
                (FieldType::Enum { options }, _) if options.is_empty() => {
                    Some("enum field declares no options")
                }
                (FieldType::Enum { .. }, _) => None,
                (_, Normalizer::EnumChoice) => Some("enum normalizer on a non-enum field"),
                _ => None,
            }
        };
        if let Some(reason) = reason {
            return Err(ToolSchemaValidationError {
                tool_name: schema.name.clone(),
                path,
                reason: reason.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_types::FieldSpec;

    #[test]
    fn builtin_catalog_passes_schema_validation() {
        let registry = ToolRegistry::with_builtin_tools().expect("builtin registry");
        assert!(registry.contains("reminder_create"));
        assert!(registry.contains("email_send"));
        assert_eq!(registry.position("calendar_create"), Some(0));
    }

    #[test]
    fn lookup_reports_unknown_tool() {
        let registry = ToolRegistry::with_builtin_tools().expect("builtin registry");
        let err = registry.lookup("teleport").expect_err("unknown tool");
        assert!(matches!(err, RegistryError::NotFound(name) if name == "teleport"));
    }

    #[test]
    fn rejects_enum_without_options() {
        let schema = ToolSchema::new("bad", "broken").field(FieldSpec::optional(
            "mode",
            FieldType::Enum {
                options: Vec::new(),
            },
        ));
        let err = validate_tool_schemas(&[schema]).expect_err("invalid");
        assert_eq!(err.path, "$.fields[0]");
        assert!(err.to_string().contains("no options"));
    }

    #[test]
    fn rejects_duplicate_fields_and_tools() {
        let dup_field = ToolSchema::new("dup", "dup fields")
            .field(FieldSpec::required("title", FieldType::String))
            .field(FieldSpec::optional("title", FieldType::FreeText));
        assert!(validate_tool_schemas(&[dup_field]).is_err());

        let a = ToolSchema::new("same", "first");
        let b = ToolSchema::new("same", "second");
        let err = validate_tool_schemas(&[a, b]).expect_err("duplicate tool");
        assert_eq!(err.reason, "duplicate tool name");
    }

    #[test]
    fn extra_tools_override_builtins_in_place() {
        let custom = ToolSchema::new("weather", "Forecast for a city")
            .field(FieldSpec::required("city", FieldType::String));
        let registry = ToolRegistry::with_extra_tools(vec![
            custom,
            ToolSchema::new("lights_off", "Turn the lights off"),
        ])
        .expect("registry");
        let weather = registry.lookup("weather").expect("weather");
        assert!(weather.has_field("city"));
        assert_eq!(
            registry.position("lights_off"),
            Some(registry.len() - 1)
        );
    }
}

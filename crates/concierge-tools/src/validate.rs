use concierge_types::{FieldMap, FieldValue, ToolSchema};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::normalize::{normalize, NormalizeContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidField {
    pub field: String,
    pub value: String,
    pub reason: String,
}

/// Offending fields, each list in schema declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rejection {
    pub missing: Vec<String>,
    pub invalid: Vec<InvalidField>,
}

impl Rejection {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }

    pub fn invalid_names(&self) -> Vec<String> {
        self.invalid.iter().map(|f| f.field.clone()).collect()
    }

    pub fn invalid_field(&self, name: &str) -> Option<&InvalidField> {
        self.invalid.iter().find(|f| f.field == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Normalized values for every required field plus any valid optional ones.
    Accepted(FieldMap),
    Rejected(Rejection),
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted(_))
    }
}

/// Checks `fields` against `schema`. Pure: no I/O, no mutation.
///
/// A required field is *missing* when absent or blank and no preference
/// default fills it, and *invalid* when present but its normalizer refuses it.
/// An invalid required field is reported only as invalid. Optional fields that
/// fail to normalize are dropped and never block acceptance. Keys outside the
/// schema are ignored.
pub fn validate(schema: &ToolSchema, fields: &FieldMap, ctx: &NormalizeContext<'_>) -> Validation {
    let mut accepted = FieldMap::new();
    let mut rejection = Rejection::default();

    for spec in &schema.fields {
        let value = fields
            .get(&spec.name)
            .filter(|v| !v.is_blank())
            .cloned()
            .or_else(|| {
                spec.preference_default
                    .as_deref()
                    .and_then(|key| ctx.preferences.get(key))
                    .map(FieldValue::raw)
            });
        let Some(value) = value else {
            if spec.required {
                rejection.missing.push(spec.name.clone());
            }
            continue;
        };
        match normalize(spec, &value, ctx) {
            Ok(normalized) => {
                accepted.insert(spec.name.clone(), normalized);
            }
            Err(err) if spec.required => rejection.invalid.push(InvalidField {
                field: spec.name.clone(),
                value: value.display(),
                reason: err.to_string(),
            }),
            Err(err) => {
                debug!(tool = %schema.name, field = %spec.name, error = %err, "dropping invalid optional field");
            }
        }
    }

    if rejection.is_empty() {
        Validation::Accepted(accepted)
    } else {
        Validation::Rejected(rejection)
    }
}

//! Schema Registry
//!
//! Holds the current [`SchemaDefinition`] for every JSONB column and validates
//! payloads against it. Validation never mutates shared state: compatibility
//! rewriting works on a private copy of the payload, and field lists are read
//! through a snapshot.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::compatibility::CompatibilityRegistry;
use crate::error::{Result, SchemaError};
use crate::schema::{JsonbSchema, ObjectSchema, SchemaDefinition, SchemaKey, SchemaSummary};
use crate::validator::{json_type_name, FieldValidator, IssueCode, ValidationIssue};
use crate::version::SchemaVersion;

/// Per-call validation switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateOptions {
    /// Treat every declared field as optional (patch payloads)
    #[serde(default)]
    pub allow_partial: bool,
    /// Silently drop undeclared keys instead of rejecting or passing them
    #[serde(default)]
    pub strip_unknown_keys: bool,
}

impl ValidateOptions {
    pub fn partial() -> Self {
        Self {
            allow_partial: true,
            ..Self::default()
        }
    }

    pub fn strip_unknown() -> Self {
        Self {
            strip_unknown_keys: true,
            ..Self::default()
        }
    }
}

/// Result of validating one payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_keys: Vec<String>,
    pub version: SchemaVersion,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_compatibility_rules: Vec<String>,
}

impl ValidationOutcome {
    /// Validated data, or [`SchemaError::ValidationFailed`]
    pub fn into_result(self, table: &str, column: &str) -> Result<Value> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(SchemaError::ValidationFailed {
                table: table.to_string(),
                column: column.to_string(),
                issues: self.errors,
            }),
        }
    }
}

/// How undeclared keys are treated for one validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnknownKeys {
    Reject,
    Strip,
    Passthrough,
}

/// Versioned schema definitions keyed by `(table, column)`
#[derive(Debug)]
pub struct SchemaRegistry {
    definitions: RwLock<HashMap<SchemaKey, SchemaDefinition>>,
    compatibility: Arc<CompatibilityRegistry>,
}

impl SchemaRegistry {
    pub fn new(compatibility: Arc<CompatibilityRegistry>) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            compatibility,
        }
    }

    pub fn compatibility(&self) -> &Arc<CompatibilityRegistry> {
        &self.compatibility
    }

    /// Unconditional upsert (last writer wins)
    pub fn register(&self, definition: SchemaDefinition) {
        let key = definition.key();
        info!(schema = %key, version = %definition.version, "registered schema definition");
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, definition);
    }

    /// Store `definition` only if the current version equals `expected`.
    ///
    /// A column with no definition never matches.
    pub fn compare_and_set(&self, definition: SchemaDefinition, expected: SchemaVersion) -> bool {
        let key = definition.key();
        let mut definitions = self.definitions.write().unwrap_or_else(PoisonError::into_inner);
        let current = definitions.get(&key).map(|d| d.version);
        if current != Some(expected) {
            debug!(
                schema = %key,
                expected = %expected,
                actual = ?current,
                "compare-and-set rejected stale version"
            );
            return false;
        }
        info!(
            schema = %key,
            from = %expected,
            to = %definition.version,
            "compare-and-set applied"
        );
        definitions.insert(key, definition);
        true
    }

    pub fn get(&self, table: &str, column: &str) -> Option<SchemaDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&SchemaKey::new(table, column))
            .cloned()
    }

    pub fn version(&self, table: &str, column: &str) -> Option<SchemaVersion> {
        self.get(table, column).map(|d| d.version)
    }

    /// All definitions, sorted by key
    pub fn list(&self) -> Vec<SchemaDefinition> {
        let mut definitions: Vec<_> = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        definitions.sort_by_key(|d| d.key());
        definitions
    }

    pub fn summaries(&self) -> Vec<SchemaSummary> {
        self.list().iter().map(SchemaDefinition::summary).collect()
    }

    /// Validate `payload` for a column.
    ///
    /// Ordinary validation failures come back as an unsuccessful outcome;
    /// only an unknown column or malformed arguments are errors.
    pub fn validate(
        &self,
        table: &str,
        column: &str,
        payload: &Value,
        options: ValidateOptions,
    ) -> Result<ValidationOutcome> {
        if table.is_empty() || column.is_empty() {
            return Err(SchemaError::InvalidArgument(
                "table and column must be non-empty".to_string(),
            ));
        }
        let definition = self.get(table, column).ok_or_else(|| SchemaError::SchemaNotFound {
            table: table.to_string(),
            column: column.to_string(),
        })?;

        let migrated = self.compatibility.apply(table, column, payload);

        let mode = if options.strip_unknown_keys {
            UnknownKeys::Strip
        } else if definition.allow_unknown_keys {
            UnknownKeys::Passthrough
        } else {
            UnknownKeys::Reject
        };

        let parsed = match &definition.schema {
            JsonbSchema::Object(object) => {
                validate_object(object, &migrated.data, options.allow_partial, mode)
            }
            JsonbSchema::Value(validator) => validate_value(validator, &migrated.data),
        };

        match parsed {
            Ok(data) => {
                let unknown_keys = match (&definition.schema, &migrated.data) {
                    (JsonbSchema::Object(object), Value::Object(map))
                        if definition.allow_unknown_keys =>
                    {
                        undeclared_keys(object, map)
                    }
                    _ => Vec::new(),
                };
                Ok(ValidationOutcome {
                    success: true,
                    data: Some(data),
                    errors: Vec::new(),
                    unknown_keys,
                    version: definition.version,
                    applied_compatibility_rules: migrated.applied_rules,
                })
            }
            Err(errors) => {
                debug!(
                    table,
                    column,
                    issues = errors.len(),
                    "payload rejected by schema"
                );
                Ok(ValidationOutcome {
                    success: false,
                    data: None,
                    errors,
                    unknown_keys: Vec::new(),
                    version: definition.version,
                    applied_compatibility_rules: migrated.applied_rules,
                })
            }
        }
    }
}

fn validate_object(
    object: &ObjectSchema,
    payload: &Value,
    allow_partial: bool,
    mode: UnknownKeys,
) -> std::result::Result<Value, Vec<ValidationIssue>> {
    let Value::Object(input) = payload else {
        return Err(vec![ValidationIssue::new(
            "",
            IssueCode::InvalidType,
            format!("Expected object, received {}", json_type_name(payload)),
        )]);
    };

    let mut output = Map::new();
    let mut issues = Vec::new();
    for (name, validator) in object.snapshot() {
        match validator.check(&name, input.get(&name), allow_partial) {
            Ok(Some(value)) => {
                output.insert(name, value);
            }
            Ok(None) => {}
            Err(found) => issues.extend(found),
        }
    }

    let extras = undeclared_keys(object, input);
    match mode {
        UnknownKeys::Strip => {}
        UnknownKeys::Passthrough => {
            for key in &extras {
                if let Some(value) = input.get(key) {
                    output.insert(key.clone(), value.clone());
                }
            }
        }
        UnknownKeys::Reject if !extras.is_empty() => {
            let listed = extras
                .iter()
                .map(|k| format!("'{}'", k))
                .collect::<Vec<_>>()
                .join(", ");
            issues.push(ValidationIssue::new(
                "",
                IssueCode::UnrecognizedKeys,
                format!("Unrecognized key(s) in object: {}", listed),
            ));
        }
        UnknownKeys::Reject => {}
    }

    if issues.is_empty() {
        Ok(Value::Object(output))
    } else {
        Err(issues)
    }
}

fn validate_value(
    validator: &FieldValidator,
    payload: &Value,
) -> std::result::Result<Value, Vec<ValidationIssue>> {
    validator
        .check("", Some(payload), false)
        .map(|value| value.unwrap_or(Value::Null))
}

fn undeclared_keys(object: &ObjectSchema, payload: &Map<String, Value>) -> Vec<String> {
    let declared = object.field_names();
    payload
        .keys()
        .filter(|key| !declared.contains(*key))
        .cloned()
        .collect()
}

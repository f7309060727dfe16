//! Schema types and structures

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::fingerprint::Fingerprint;
use crate::validator::FieldValidator;
use crate::version::SchemaVersion;

/// Identifies a JSONB column: `(table, column)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaKey {
    pub table: String,
    pub column: String,
}

impl SchemaKey {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Object validator over an ordered set of named fields.
///
/// Cloning an `ObjectSchema` yields another handle to the same field list:
/// a field added through any handle is visible to every holder. Fields are
/// append-only and a declared name is never replaced.
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    fields: Arc<RwLock<Vec<(String, FieldValidator)>>>,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Self::add_field`]
    pub fn with_field(self, name: impl Into<String>, validator: FieldValidator) -> Self {
        self.add_field(name, validator);
        self
    }

    /// Append a field. Returns `false` (and changes nothing) if the name is
    /// already declared.
    pub fn add_field(&self, name: impl Into<String>, validator: FieldValidator) -> bool {
        let name = name.into();
        let mut fields = self.fields.write().unwrap_or_else(PoisonError::into_inner);
        if fields.iter().any(|(existing, _)| *existing == name) {
            return false;
        }
        fields.push((name, validator));
        true
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(existing, _)| existing == name)
    }

    /// Declared field names in declaration order
    pub fn field_names(&self) -> Vec<String> {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Point-in-time copy of the field list
    pub fn snapshot(&self) -> Vec<(String, FieldValidator)> {
        self.fields.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.fields.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles point at the same field list
    pub fn ptr_eq(&self, other: &ObjectSchema) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let descriptors: Vec<Value> = self
            .snapshot()
            .iter()
            .map(|(name, validator)| validator.descriptor(name))
            .collect();
        Fingerprint::from_json(&Value::Array(descriptors))
    }

    /// JSON Schema (draft-07) document for this object
    pub fn json_schema(&self, allow_unknown_keys: bool) -> Value {
        let fields = self.snapshot();
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (name, validator) in &fields {
            if validator.is_required() {
                required.push(json!(name));
            }
            properties.insert(name.clone(), validator.json_schema());
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": allow_unknown_keys,
        })
    }
}

/// Shape of a JSONB column
#[derive(Debug, Clone)]
pub enum JsonbSchema {
    /// Named fields; the only extensible shape
    Object(ObjectSchema),
    /// A single value, e.g. a free-form array column
    Value(FieldValidator),
}

impl JsonbSchema {
    pub fn as_object(&self) -> Option<&ObjectSchema> {
        match self {
            JsonbSchema::Object(object) => Some(object),
            JsonbSchema::Value(_) => None,
        }
    }
}

impl From<ObjectSchema> for JsonbSchema {
    fn from(object: ObjectSchema) -> Self {
        JsonbSchema::Object(object)
    }
}

/// Versioned schema of one JSONB column
#[derive(Debug, Clone)]
pub struct SchemaDefinition {
    pub table: String,
    pub column: String,
    pub version: SchemaVersion,
    pub schema: JsonbSchema,
    /// Pass undeclared keys through (and report them) instead of rejecting
    pub allow_unknown_keys: bool,
    pub description: Option<String>,
}

impl SchemaDefinition {
    /// Strict, version 1 definition
    pub fn new(table: impl Into<String>, column: impl Into<String>, schema: impl Into<JsonbSchema>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            version: SchemaVersion::INITIAL,
            schema: schema.into(),
            allow_unknown_keys: false,
            description: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<SchemaVersion>) -> Self {
        self.version = version.into();
        self
    }

    pub fn allow_unknown_keys(mut self, allow: bool) -> Self {
        self.allow_unknown_keys = allow;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn key(&self) -> SchemaKey {
        SchemaKey::new(&self.table, &self.column)
    }

    pub fn json_schema(&self) -> Value {
        let mut document = match &self.schema {
            JsonbSchema::Object(object) => object.json_schema(self.allow_unknown_keys),
            JsonbSchema::Value(validator) => validator.json_schema(),
        };
        if let Value::Object(map) = &mut document {
            map.insert("$schema".into(), json!("http://json-schema.org/draft-07/schema#"));
            map.insert("title".into(), json!(self.key().to_string()));
            map.insert("x-schema-version".into(), json!(self.version.get()));
            if let Some(description) = &self.description {
                map.insert("description".into(), json!(description));
            }
        }
        document
    }

    pub fn summary(&self) -> SchemaSummary {
        let (fields, fingerprint) = match &self.schema {
            JsonbSchema::Object(object) => (object.field_names(), Some(object.fingerprint())),
            JsonbSchema::Value(_) => (Vec::new(), None),
        };
        SchemaSummary {
            table: self.table.clone(),
            column: self.column.clone(),
            version: self.version,
            fields,
            allow_unknown_keys: self.allow_unknown_keys,
            fingerprint,
            description: self.description.clone(),
        }
    }
}

/// Serializable overview of a registered definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSummary {
    pub table: String,
    pub column: String,
    pub version: SchemaVersion,
    pub fields: Vec<String>,
    pub allow_unknown_keys: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

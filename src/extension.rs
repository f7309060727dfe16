//! Schema extension builder
//!
//! Turns a declarative [`FieldExtensionDefinition`] into a live
//! [`FieldValidator`]. The builder is pure: it never touches the registry, so
//! every field of an extension request can be built (and rejected) before any
//! schema is mutated.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::regex_safety::{compile_pattern, PatternLimits};
use crate::validator::{FieldKind, FieldValidator, NumberRules, StringFormat, StringRules};

/// Declared type of an extension field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Email,
    Phone,
    Url,
    Json,
}

impl FieldType {
    pub const ALL: [FieldType; 8] = [
        FieldType::String,
        FieldType::Number,
        FieldType::Boolean,
        FieldType::Date,
        FieldType::Email,
        FieldType::Phone,
        FieldType::Url,
        FieldType::Json,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Email => "email",
            FieldType::Phone => "phone",
            FieldType::Url => "url",
            FieldType::Json => "json",
        }
    }

    /// String format for the string-backed types
    fn string_format(&self) -> Option<StringFormat> {
        match self {
            FieldType::String => Some(StringFormat::Plain),
            FieldType::Email => Some(StringFormat::Email),
            FieldType::Phone => Some(StringFormat::Phone),
            FieldType::Url => Some(StringFormat::Url),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self> {
        FieldType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SchemaError::UnrecognizedFieldType(s.to_string()))
    }
}

/// Optional constraints attached to an extension field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl ValidationRules {
    pub fn is_empty(&self) -> bool {
        *self == ValidationRules::default()
    }
}

/// Request to add one field to a JSONB column schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldExtensionDefinition {
    pub field_name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "ValidationRules::is_empty")]
    pub validation_rules: ValidationRules,
}

impl FieldExtensionDefinition {
    /// Optional field without constraints
    pub fn new(field_name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            field_name: field_name.into(),
            field_type,
            required: false,
            default_value: None,
            description: None,
            validation_rules: ValidationRules::default(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.validation_rules = rules;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default_value: Value) -> Self {
        self.default_value = Some(default_value);
        self
    }
}

fn field_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("field name regex"))
}

/// Reject field names that are not lower snake case identifiers
pub fn validate_field_name(name: &str) -> Result<()> {
    if field_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidFieldName(name.to_string()))
    }
}

/// Builds field validators from extension definitions
#[derive(Debug, Clone, Default)]
pub struct SchemaExtensionBuilder {
    limits: PatternLimits,
}

impl SchemaExtensionBuilder {
    pub fn new(limits: PatternLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &PatternLimits {
        &self.limits
    }

    /// Build the validator for one field.
    ///
    /// Fails with [`SchemaError::UnsafeRegexPattern`] before compiling a
    /// pattern that could backtrack catastrophically.
    pub fn build_field_validator(&self, def: &FieldExtensionDefinition) -> Result<FieldValidator> {
        let rules = &def.validation_rules;

        let kind = if let Some(format) = def.field_type.string_format() {
            let pattern = match &rules.pattern {
                Some(pattern) => Some(compile_pattern(pattern, &self.limits)?),
                None => None,
            };
            FieldKind::String(StringRules {
                format,
                pattern,
                min_length: rules.min_length,
                max_length: rules.max_length,
                enum_values: rules.enum_values.clone(),
            })
        } else {
            if rules.pattern.is_some() || rules.enum_values.is_some() {
                debug!(
                    field = %def.field_name,
                    field_type = %def.field_type,
                    "ignoring string-only validation rules"
                );
            }
            match def.field_type {
                FieldType::Number => FieldKind::Number(NumberRules {
                    min: rules.min_value,
                    max: rules.max_value,
                }),
                FieldType::Boolean => FieldKind::Boolean,
                FieldType::Date => FieldKind::DateTime,
                _ => FieldKind::Json,
            }
        };

        let mut validator = FieldValidator::new(kind);
        if def.required {
            validator = validator.required();
        }
        if let Some(default) = &def.default_value {
            validator = validator.with_default(default.clone());
        }
        if let Some(description) = &def.description {
            validator = validator.with_description(description.clone());
        }
        Ok(validator)
    }
}

/// Build a validator with the default pattern limits
pub fn build_field_validator(def: &FieldExtensionDefinition) -> Result<FieldValidator> {
    SchemaExtensionBuilder::default().build_field_validator(def)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_type_parsing() {
        assert_eq!("email".parse::<FieldType>().unwrap(), FieldType::Email);
        let err = "uuid".parse::<FieldType>().unwrap_err();
        assert_eq!(err, SchemaError::UnrecognizedFieldType("uuid".into()));
    }

    #[test]
    fn test_field_name_rules() {
        assert!(validate_field_name("mentorship_tier").is_ok());
        assert!(validate_field_name("tier2").is_ok());
        assert!(validate_field_name("Tier").is_err());
        assert!(validate_field_name("2tier").is_err());
        assert!(validate_field_name("tier-name").is_err());
        assert!(validate_field_name("").is_err());
    }

    #[test]
    fn test_unsafe_pattern_fails_fast() {
        let def = FieldExtensionDefinition::new("handle", FieldType::String).with_rules(
            ValidationRules {
                pattern: Some("(a+)+$".into()),
                ..Default::default()
            },
        );
        let err = build_field_validator(&def).unwrap_err();
        assert!(err.to_string().contains("Unsafe regex pattern"));
    }

    #[test]
    fn test_pattern_field() {
        let def = FieldExtensionDefinition::new("linkedin", FieldType::Url).with_rules(
            ValidationRules {
                pattern: Some(r"linkedin\.com".into()),
                ..Default::default()
            },
        );
        let v = build_field_validator(&def).unwrap();
        assert!(v.check("linkedin", Some(&json!("https://linkedin.com/in/x")), false).is_ok());
        assert!(v.check("linkedin", Some(&json!("https://example.com")), false).is_err());
    }

    #[test]
    fn test_number_rules_and_required() {
        let def = FieldExtensionDefinition::new("years", FieldType::Number)
            .required()
            .with_rules(ValidationRules {
                min_value: Some(0.0),
                max_value: Some(60.0),
                ..Default::default()
            });
        let v = build_field_validator(&def).unwrap();
        assert!(v.is_required());
        assert!(v.check("years", Some(&json!(12)), false).is_ok());
        assert!(v.check("years", Some(&json!(-1)), false).is_err());
        assert!(v.check("years", None, false).is_err());
    }

    #[test]
    fn test_optional_json_field_accepts_anything() {
        let def = FieldExtensionDefinition::new("extra", FieldType::Json);
        let v = build_field_validator(&def).unwrap();
        assert!(v.check("extra", Some(&json!([1, {"a": 2}])), false).is_ok());
        assert!(v.check("extra", Some(&Value::Null), false).is_ok());
        assert!(v.check("extra", None, false).unwrap().is_none());
    }

    #[test]
    fn test_definition_deserializes_from_snake_case() {
        let def: FieldExtensionDefinition = serde_json::from_value(json!({
            "field_name": "mentorship_tier",
            "field_type": "string",
            "validation_rules": { "enum_values": ["basic", "gold"] }
        }))
        .unwrap();
        assert!(!def.required);
        assert_eq!(
            def.validation_rules.enum_values,
            Some(vec!["basic".to_string(), "gold".to_string()])
        );
    }
}

//! Field validators
//!
//! A [`FieldValidator`] checks one named value inside a JSONB document. The
//! kind is a closed enum so the builder in [`crate::extension`] can dispatch on
//! a declared field type without any dynamic lookup.
//!
//! Issue codes mirror the vocabulary API clients already understand:
//! `invalid_type`, `too_small`, `too_big`, `invalid_string`,
//! `invalid_enum_value`, `invalid_date` and `unrecognized_keys`.

use chrono::DateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;

/// Machine-readable category of a validation issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    InvalidType,
    TooSmall,
    TooBig,
    InvalidString,
    InvalidEnumValue,
    InvalidDate,
    UnrecognizedKeys,
}

/// A single problem found while validating a payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path of the offending value; empty for the document root
    pub path: String,
    /// Human-readable explanation
    pub message: String,
    /// Issue category
    pub code: IssueCode,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            code,
        }
    }
}

/// Textual format enforced on a string field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringFormat {
    #[default]
    Plain,
    Email,
    Phone,
    Url,
}

impl StringFormat {
    /// Whether `value` satisfies this format
    pub fn matches(&self, value: &str) -> bool {
        match self {
            StringFormat::Plain => true,
            StringFormat::Email => email_regex().is_match(value),
            StringFormat::Phone => phone_regex().is_match(value),
            StringFormat::Url => url_regex().is_match(value),
        }
    }

    fn failure_message(&self) -> &'static str {
        match self {
            StringFormat::Plain => "Invalid string",
            StringFormat::Email => "Invalid email",
            StringFormat::Phone => "Invalid phone number",
            StringFormat::Url => "Invalid url",
        }
    }

    /// JSON Schema `format` keyword, where one exists
    fn json_schema_format(&self) -> Option<&'static str> {
        match self {
            StringFormat::Email => Some("email"),
            StringFormat::Url => Some("uri"),
            StringFormat::Plain | StringFormat::Phone => None,
        }
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"))
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[0-9][0-9\s\-().]{5,18}[0-9]$").expect("phone regex"))
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*://[^\s/?#]+[^\s]*$").expect("url regex")
    })
}

/// A user-supplied pattern that passed the safety check and compiled
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    source: String,
    regex: Regex,
}

impl CompiledPattern {
    pub(crate) fn new(source: impl Into<String>, regex: Regex) -> Self {
        Self {
            source: source.into(),
            regex,
        }
    }

    /// The pattern as written by the caller
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Unanchored search, matching `RegExp.prototype.test` semantics
    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

/// Constraints on a string-kind field
#[derive(Debug, Clone, Default)]
pub struct StringRules {
    pub format: StringFormat,
    pub pattern: Option<CompiledPattern>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub enum_values: Option<Vec<String>>,
}

/// Constraints on a numeric field
#[derive(Debug, Clone, Default)]
pub struct NumberRules {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// What a field holds
#[derive(Debug, Clone)]
pub enum FieldKind {
    String(StringRules),
    Number(NumberRules),
    Boolean,
    /// ISO-8601 / RFC 3339 date-time string
    DateTime,
    /// Any JSON value
    Json,
}

impl FieldKind {
    fn type_label(&self) -> &'static str {
        match self {
            FieldKind::String(_) | FieldKind::DateTime => "string",
            FieldKind::Number(_) => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Json => "json",
        }
    }
}

/// Validator for a single JSONB field
#[derive(Debug, Clone)]
pub struct FieldValidator {
    kind: FieldKind,
    required: bool,
    default: Option<Value>,
    description: Option<String>,
}

impl FieldValidator {
    /// Optional field of the given kind
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            description: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldKind::String(StringRules::default()))
    }

    pub fn number() -> Self {
        Self::new(FieldKind::Number(NumberRules::default()))
    }

    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    pub fn datetime() -> Self {
        Self::new(FieldKind::DateTime)
    }

    pub fn json() -> Self {
        Self::new(FieldKind::Json)
    }

    /// Reject absence and null
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Value substituted when the key is absent
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Validate a (possibly absent) value.
    ///
    /// `force_optional` is set for partial validation. On success returns the
    /// value to place in the output document, or `None` to leave the key out.
    pub fn check(
        &self,
        path: &str,
        value: Option<&Value>,
        force_optional: bool,
    ) -> Result<Option<Value>, Vec<ValidationIssue>> {
        let required = self.required && !force_optional;
        match value {
            // Partial payloads describe a patch; defaults would overwrite stored values.
            None if force_optional => Ok(None),
            None => {
                if let Some(default) = &self.default {
                    return Ok(Some(default.clone()));
                }
                if required {
                    Err(vec![ValidationIssue::new(path, IssueCode::InvalidType, "Required")])
                } else {
                    Ok(None)
                }
            }
            Some(Value::Null) if !required => Ok(Some(Value::Null)),
            Some(value) => self.check_value(path, value).map(Some),
        }
    }

    fn check_value(&self, path: &str, value: &Value) -> Result<Value, Vec<ValidationIssue>> {
        match &self.kind {
            FieldKind::Json => Ok(value.clone()),
            FieldKind::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                other => Err(vec![type_mismatch(path, "boolean", other)]),
            },
            FieldKind::Number(rules) => {
                let Some(number) = value.as_f64() else {
                    return Err(vec![type_mismatch(path, "number", value)]);
                };
                let mut issues = Vec::new();
                if let Some(min) = rules.min {
                    if number < min {
                        issues.push(ValidationIssue::new(
                            path,
                            IssueCode::TooSmall,
                            format!("Number must be greater than or equal to {}", min),
                        ));
                    }
                }
                if let Some(max) = rules.max {
                    if number > max {
                        issues.push(ValidationIssue::new(
                            path,
                            IssueCode::TooBig,
                            format!("Number must be less than or equal to {}", max),
                        ));
                    }
                }
                finish(value, issues)
            }
            FieldKind::DateTime => match value {
                Value::String(s) if DateTime::parse_from_rfc3339(s).is_ok() => Ok(value.clone()),
                Value::String(_) => Err(vec![ValidationIssue::new(
                    path,
                    IssueCode::InvalidDate,
                    "Invalid datetime",
                )]),
                other => Err(vec![type_mismatch(path, "string", other)]),
            },
            FieldKind::String(rules) => {
                let Value::String(s) = value else {
                    return Err(vec![type_mismatch(path, "string", value)]);
                };
                finish(value, check_string(path, s, rules))
            }
        }
    }

    /// JSON Schema (draft-07) fragment equivalent to this validator
    pub fn json_schema(&self) -> Value {
        let mut schema = match &self.kind {
            FieldKind::Json => json!({}),
            FieldKind::Boolean => json!({ "type": "boolean" }),
            FieldKind::DateTime => json!({ "type": "string", "format": "date-time" }),
            FieldKind::Number(rules) => {
                let mut s = json!({ "type": "number" });
                if let Some(min) = rules.min {
                    s["minimum"] = json!(min);
                }
                if let Some(max) = rules.max {
                    s["maximum"] = json!(max);
                }
                s
            }
            FieldKind::String(rules) => {
                let mut s = json!({ "type": "string" });
                if let Some(format) = rules.format.json_schema_format() {
                    s["format"] = json!(format);
                }
                if let Some(pattern) = &rules.pattern {
                    s["pattern"] = json!(pattern.as_str());
                }
                if let Some(min) = rules.min_length {
                    s["minLength"] = json!(min);
                }
                if let Some(max) = rules.max_length {
                    s["maxLength"] = json!(max);
                }
                if let Some(values) = &rules.enum_values {
                    s["enum"] = json!(values);
                }
                s
            }
        };

        if !self.required {
            if let Some(ty) = schema.get("type").and_then(Value::as_str).map(str::to_string) {
                schema["type"] = json!([ty, "null"]);
            }
            if let Some(values) = schema.get_mut("enum").and_then(Value::as_array_mut) {
                values.push(Value::Null);
            }
        }
        if let Some(default) = &self.default {
            schema["default"] = default.clone();
        }
        if let Some(description) = &self.description {
            schema["description"] = json!(description);
        }
        schema
    }

    /// Canonical descriptor used for fingerprinting
    pub(crate) fn descriptor(&self, name: &str) -> Value {
        json!({
            "name": name,
            "kind": self.kind.type_label(),
            "required": self.required,
            "schema": self.json_schema(),
        })
    }
}

fn check_string(path: &str, s: &str, rules: &StringRules) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let length = s.chars().count();

    if let Some(min) = rules.min_length {
        if length < min {
            issues.push(ValidationIssue::new(
                path,
                IssueCode::TooSmall,
                format!("String must contain at least {} character(s)", min),
            ));
        }
    }
    if let Some(max) = rules.max_length {
        if length > max {
            issues.push(ValidationIssue::new(
                path,
                IssueCode::TooBig,
                format!("String must contain at most {} character(s)", max),
            ));
        }
    }
    if !rules.format.matches(s) {
        issues.push(ValidationIssue::new(
            path,
            IssueCode::InvalidString,
            rules.format.failure_message(),
        ));
    }
    if let Some(pattern) = &rules.pattern {
        if !pattern.is_match(s) {
            issues.push(ValidationIssue::new(
                path,
                IssueCode::InvalidString,
                format!("Invalid format: must match pattern {}", pattern.as_str()),
            ));
        }
    }
    if let Some(values) = &rules.enum_values {
        if !values.iter().any(|v| v == s) {
            let expected = values
                .iter()
                .map(|v| format!("'{}'", v))
                .collect::<Vec<_>>()
                .join(" | ");
            issues.push(ValidationIssue::new(
                path,
                IssueCode::InvalidEnumValue,
                format!("Invalid enum value. Expected {}, received '{}'", expected, s),
            ));
        }
    }
    issues
}

fn finish(value: &Value, issues: Vec<ValidationIssue>) -> Result<Value, Vec<ValidationIssue>> {
    if issues.is_empty() {
        Ok(value.clone())
    } else {
        Err(issues)
    }
}

fn type_mismatch(path: &str, expected: &str, received: &Value) -> ValidationIssue {
    ValidationIssue::new(
        path,
        IssueCode::InvalidType,
        format!("Expected {}, received {}", expected, json_type_name(received)),
    )
}

/// JSON type name used in issue messages
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_accepts_absence_and_null() {
        let v = FieldValidator::string();
        assert_eq!(v.check("f", None, false).unwrap(), None);
        assert_eq!(v.check("f", Some(&Value::Null), false).unwrap(), Some(Value::Null));
    }

    #[test]
    fn test_required_rejects_absence_unless_partial() {
        let v = FieldValidator::number().required();
        let issues = v.check("score", None, false).unwrap_err();
        assert_eq!(issues[0].code, IssueCode::InvalidType);
        assert_eq!(issues[0].path, "score");
        assert_eq!(v.check("score", None, true).unwrap(), None);
        assert!(v.check("score", Some(&Value::Null), false).is_err());
    }

    #[test]
    fn test_default_fills_absent_value() {
        let v = FieldValidator::boolean().with_default(json!(false));
        assert_eq!(v.check("active", None, false).unwrap(), Some(json!(false)));
    }

    #[test]
    fn test_number_bounds() {
        let v = FieldValidator::new(FieldKind::Number(NumberRules {
            min: Some(1.0),
            max: Some(5.0),
        }));
        assert!(v.check("n", Some(&json!(3)), false).is_ok());
        let low = v.check("n", Some(&json!(0)), false).unwrap_err();
        assert_eq!(low[0].code, IssueCode::TooSmall);
        let high = v.check("n", Some(&json!(9.5)), false).unwrap_err();
        assert_eq!(high[0].code, IssueCode::TooBig);
        assert!(v.check("n", Some(&json!("3")), false).is_err());
    }

    #[test]
    fn test_string_formats() {
        let email = FieldValidator::new(FieldKind::String(StringRules {
            format: StringFormat::Email,
            ..Default::default()
        }));
        assert!(email.check("e", Some(&json!("riya@example.com")), false).is_ok());
        assert!(email.check("e", Some(&json!("not-an-email")), false).is_err());

        assert!(StringFormat::Phone.matches("+91 98765 43210"));
        assert!(!StringFormat::Phone.matches("call me"));
        assert!(StringFormat::Url.matches("https://linkedin.com/in/x"));
        assert!(!StringFormat::Url.matches("linkedin"));
    }

    #[test]
    fn test_enum_and_length() {
        let v = FieldValidator::new(FieldKind::String(StringRules {
            enum_values: Some(vec!["basic".into(), "gold".into()]),
            max_length: Some(4),
            ..Default::default()
        }));
        assert!(v.check("tier", Some(&json!("gold")), false).is_ok());
        let issues = v.check("tier", Some(&json!("platinum")), false).unwrap_err();
        let codes: Vec<_> = issues.iter().map(|i| i.code).collect();
        assert_eq!(codes, vec![IssueCode::TooBig, IssueCode::InvalidEnumValue]);
    }

    #[test]
    fn test_datetime() {
        let v = FieldValidator::datetime();
        assert!(v.check("at", Some(&json!("2024-03-01T10:00:00Z")), false).is_ok());
        let issues = v.check("at", Some(&json!("yesterday")), false).unwrap_err();
        assert_eq!(issues[0].code, IssueCode::InvalidDate);
    }

    #[test]
    fn test_json_schema_fragment() {
        let v = FieldValidator::string().with_description("Mentor name");
        let schema = v.json_schema();
        assert_eq!(schema["type"], json!(["string", "null"]));
        assert_eq!(schema["description"], json!("Mentor name"));
        assert_eq!(FieldValidator::boolean().required().json_schema()["type"], json!("boolean"));
    }
}

//! Payload compatibility rules
//!
//! Legacy clients keep sending old payload shapes long after a schema moves
//! on. Rather than rejecting them, each `(table, column)` carries an ordered
//! list of rewrite rules applied to a private copy of the payload before
//! validation.
//!
//! Rule order is significant: later rules see the output of earlier ones, so
//! a rule canonicalizing key names must be registered before a rule mapping
//! values under the canonical names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::schema::SchemaKey;

/// Label reported for a rule without a description
pub const UNNAMED_RULE: &str = "unnamed compatibility rule";

/// Imperative payload rewrite
pub type TransformFn = Arc<dyn Fn(&mut Map<String, Value>) + Send + Sync>;

/// One rewrite step. Steps run in the order rename, value map, defaults,
/// drop, transform.
#[derive(Clone, Default)]
pub struct CompatibilityRule {
    pub description: Option<String>,
    /// Legacy key → current key
    pub rename: Vec<(String, String)>,
    /// Field → (legacy value → canonical value)
    pub value_map: Vec<(String, BTreeMap<String, Value>)>,
    /// Field → value set when the field is absent
    pub defaults: Vec<(String, Value)>,
    pub drop: Vec<String>,
    pub transform: Option<TransformFn>,
}

impl fmt::Debug for CompatibilityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompatibilityRule")
            .field("description", &self.description)
            .field("rename", &self.rename)
            .field("value_map", &self.value_map)
            .field("defaults", &self.defaults)
            .field("drop", &self.drop)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl CompatibilityRule {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }

    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rename.push((from.into(), to.into()));
        self
    }

    pub fn map_value(
        mut self,
        field: impl Into<String>,
        legacy: impl Into<String>,
        canonical: impl Into<Value>,
    ) -> Self {
        let field = field.into();
        match self.value_map.iter_mut().find(|(f, _)| *f == field) {
            Some((_, mapping)) => {
                mapping.insert(legacy.into(), canonical.into());
            }
            None => {
                let mapping: BTreeMap<String, Value> =
                    BTreeMap::from([(legacy.into(), canonical.into())]);
                self.value_map.push((field, mapping));
            }
        }
        self
    }

    pub fn default_value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.push((field.into(), value.into()));
        self
    }

    pub fn drop_field(mut self, field: impl Into<String>) -> Self {
        self.drop.push(field.into());
        self
    }

    pub fn transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&mut Map<String, Value>) + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Description, or [`UNNAMED_RULE`]
    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(UNNAMED_RULE)
    }

    /// Apply to `payload` in place; returns whether anything changed
    fn apply(&self, payload: &mut Map<String, Value>) -> bool {
        let mut changed = false;

        for (from, to) in &self.rename {
            if from == to {
                continue;
            }
            if let Some(value) = payload.remove(from) {
                // An explicit current-style value always wins over the legacy key.
                if !payload.contains_key(to) {
                    payload.insert(to.clone(), value);
                }
                changed = true;
            }
        }

        for (field, mapping) in &self.value_map {
            let Some(current) = payload.get(field) else {
                continue;
            };
            let Some(lookup) = lookup_key(current) else {
                continue;
            };
            if let Some(canonical) = mapping.get(&lookup) {
                if current != canonical {
                    payload.insert(field.clone(), canonical.clone());
                    changed = true;
                }
            }
        }

        for (field, value) in &self.defaults {
            if !payload.contains_key(field) {
                payload.insert(field.clone(), value.clone());
                changed = true;
            }
        }

        for field in &self.drop {
            if payload.remove(field).is_some() {
                changed = true;
            }
        }

        if let Some(transform) = &self.transform {
            let before = payload.clone();
            transform(payload);
            if *payload != before {
                changed = true;
            }
        }

        changed
    }
}

/// Key used to look a current value up in a value map
fn lookup_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Declarative form of a rule, as written in manifests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rename: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub value_map: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop: Vec<String>,
}

impl From<RuleSpec> for CompatibilityRule {
    fn from(spec: RuleSpec) -> Self {
        CompatibilityRule {
            description: spec.description,
            rename: spec.rename.into_iter().collect(),
            value_map: spec.value_map.into_iter().collect(),
            defaults: spec.defaults.into_iter().collect(),
            drop: spec.drop,
            transform: None,
        }
    }
}

/// Result of running the rules for one payload
#[derive(Debug, Clone, PartialEq)]
pub struct CompatibilityOutcome {
    /// Rewritten payload (a copy; the input is untouched)
    pub data: Value,
    /// Labels of the rules that changed something, in application order
    pub applied_rules: Vec<String>,
}

/// Ordered rewrite rules per JSONB column
#[derive(Debug, Default)]
pub struct CompatibilityRegistry {
    rules: RwLock<HashMap<SchemaKey, Vec<CompatibilityRule>>>,
}

impl CompatibilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rules after any already registered for the column
    pub fn register<I>(&self, table: &str, column: &str, rules: I)
    where
        I: IntoIterator<Item = CompatibilityRule>,
    {
        let mut map = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let list = map.entry(SchemaKey::new(table, column)).or_default();
        let before = list.len();
        list.extend(rules);
        debug!(
            table,
            column,
            added = list.len() - before,
            total = list.len(),
            "registered compatibility rules"
        );
    }

    pub fn register_rule(&self, table: &str, column: &str, rule: CompatibilityRule) {
        self.register(table, column, [rule]);
    }

    /// Rewrite a copy of `payload` with the column's rules.
    ///
    /// Non-object payloads are returned unchanged.
    pub fn apply(&self, table: &str, column: &str, payload: &Value) -> CompatibilityOutcome {
        let Value::Object(object) = payload else {
            return CompatibilityOutcome {
                data: payload.clone(),
                applied_rules: Vec::new(),
            };
        };

        let rules = self.rules(table, column);
        let mut data = object.clone();
        let mut applied_rules = Vec::new();
        for rule in &rules {
            if rule.apply(&mut data) {
                applied_rules.push(rule.label().to_string());
            }
        }

        if !applied_rules.is_empty() {
            debug!(table, column, rules = ?applied_rules, "applied compatibility rules");
        }
        CompatibilityOutcome {
            data: Value::Object(data),
            applied_rules,
        }
    }

    /// Rules registered for a column, in order
    pub fn rules(&self, table: &str, column: &str) -> Vec<CompatibilityRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&SchemaKey::new(table, column))
            .cloned()
            .unwrap_or_default()
    }

    /// Replace a column's rules wholesale
    pub fn set_rules(&self, table: &str, column: &str, rules: Vec<CompatibilityRule>) {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(SchemaKey::new(table, column), rules);
    }

    /// Remove a column's rules; returns whether any existed
    pub fn delete_rules(&self, table: &str, column: &str) -> bool {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&SchemaKey::new(table, column))
            .is_some()
    }

    /// Columns with at least one rule registered, sorted
    pub fn keys(&self) -> Vec<SchemaKey> {
        let mut keys: Vec<_> = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, rules)| !rules.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.rules.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rename_never_clobbers() {
        let registry = CompatibilityRegistry::new();
        registry.register_rule(
            "mentors",
            "metadata",
            CompatibilityRule::new("camelCase mentor name").rename("mentorName", "mentor_name"),
        );

        let payload = json!({"mentorName": "Old", "mentor_name": "Current"});
        let outcome = registry.apply("mentors", "metadata", &payload);
        assert_eq!(outcome.data, json!({"mentor_name": "Current"}));
        assert_eq!(outcome.applied_rules, vec!["camelCase mentor name"]);
        // caller's payload untouched
        assert_eq!(payload["mentorName"], json!("Old"));
    }

    #[test]
    fn test_rename_to_same_key_is_not_a_change() {
        let registry = CompatibilityRegistry::new();
        registry.register_rule("t", "c", CompatibilityRule::new("self").rename("a", "a"));

        let outcome = registry.apply("t", "c", &json!({"a": 1}));
        assert_eq!(outcome.data, json!({"a": 1}));
        assert!(outcome.applied_rules.is_empty());
    }

    #[test]
    fn test_rules_apply_in_order() {
        let registry = CompatibilityRegistry::new();
        registry.register(
            "mentors",
            "metadata",
            vec![
                CompatibilityRule::new("rename").rename("certificationType", "certification_type"),
                CompatibilityRule::new("map").map_value("certification_type", "USCMA", "US CMA"),
            ],
        );
        let outcome = registry.apply("mentors", "metadata", &json!({"certificationType": "USCMA"}));
        assert_eq!(outcome.data, json!({"certification_type": "US CMA"}));
        assert_eq!(outcome.applied_rules, vec!["rename", "map"]);
    }

    #[test]
    fn test_only_changing_rules_are_reported() {
        let registry = CompatibilityRegistry::new();
        registry.register(
            "t",
            "c",
            vec![
                CompatibilityRule::new("defaults").default_value("status", "active"),
                CompatibilityRule::new("drop").drop_field("legacy"),
                CompatibilityRule::default().map_value("level", "1", "junior"),
            ],
        );
        let outcome = registry.apply("t", "c", &json!({"status": "paused", "level": 1}));
        assert_eq!(outcome.data, json!({"status": "paused", "level": "junior"}));
        assert_eq!(outcome.applied_rules, vec![UNNAMED_RULE]);
    }

    #[test]
    fn test_transform_change_detection() {
        let registry = CompatibilityRegistry::new();
        registry.register(
            "t",
            "c",
            vec![
                CompatibilityRule::new("noop").transform(|_| {}),
                CompatibilityRule::new("trim").transform(|payload| {
                    if let Some(Value::String(s)) = payload.get_mut("name") {
                        *s = s.trim().to_string();
                    }
                }),
            ],
        );
        let outcome = registry.apply("t", "c", &json!({"name": "  Riya "}));
        assert_eq!(outcome.data, json!({"name": "Riya"}));
        assert_eq!(outcome.applied_rules, vec!["trim"]);
    }

    #[test]
    fn test_non_object_payload_passes_through() {
        let registry = CompatibilityRegistry::new();
        registry.register_rule("t", "c", CompatibilityRule::new("d").default_value("a", 1));
        let outcome = registry.apply("t", "c", &json!([1, 2]));
        assert_eq!(outcome.data, json!([1, 2]));
        assert!(outcome.applied_rules.is_empty());
    }

    #[test]
    fn test_admin_operations() {
        let registry = CompatibilityRegistry::new();
        registry.register_rule("a", "c", CompatibilityRule::new("one"));
        registry.register_rule("b", "c", CompatibilityRule::new("two"));
        assert_eq!(registry.keys().len(), 2);

        registry.set_rules("a", "c", vec![CompatibilityRule::new("x"), CompatibilityRule::new("y")]);
        let labels: Vec<_> = registry.rules("a", "c").iter().map(|r| r.label().to_string()).collect();
        assert_eq!(labels, vec!["x", "y"]);

        assert!(registry.delete_rules("b", "c"));
        assert!(!registry.delete_rules("b", "c"));
        registry.clear();
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn test_rule_spec_conversion() {
        let spec: RuleSpec = serde_json::from_value(json!({
            "description": "legacy tiers",
            "rename": {"tier": "mentorship_tier"},
            "value_map": {"mentorship_tier": {"premium": "gold"}}
        }))
        .unwrap();
        let rule = CompatibilityRule::from(spec);
        let registry = CompatibilityRegistry::new();
        registry.register_rule("t", "c", rule);
        let outcome = registry.apply("t", "c", &json!({"tier": "premium"}));
        assert_eq!(outcome.data, json!({"mentorship_tier": "gold"}));
    }
}

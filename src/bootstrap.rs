//! Bootstrap manifests
//!
//! Built-in column schemas are declared in manifest files, one column per
//! file, in JSON or TOML:
//!
//! ```toml
//! table = "mentors"
//! column = "metadata"
//! description = "Mentor profile metadata"
//!
//! [[fields]]
//! field_name = "mentor_name"
//! field_type = "string"
//! required = true
//!
//! [[compatibility]]
//! description = "Rename legacy camelCase mentor keys"
//! rename = { mentorName = "mentor_name" }
//! ```
//!
//! Manifest fields go through the same builder as runtime extensions, so
//! their patterns pass the same safety check.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::compatibility::{CompatibilityRule, RuleSpec};
use crate::engine::JsonbSchemaEngine;
use crate::error::{Result, SchemaError};
use crate::extension::{validate_field_name, FieldExtensionDefinition, SchemaExtensionBuilder};
use crate::schema::{JsonbSchema, ObjectSchema, SchemaDefinition};
use crate::validator::FieldValidator;
use crate::version::SchemaVersion;

/// Column shape declared by a manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestShape {
    /// Named fields; extensible at runtime
    #[default]
    Object,
    /// Any JSON value, e.g. a free-form array column
    Json,
}

/// Declarative definition of one JSONB column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableManifest {
    pub table: String,
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub shape: ManifestShape,
    /// Falls back to `[validation] default_allow_unknown_keys`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unknown_keys: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<SchemaVersion>,
    #[serde(default)]
    pub fields: Vec<FieldExtensionDefinition>,
    #[serde(default)]
    pub compatibility: Vec<RuleSpec>,
}

impl TableManifest {
    /// Parse a `.json` or `.toml` manifest
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| SchemaError::InvalidFormat(format!("{}: {}", path.display(), e))),
            Some("toml") => toml::from_str(&content)
                .map_err(|e| SchemaError::InvalidFormat(format!("{}: {}", path.display(), e))),
            _ => Err(SchemaError::InvalidFormat(format!(
                "{}: unsupported manifest extension",
                path.display()
            ))),
        }
    }

    /// Build the registry definition
    pub fn to_definition(
        &self,
        builder: &SchemaExtensionBuilder,
        default_allow_unknown_keys: bool,
    ) -> Result<SchemaDefinition> {
        if self.table.is_empty() || self.column.is_empty() {
            return Err(SchemaError::InvalidFormat(
                "manifest table and column must be non-empty".to_string(),
            ));
        }

        let schema = match self.shape {
            ManifestShape::Json => {
                if !self.fields.is_empty() {
                    return Err(SchemaError::InvalidFormat(format!(
                        "{}.{}: json columns cannot declare fields",
                        self.table, self.column
                    )));
                }
                JsonbSchema::Value(FieldValidator::json())
            }
            ManifestShape::Object => {
                let object = ObjectSchema::new();
                for field in &self.fields {
                    validate_field_name(&field.field_name)?;
                    let validator = builder.build_field_validator(field)?;
                    if !object.add_field(field.field_name.clone(), validator) {
                        return Err(SchemaError::InvalidFormat(format!(
                            "{}.{}: duplicate field '{}'",
                            self.table, self.column, field.field_name
                        )));
                    }
                }
                JsonbSchema::Object(object)
            }
        };

        let mut definition = SchemaDefinition::new(&self.table, &self.column, schema)
            .with_version(self.version.unwrap_or_default())
            .allow_unknown_keys(self.allow_unknown_keys.unwrap_or(default_allow_unknown_keys));
        if let Some(description) = &self.description {
            definition = definition.with_description(description.clone());
        }
        Ok(definition)
    }

    pub fn compatibility_rules(&self) -> Vec<CompatibilityRule> {
        self.compatibility.iter().cloned().map(CompatibilityRule::from).collect()
    }
}

/// Read every manifest under `dir`, ordered by path
pub fn load_manifests(dir: &Path) -> Result<Vec<(PathBuf, TableManifest)>> {
    if !dir.is_dir() {
        return Err(SchemaError::Io(format!(
            "manifest directory not found: {}",
            dir.display()
        )));
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|entry| entry.into_path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map(|ext| ext == "json" || ext == "toml")
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            debug!(path = %path.display(), "loading manifest");
            let manifest = TableManifest::from_path(&path)?;
            Ok((path, manifest))
        })
        .collect()
}

impl JsonbSchemaEngine {
    /// Register a manifest's definition and install its compatibility rules
    pub fn install_manifest(&self, manifest: &TableManifest) -> Result<SchemaDefinition> {
        let builder = SchemaExtensionBuilder::new(self.config().patterns);
        let definition =
            manifest.to_definition(&builder, self.config().validation.default_allow_unknown_keys)?;
        let rules = manifest.compatibility_rules();
        if !rules.is_empty() {
            self.compatibility()
                .set_rules(&manifest.table, &manifest.column, rules);
        }
        self.register(definition.clone());
        Ok(definition)
    }

    /// Install every manifest under `dir`. Returns the number installed.
    ///
    /// All manifests are parsed and built before any is registered.
    pub fn load_manifest_dir(&self, dir: &Path) -> Result<usize> {
        let manifests = load_manifests(dir)?;
        let builder = SchemaExtensionBuilder::new(self.config().patterns);
        let default_allow = self.config().validation.default_allow_unknown_keys;
        for (path, manifest) in &manifests {
            manifest.to_definition(&builder, default_allow).map_err(|e| match e {
                SchemaError::InvalidFormat(msg) => SchemaError::InvalidFormat(msg),
                other => SchemaError::InvalidFormat(format!("{}: {}", path.display(), other)),
            })?;
        }
        for (_, manifest) in &manifests {
            self.install_manifest(manifest)?;
        }
        info!(dir = %dir.display(), count = manifests.len(), "installed schema manifests");
        Ok(manifests.len())
    }

    /// Install manifests from `[registry] manifest_dir`, if configured
    pub fn load_configured_manifests(&self) -> Result<usize> {
        match self.config().registry.manifest_dir.clone() {
            Some(dir) => self.load_manifest_dir(&dir),
            None => Ok(0),
        }
    }
}

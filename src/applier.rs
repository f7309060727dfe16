//! Extension applier
//!
//! Merges new fields into a column's live object schema. The same merge backs
//! both runtime extension requests and rehydration; the two differ only in
//! the version they propose.
//!
//! A merge is staged first: every field is validated and built before the
//! schema is touched, so an unsafe pattern or bad field name leaves no trace.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SchemaError};
use crate::extension::{validate_field_name, FieldExtensionDefinition, SchemaExtensionBuilder};
use crate::registry::SchemaRegistry;
use crate::schema::{ObjectSchema, SchemaDefinition};
use crate::validator::FieldValidator;
use crate::version::SchemaVersion;

/// Result of an extension request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionOutcome {
    pub version: SchemaVersion,
    pub added_fields: Vec<String>,
}

/// Fields built and ready to merge, with the definition they target
pub(crate) struct StagedMerge {
    definition: SchemaDefinition,
    object: ObjectSchema,
    staged: Vec<(String, FieldValidator)>,
}

impl StagedMerge {
    pub(crate) fn current_version(&self) -> SchemaVersion {
        self.definition.version
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Names that will be added, in request order
    pub(crate) fn staged_names(&self) -> impl Iterator<Item = &str> {
        self.staged.iter().map(|(name, _)| name.as_str())
    }

    /// Merge in place and register under the reconciled version.
    ///
    /// Merges into the definition registered at commit time, so a definition
    /// replaced since staging is not overwritten. Declared names are skipped
    /// even if they appeared since staging.
    pub(crate) fn commit(self, registry: &SchemaRegistry, candidate: SchemaVersion) -> ExtensionOutcome {
        let StagedMerge {
            definition: staged_definition,
            object: staged_object,
            staged,
        } = self;

        let current = registry
            .get(&staged_definition.table, &staged_definition.column)
            .and_then(|current| {
                let object = current.schema.as_object().cloned()?;
                Some((current, object))
            });
        let (mut definition, object) = current.unwrap_or((staged_definition, staged_object));

        let mut added_fields = Vec::with_capacity(staged.len());
        for (name, validator) in staged {
            if object.add_field(name.clone(), validator) {
                added_fields.push(name);
            }
        }

        let version = SchemaVersion::reconcile(definition.version, candidate);
        if added_fields.is_empty() && version == definition.version {
            return ExtensionOutcome {
                version,
                added_fields,
            };
        }

        definition.version = version;
        info!(
            table = %definition.table,
            column = %definition.column,
            version = %version,
            fields = ?added_fields,
            "merged schema extension fields"
        );
        registry.register(definition);
        ExtensionOutcome {
            version,
            added_fields,
        }
    }
}

/// Validate and build every undeclared field without mutating anything
pub(crate) fn stage_fields(
    registry: &SchemaRegistry,
    builder: &SchemaExtensionBuilder,
    table: &str,
    column: &str,
    fields: &[FieldExtensionDefinition],
) -> Result<StagedMerge> {
    let not_registered = || SchemaError::NotRegistered {
        table: table.to_string(),
        column: column.to_string(),
    };
    let definition = registry.get(table, column).ok_or_else(not_registered)?;
    let object = definition.schema.as_object().cloned().ok_or_else(not_registered)?;

    for field in fields {
        validate_field_name(&field.field_name)?;
    }

    let mut staged: Vec<(String, FieldValidator)> = Vec::new();
    for field in fields {
        let name = &field.field_name;
        if object.has_field(name) || staged.iter().any(|(n, _)| n == name) {
            debug!(table, column, field = %name, "field already declared; skipping");
            continue;
        }
        let validator = builder.build_field_validator(field)?;
        staged.push((name.clone(), validator));
    }

    Ok(StagedMerge {
        definition,
        object,
        staged,
    })
}

/// Add `fields` to the object schema registered for `(table, column)`.
///
/// Declared fields are skipped, so re-applying an extension is a no-op that
/// keeps the current version. Otherwise the version advances by one.
/// Callers must serialize concurrent merges.
pub fn apply_schema_extensions(
    registry: &SchemaRegistry,
    builder: &SchemaExtensionBuilder,
    table: &str,
    column: &str,
    fields: &[FieldExtensionDefinition],
) -> Result<ExtensionOutcome> {
    let merge = stage_fields(registry, builder, table, column, fields)?;
    if merge.is_empty() {
        return Ok(ExtensionOutcome {
            version: merge.current_version(),
            added_fields: Vec::new(),
        });
    }
    let candidate = merge.current_version().next();
    Ok(merge.commit(registry, candidate))
}

//! Engine context
//!
//! [`JsonbSchemaEngine`] owns every registry a process needs: the schema
//! registry, the compatibility rules, the extension builder, the optional
//! extension store, and the rehydration gate. Hosting services create one
//! engine and share it behind an `Arc`.

use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::applier::{self, ExtensionOutcome};
use crate::compatibility::CompatibilityRegistry;
use crate::config::EngineConfig;
use crate::error::{Result, SchemaError};
use crate::extension::{FieldExtensionDefinition, SchemaExtensionBuilder};
use crate::rehydrate::{LoadStatus, Rehydrator};
use crate::registry::{SchemaRegistry, ValidateOptions, ValidationOutcome};
use crate::schema::{SchemaDefinition, SchemaSummary};
use crate::store::{ExtensionStore, FileExtensionStore, PersistedExtensionRow};
use crate::version::SchemaVersion;

/// Process-wide schema context: registries, extension store and rehydration gate
pub struct JsonbSchemaEngine {
    config: EngineConfig,
    compatibility: Arc<CompatibilityRegistry>,
    registry: Arc<SchemaRegistry>,
    builder: SchemaExtensionBuilder,
    store: Option<Arc<dyn ExtensionStore>>,
    rehydrator: Rehydrator,
    /// Serializes extension merges and rehydration merges
    merge_lock: Arc<Mutex<()>>,
    /// Held across the store writes of one persisted extension
    persist_lock: tokio::sync::Mutex<()>,
}

impl JsonbSchemaEngine {
    pub fn new(config: EngineConfig, store: Option<Arc<dyn ExtensionStore>>) -> Self {
        let compatibility = Arc::new(CompatibilityRegistry::new());
        let registry = Arc::new(SchemaRegistry::new(Arc::clone(&compatibility)));
        let builder = SchemaExtensionBuilder::new(config.patterns);
        let merge_lock = Arc::new(Mutex::new(()));
        let rehydrator = Rehydrator::new(
            store.clone(),
            Arc::clone(&registry),
            builder.clone(),
            Arc::clone(&merge_lock),
        );
        Self {
            config,
            compatibility,
            registry,
            builder,
            store,
            rehydrator,
            merge_lock,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Engine with a file store when `[store] path` is configured
    pub fn from_config(config: EngineConfig) -> Self {
        let store = config.store.path.as_ref().map(|path| {
            debug!(path = %path.display(), "using file extension store");
            Arc::new(FileExtensionStore::new(path)) as Arc<dyn ExtensionStore>
        });
        Self::new(config, store)
    }

    /// Engine with default settings and no extension store
    pub fn in_memory() -> Self {
        Self::new(EngineConfig::default(), None)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn compatibility(&self) -> &Arc<CompatibilityRegistry> {
        &self.compatibility
    }

    pub fn store(&self) -> Option<&Arc<dyn ExtensionStore>> {
        self.store.as_ref()
    }

    pub fn register(&self, definition: SchemaDefinition) {
        self.registry.register(definition);
    }

    pub fn compare_and_set(&self, definition: SchemaDefinition, expected: SchemaVersion) -> bool {
        self.registry.compare_and_set(definition, expected)
    }

    pub fn get(&self, table: &str, column: &str) -> Option<SchemaDefinition> {
        self.registry.get(table, column)
    }

    pub fn list(&self) -> Vec<SchemaDefinition> {
        self.registry.list()
    }

    pub fn summaries(&self) -> Vec<SchemaSummary> {
        self.registry.summaries()
    }

    pub fn validate(
        &self,
        table: &str,
        column: &str,
        payload: &Value,
        options: ValidateOptions,
    ) -> Result<ValidationOutcome> {
        self.registry.validate(table, column, payload, options)
    }

    /// Merge `fields` into the live schema for `(table, column)`
    pub fn apply_schema_extensions(
        &self,
        table: &str,
        column: &str,
        fields: &[FieldExtensionDefinition],
    ) -> Result<ExtensionOutcome> {
        let _guard = self.merge_lock.lock().unwrap_or_else(PoisonError::into_inner);
        applier::apply_schema_extensions(&self.registry, &self.builder, table, column, fields)
    }

    /// Persist one row per new field, then merge them into the live schema.
    ///
    /// Rows are written under the version the merge will produce. If any write
    /// fails the live schema is left untouched, so a retry writes every row
    /// again. Fails with [`SchemaError::Storage`] when no store is configured.
    pub async fn persist_schema_extensions(
        &self,
        table: &str,
        column: &str,
        fields: &[FieldExtensionDefinition],
    ) -> Result<ExtensionOutcome> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| SchemaError::Storage("no extension store configured".to_string()))?;

        let _persisting = self.persist_lock.lock().await;
        let merge = {
            let _guard = self.merge_lock.lock().unwrap_or_else(PoisonError::into_inner);
            applier::stage_fields(&self.registry, &self.builder, table, column, fields)?
        };
        if merge.is_empty() {
            return Ok(ExtensionOutcome {
                version: merge.current_version(),
                added_fields: Vec::new(),
            });
        }

        let version = merge.current_version().next();
        let rows: Vec<PersistedExtensionRow> = merge
            .staged_names()
            .filter_map(|name| fields.iter().find(|f| f.field_name == name))
            .map(|def| PersistedExtensionRow::from_definition(table, column, def, version))
            .collect();
        for row in rows {
            store.upsert(row).await?;
        }

        let outcome = {
            let _guard = self.merge_lock.lock().unwrap_or_else(PoisonError::into_inner);
            merge.commit(&self.registry, version)
        };
        info!(
            table,
            column,
            version = %outcome.version,
            persisted = outcome.added_fields.len(),
            "persisted schema extensions"
        );
        Ok(outcome)
    }

    /// Fail with [`SchemaError::FieldAlreadyExists`] on the first declared field
    pub fn ensure_fields_absent(
        &self,
        table: &str,
        column: &str,
        fields: &[FieldExtensionDefinition],
    ) -> Result<()> {
        let definition = self.get(table, column).ok_or_else(|| SchemaError::NotRegistered {
            table: table.to_string(),
            column: column.to_string(),
        })?;
        let Some(object) = definition.schema.as_object() else {
            return Err(SchemaError::NotRegistered {
                table: table.to_string(),
                column: column.to_string(),
            });
        };
        match fields.iter().find(|f| object.has_field(&f.field_name)) {
            Some(field) => Err(SchemaError::FieldAlreadyExists {
                table: table.to_string(),
                column: column.to_string(),
                field: field.field_name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Replay persisted extensions once per process
    pub async fn ensure_jsonb_schema_extensions_loaded(&self) -> Result<()> {
        self.rehydrator.ensure_loaded().await
    }

    pub fn rehydration_status(&self) -> LoadStatus {
        self.rehydrator.status()
    }

    /// JSON Schema (draft-07) document for one column
    pub fn export_json_schema(&self, table: &str, column: &str) -> Result<Value> {
        self.get(table, column)
            .map(|definition| definition.json_schema())
            .ok_or_else(|| SchemaError::SchemaNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::FieldType;
    use crate::schema::ObjectSchema;
    use crate::store::InMemoryExtensionStore;
    use crate::validator::FieldValidator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Rejects its first write, then behaves like the in-memory store
    struct FlakyStore {
        inner: InMemoryExtensionStore,
        failed: AtomicBool,
    }

    #[async_trait]
    impl ExtensionStore for FlakyStore {
        async fn upsert(&self, row: PersistedExtensionRow) -> Result<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(SchemaError::Storage("outage".to_string()));
            }
            self.inner.upsert(row).await
        }

        async fn list_ordered(&self) -> Result<Vec<PersistedExtensionRow>> {
            self.inner.list_ordered().await
        }
    }

    fn engine(store: Option<Arc<dyn ExtensionStore>>) -> JsonbSchemaEngine {
        let engine = JsonbSchemaEngine::new(EngineConfig::default(), store);
        engine.register(SchemaDefinition::new(
            "mentors",
            "metadata",
            ObjectSchema::new().with_field("mentor_name", FieldValidator::string()),
        ));
        engine
    }

    #[tokio::test]
    async fn test_persisted_extensions_survive_restart() {
        let store: Arc<dyn ExtensionStore> = Arc::new(InMemoryExtensionStore::new());
        let first = engine(Some(Arc::clone(&store)));
        let fields = [FieldExtensionDefinition::new("tier", FieldType::String)];
        let outcome = first.persist_schema_extensions("mentors", "metadata", &fields).await.unwrap();
        assert_eq!(outcome.version.get(), 2);

        let second = engine(Some(store));
        assert!(!second.get("mentors", "metadata").unwrap().schema.as_object().unwrap().has_field("tier"));
        second.ensure_jsonb_schema_extensions_loaded().await.unwrap();
        let def = second.get("mentors", "metadata").unwrap();
        assert_eq!(def.version.get(), 2);
        assert!(def.schema.as_object().unwrap().has_field("tier"));
    }

    #[tokio::test]
    async fn test_persist_requires_store() {
        let engine = engine(None);
        let fields = [FieldExtensionDefinition::new("tier", FieldType::String)];
        let err = engine.persist_schema_extensions("mentors", "metadata", &fields).await.unwrap_err();
        assert!(matches!(err, SchemaError::Storage(_)));
        assert!(!engine.get("mentors", "metadata").unwrap().schema.as_object().unwrap().has_field("tier"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_schema_unchanged() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryExtensionStore::new(),
            failed: AtomicBool::new(false),
        });
        let engine = engine(Some(store.clone()));
        let fields = [FieldExtensionDefinition::new("tier", FieldType::String)];

        let err = engine.persist_schema_extensions("mentors", "metadata", &fields).await.unwrap_err();
        assert!(matches!(err, SchemaError::Storage(_)));
        let def = engine.get("mentors", "metadata").unwrap();
        assert_eq!(def.version, SchemaVersion::INITIAL);
        assert!(!def.schema.as_object().unwrap().has_field("tier"));

        let outcome = engine.persist_schema_extensions("mentors", "metadata", &fields).await.unwrap();
        assert_eq!(outcome.added_fields, vec!["tier"]);
        assert_eq!(outcome.version.get(), 2);
        let rows = store.list_ordered().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].field_name, "tier");
        assert_eq!(rows[0].schema_version.get(), 2);
    }

    #[test]
    fn test_ensure_fields_absent() {
        let engine = engine(None);
        let taken = [FieldExtensionDefinition::new("mentor_name", FieldType::String)];
        let err = engine.ensure_fields_absent("mentors", "metadata", &taken).unwrap_err();
        assert_eq!(err.status_code(), 409);

        let fresh = [FieldExtensionDefinition::new("tier", FieldType::String)];
        assert!(engine.ensure_fields_absent("mentors", "metadata", &fresh).is_ok());
    }

    #[test]
    fn test_export_unknown_column() {
        let err = engine(None).export_json_schema("mentors", "missing").unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}

//! Extension persistence
//!
//! The engine does not own durability. Extensions are written to an
//! [`ExtensionStore`] the hosting service provides, and read back in full at
//! rehydration. The contract is deliberately small: an upsert keyed by
//! `(table_name, jsonb_column, field_name)` and a deterministic ordered read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::extension::{FieldExtensionDefinition, FieldType, ValidationRules};
use crate::version::SchemaVersion;

/// One persisted extension field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedExtensionRow {
    pub table_name: String,
    pub jsonb_column: String,
    pub field_name: String,
    /// Kept as text so rows written by newer processes still load
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub validation_rules: ValidationRules,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schema_version: SchemaVersion,
}

impl PersistedExtensionRow {
    pub fn from_definition(
        table: &str,
        column: &str,
        def: &FieldExtensionDefinition,
        version: SchemaVersion,
    ) -> Self {
        Self {
            table_name: table.to_string(),
            jsonb_column: column.to_string(),
            field_name: def.field_name.clone(),
            field_type: def.field_type.as_str().to_string(),
            required: def.required,
            default_value: def.default_value.clone(),
            validation_rules: def.validation_rules.clone(),
            description: def.description.clone(),
            schema_version: version,
        }
    }

    /// Convert back to a definition.
    ///
    /// Fails with [`SchemaError::UnrecognizedFieldType`] for types this
    /// process does not know.
    pub fn to_definition(&self) -> Result<FieldExtensionDefinition> {
        let field_type: FieldType = self.field_type.parse()?;
        Ok(FieldExtensionDefinition {
            field_name: self.field_name.clone(),
            field_type,
            required: self.required,
            default_value: self.default_value.clone(),
            description: self.description.clone(),
            validation_rules: self.validation_rules.clone(),
        })
    }

    fn conflict_key(&self) -> (&str, &str, &str) {
        (&self.table_name, &self.jsonb_column, &self.field_name)
    }
}

/// Order rows by `(schema_version, field_name)`, the rehydration read order
pub fn sort_rows(rows: &mut [PersistedExtensionRow]) {
    rows.sort_by(|a, b| {
        a.schema_version
            .cmp(&b.schema_version)
            .then_with(|| a.field_name.cmp(&b.field_name))
    });
}

/// Storage collaborator for persisted extensions
#[async_trait]
pub trait ExtensionStore: Send + Sync {
    /// Insert or replace the row with the same conflict key
    async fn upsert(&self, row: PersistedExtensionRow) -> Result<()>;

    /// Every row, ordered by `(schema_version, field_name)`
    async fn list_ordered(&self) -> Result<Vec<PersistedExtensionRow>>;
}

/// In-memory store (for testing and development)
#[derive(Debug, Default)]
pub struct InMemoryExtensionStore {
    rows: RwLock<Vec<PersistedExtensionRow>>,
}

impl InMemoryExtensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<PersistedExtensionRow>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }
}

#[async_trait]
impl ExtensionStore for InMemoryExtensionStore {
    async fn upsert(&self, row: PersistedExtensionRow) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        upsert_row(&mut rows, row);
        Ok(())
    }

    async fn list_ordered(&self) -> Result<Vec<PersistedExtensionRow>> {
        let mut rows = self.rows.read().unwrap_or_else(PoisonError::into_inner).clone();
        sort_rows(&mut rows);
        Ok(rows)
    }
}

fn upsert_row(rows: &mut Vec<PersistedExtensionRow>, row: PersistedExtensionRow) {
    match rows.iter_mut().find(|r| r.conflict_key() == row.conflict_key()) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

/// Store backed by a single JSON file holding an array of rows.
///
/// Writes go to a sibling temp file that is then renamed over the original.
#[derive(Debug)]
pub struct FileExtensionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileExtensionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_rows(&self) -> Result<Vec<PersistedExtensionRow>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SchemaError::Storage(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            SchemaError::Storage(format!("corrupt extension file {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl ExtensionStore for FileExtensionStore {
    async fn upsert(&self, row: PersistedExtensionRow) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut rows = self.read_rows().await?;
        debug!(
            table = %row.table_name,
            column = %row.jsonb_column,
            field = %row.field_name,
            "persisting extension row"
        );
        upsert_row(&mut rows, row);
        sort_rows(&mut rows);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SchemaError::Storage(e.to_string()))?;
            }
        }
        let content = serde_json::to_string_pretty(&rows)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| SchemaError::Storage(e.to_string()))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SchemaError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list_ordered(&self) -> Result<Vec<PersistedExtensionRow>> {
        let mut rows = self.read_rows().await?;
        sort_rows(&mut rows);
        Ok(rows)
    }
}

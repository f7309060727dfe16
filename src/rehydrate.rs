//! Extension rehydration
//!
//! Replays persisted extension rows into the live registry once per process.
//! The first caller starts the load and every concurrent caller awaits the
//! same shared future, so the store is read once per attempt. A failed
//! attempt resets the gate and a later call retries.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::applier::stage_fields;
use crate::error::{Result, SchemaError};
use crate::extension::{validate_field_name, FieldExtensionDefinition, SchemaExtensionBuilder};
use crate::registry::SchemaRegistry;
use crate::schema::SchemaKey;
use crate::store::{sort_rows, ExtensionStore, PersistedExtensionRow};
use crate::version::SchemaVersion;

/// What a completed load did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RehydrationReport {
    pub rows_read: usize,
    pub groups: usize,
    pub fields_added: usize,
    pub rows_skipped: usize,
    pub groups_skipped: usize,
}

/// Observable state of the rehydration gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    NotStarted,
    Loading,
    Done,
}

type LoadFuture = Shared<BoxFuture<'static, Result<RehydrationReport>>>;

enum LoadState {
    NotStarted,
    Loading(LoadFuture),
    Done,
}

/// Single-flight gate around the persisted extension load
pub struct Rehydrator {
    state: Mutex<LoadState>,
    store: Option<Arc<dyn ExtensionStore>>,
    registry: Arc<SchemaRegistry>,
    builder: SchemaExtensionBuilder,
    merge_lock: Arc<Mutex<()>>,
}

impl Rehydrator {
    pub fn new(
        store: Option<Arc<dyn ExtensionStore>>,
        registry: Arc<SchemaRegistry>,
        builder: SchemaExtensionBuilder,
        merge_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            state: Mutex::new(LoadState::NotStarted),
            store,
            registry,
            builder,
            merge_lock,
        }
    }

    pub fn status(&self) -> LoadStatus {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            LoadState::NotStarted => LoadStatus::NotStarted,
            LoadState::Loading(_) => LoadStatus::Loading,
            LoadState::Done => LoadStatus::Done,
        }
    }

    /// Load persisted extensions if no load has completed yet.
    ///
    /// Returns immediately once a load has succeeded. Every caller that
    /// joined a failed attempt receives that attempt's error.
    pub async fn ensure_loaded(&self) -> Result<()> {
        let load = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &*state {
                LoadState::Done => return Ok(()),
                LoadState::Loading(load) => {
                    debug!("joining in-flight extension rehydration");
                    load.clone()
                }
                LoadState::NotStarted => {
                    let Some(store) = self.store.clone() else {
                        info!("no extension store configured; skipping schema extension rehydration");
                        *state = LoadState::Done;
                        return Ok(());
                    };
                    let load = load_extensions(
                        store,
                        Arc::clone(&self.registry),
                        self.builder.clone(),
                        Arc::clone(&self.merge_lock),
                    )
                    .boxed()
                    .shared();
                    *state = LoadState::Loading(load.clone());
                    load
                }
            }
        };

        let result = load.clone().await;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let LoadState::Loading(current) = &*state {
            if current.ptr_eq(&load) {
                *state = match &result {
                    Ok(_) => LoadState::Done,
                    Err(e) => {
                        warn!(error = %e, "schema extension rehydration failed; will retry on next call");
                        LoadState::NotStarted
                    }
                };
            }
        }
        result.map(|_| ())
    }
}

async fn load_extensions(
    store: Arc<dyn ExtensionStore>,
    registry: Arc<SchemaRegistry>,
    builder: SchemaExtensionBuilder,
    merge_lock: Arc<Mutex<()>>,
) -> Result<RehydrationReport> {
    let mut rows = store.list_ordered().await.map_err(|e| match e {
        SchemaError::Storage(_) => e,
        other => SchemaError::Storage(other.to_string()),
    })?;
    sort_rows(&mut rows);

    let report = merge_rows(&registry, &builder, &merge_lock, rows)?;
    info!(
        rows = report.rows_read,
        groups = report.groups,
        fields_added = report.fields_added,
        rows_skipped = report.rows_skipped,
        groups_skipped = report.groups_skipped,
        "schema extensions rehydrated"
    );
    Ok(report)
}

fn merge_rows(
    registry: &SchemaRegistry,
    builder: &SchemaExtensionBuilder,
    merge_lock: &Mutex<()>,
    rows: Vec<PersistedExtensionRow>,
) -> Result<RehydrationReport> {
    let mut report = RehydrationReport {
        rows_read: rows.len(),
        ..Default::default()
    };

    let mut groups: BTreeMap<SchemaKey, (SchemaVersion, Vec<FieldExtensionDefinition>)> = BTreeMap::new();
    for row in rows {
        let definition = match row.to_definition() {
            Ok(definition) => definition,
            Err(e) => {
                warn!(
                    table = %row.table_name,
                    column = %row.jsonb_column,
                    field = %row.field_name,
                    error = %e,
                    "skipping persisted extension row"
                );
                report.rows_skipped += 1;
                continue;
            }
        };
        if let Err(e) = validate_field_name(&definition.field_name) {
            warn!(table = %row.table_name, error = %e, "skipping persisted extension row");
            report.rows_skipped += 1;
            continue;
        }
        let entry = groups
            .entry(SchemaKey::new(&row.table_name, &row.jsonb_column))
            .or_insert_with(|| (SchemaVersion::INITIAL, Vec::new()));
        entry.0 = entry.0.max(row.schema_version);
        entry.1.push(definition);
    }
    report.groups = groups.len();

    let _guard = merge_lock.lock().unwrap_or_else(PoisonError::into_inner);
    for (key, (persisted_max, fields)) in groups {
        let merge = match stage_fields(registry, builder, &key.table, &key.column, &fields) {
            Ok(merge) => merge,
            Err(SchemaError::NotRegistered { .. }) => {
                warn!(key = %key, "no object schema registered for persisted extensions; skipping group");
                report.groups_skipped += 1;
                report.rows_skipped += fields.len();
                continue;
            }
            Err(e) => return Err(e),
        };
        let outcome = merge.commit(registry, persisted_max);
        debug!(key = %key, version = %outcome.version, added = outcome.added_fields.len(), "rehydrated group");
        report.fields_added += outcome.added_fields.len();
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compatibility::CompatibilityRegistry;
    use crate::extension::{FieldType, ValidationRules};
    use crate::registry::ValidateOptions;
    use crate::schema::{ObjectSchema, SchemaDefinition};
    use crate::store::InMemoryExtensionStore;
    use crate::validator::FieldValidator;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingStore {
        inner: InMemoryExtensionStore,
        reads: AtomicUsize,
        fail_first: bool,
    }

    impl CountingStore {
        fn new(rows: Vec<PersistedExtensionRow>, fail_first: bool) -> Self {
            Self {
                inner: InMemoryExtensionStore::with_rows(rows),
                reads: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl ExtensionStore for CountingStore {
        async fn upsert(&self, row: PersistedExtensionRow) -> Result<()> {
            self.inner.upsert(row).await
        }

        async fn list_ordered(&self) -> Result<Vec<PersistedExtensionRow>> {
            let attempt = self.reads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && attempt == 0 {
                return Err(SchemaError::Storage("connection reset".into()));
            }
            self.inner.list_ordered().await
        }
    }

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::new(Arc::new(CompatibilityRegistry::new()));
        registry.register(SchemaDefinition::new(
            "mentors",
            "metadata",
            ObjectSchema::new().with_field("mentor_name", FieldValidator::string()),
        ));
        Arc::new(registry)
    }

    fn row(table: &str, field: &str, field_type: &str, version: u32) -> PersistedExtensionRow {
        let mut row = PersistedExtensionRow::from_definition(
            table,
            "metadata",
            &FieldExtensionDefinition::new(field, FieldType::String),
            SchemaVersion::new(version),
        );
        row.field_type = field_type.to_string();
        row
    }

    fn rehydrator(store: Option<Arc<dyn ExtensionStore>>, registry: Arc<SchemaRegistry>) -> Rehydrator {
        Rehydrator::new(store, registry, SchemaExtensionBuilder::default(), Arc::new(Mutex::new(())))
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_read() {
        let store = Arc::new(CountingStore::new(vec![row("mentors", "tier", "string", 3)], false));
        let registry = registry();
        let gate = rehydrator(Some(store.clone()), registry.clone());

        let results = futures::future::join_all((0..8).map(|_| gate.ensure_loaded())).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(gate.status(), LoadStatus::Done);

        gate.ensure_loaded().await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);

        let def = registry.get("mentors", "metadata").unwrap();
        assert_eq!(def.version.get(), 3);
        assert!(def.schema.as_object().unwrap().has_field("tier"));
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let store = Arc::new(CountingStore::new(vec![row("mentors", "tier", "string", 2)], true));
        let gate = rehydrator(Some(store.clone()), registry());

        let results = futures::future::join_all((0..3).map(|_| gate.ensure_loaded())).await;
        for result in &results {
            assert_eq!(result, &Err(SchemaError::Storage("connection reset".into())));
        }
        assert_eq!(gate.status(), LoadStatus::NotStarted);

        gate.ensure_loaded().await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
        assert_eq!(gate.status(), LoadStatus::Done);
    }

    #[tokio::test]
    async fn test_missing_store_skips() {
        let gate = rehydrator(None, registry());
        gate.ensure_loaded().await.unwrap();
        assert_eq!(gate.status(), LoadStatus::Done);
    }

    #[tokio::test]
    async fn test_report_counts_skipped_rows() {
        let rows = vec![
            row("mentors", "tier", "string", 2),
            row("mentors", "location", "geopoint", 2),
            row("courses", "level", "string", 4),
        ];
        let store: Arc<dyn ExtensionStore> = Arc::new(InMemoryExtensionStore::with_rows(rows));
        let registry = registry();
        let report = load_extensions(
            store,
            registry.clone(),
            SchemaExtensionBuilder::default(),
            Arc::new(Mutex::new(())),
        )
        .await
        .unwrap();

        assert_eq!(report.rows_read, 3);
        assert_eq!(report.groups, 2);
        assert_eq!(report.fields_added, 1);
        assert_eq!(report.rows_skipped, 2);
        assert_eq!(report.groups_skipped, 1);
        assert!(registry.get("courses", "metadata").is_none());
    }

    #[tokio::test]
    async fn test_version_never_regresses() {
        let registry = registry();
        let current = registry.get("mentors", "metadata").unwrap().with_version(7);
        registry.register(current);

        let store: Arc<dyn ExtensionStore> =
            Arc::new(InMemoryExtensionStore::with_rows(vec![row("mentors", "tier", "string", 2)]));
        rehydrator(Some(store), registry.clone()).ensure_loaded().await.unwrap();
        assert_eq!(registry.version("mentors", "metadata").unwrap().get(), 7);
    }

    #[tokio::test]
    async fn test_unsafe_persisted_pattern_aborts() {
        let mut bad = row("mentors", "handle", "string", 2);
        bad.validation_rules = ValidationRules {
            pattern: Some("(a+)+$".into()),
            ..Default::default()
        };
        let store: Arc<dyn ExtensionStore> = Arc::new(InMemoryExtensionStore::with_rows(vec![bad]));
        let registry = registry();
        let gate = rehydrator(Some(store), registry.clone());

        let err = gate.ensure_loaded().await.unwrap_err();
        assert!(matches!(err, SchemaError::UnsafeRegexPattern { .. }));
        assert_eq!(registry.version("mentors", "metadata"), Some(SchemaVersion::INITIAL));
    }

    #[tokio::test]
    async fn test_persisted_row_never_replaces_declared_field() {
        let rows = vec![row("mentors", "mentor_name", "number", 2), row("mentors", "tier", "string", 2)];
        let store: Arc<dyn ExtensionStore> = Arc::new(InMemoryExtensionStore::with_rows(rows));
        let registry = registry();
        let report = load_extensions(
            store,
            registry.clone(),
            SchemaExtensionBuilder::default(),
            Arc::new(Mutex::new(())),
        )
        .await
        .unwrap();
        assert_eq!(report.fields_added, 1);

        let validate = |payload: serde_json::Value| {
            registry
                .validate("mentors", "metadata", &payload, ValidateOptions::default())
                .unwrap()
                .success
        };
        assert!(validate(json!({"mentor_name": "Ada"})));
        assert!(!validate(json!({"mentor_name": 5})));
        assert!(validate(json!({"tier": "gold"})));
    }

    #[tokio::test]
    async fn test_failing_group_keeps_earlier_groups() {
        let registry = registry();
        registry.register(SchemaDefinition::new("courses", "metadata", ObjectSchema::new()));

        let mut bad = row("mentors", "handle", "string", 3);
        bad.validation_rules = ValidationRules {
            pattern: Some("(a+)+$".into()),
            ..Default::default()
        };
        let rows = vec![row("courses", "level", "string", 2), row("mentors", "tier", "string", 3), bad];
        let store: Arc<dyn ExtensionStore> = Arc::new(InMemoryExtensionStore::with_rows(rows));

        let err = rehydrator(Some(store), registry.clone()).ensure_loaded().await.unwrap_err();
        assert!(matches!(err, SchemaError::UnsafeRegexPattern { .. }));

        let courses = registry.get("courses", "metadata").unwrap();
        assert_eq!(courses.version.get(), 2);
        assert!(courses.schema.as_object().unwrap().has_field("level"));

        let mentors = registry.get("mentors", "metadata").unwrap();
        assert_eq!(mentors.version, SchemaVersion::INITIAL);
        assert!(!mentors.schema.as_object().unwrap().has_field("tier"));
    }
}

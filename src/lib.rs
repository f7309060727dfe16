//! JSONB Schema Engine
//!
//! A versioned, runtime-extensible schema registry for JSONB document columns,
//! with a compatibility layer that rewrites legacy payloads before validation.
//!
//! ## Features
//!
//! - **Versioned Definitions**: One schema per `(table, column)`, replaced
//!   atomically or through an optimistic compare-and-set
//! - **Compatibility Rules**: Ordered renames, value maps, defaults and drops
//!   applied to a private copy of each payload
//! - **Runtime Extensions**: New fields merged into live schemas, persisted
//!   through an [`ExtensionStore`] and replayed once per process
//! - **Regex Safety**: Caller-supplied patterns are checked for catastrophic
//!   backtracking before they are compiled
//! - **JSON Schema Export**: Every definition renders as a draft-07 document
//!
//! ## Architecture
//!
//! ```text
//! JsonbSchemaEngine
//! ├── SchemaRegistry ──────── definitions by (table, column)
//! │   └── CompatibilityRegistry  legacy payload rewrites
//! ├── SchemaExtensionBuilder  field specs → validators
//! ├── ExtensionStore ──────── persisted extension rows
//! └── Rehydrator ──────────── single-flight replay of the store
//! ```

pub mod applier;
pub mod bootstrap;
pub mod compatibility;
pub mod config;
pub mod engine;
pub mod error;
pub mod extension;
pub mod fingerprint;
pub mod regex_safety;
pub mod registry;
pub mod rehydrate;
pub mod schema;
pub mod store;
pub mod validator;
pub mod version;

pub use applier::{apply_schema_extensions, ExtensionOutcome};
pub use bootstrap::{load_manifests, ManifestShape, TableManifest};
pub use compatibility::{CompatibilityOutcome, CompatibilityRegistry, CompatibilityRule, RuleSpec};
pub use config::EngineConfig;
pub use engine::JsonbSchemaEngine;
pub use error::{Result, SchemaError};
pub use extension::{
    build_field_validator, FieldExtensionDefinition, FieldType, SchemaExtensionBuilder, ValidationRules,
};
pub use fingerprint::Fingerprint;
pub use regex_safety::{check_pattern_safety, compile_pattern, PatternLimits};
pub use registry::{SchemaRegistry, ValidateOptions, ValidationOutcome};
pub use rehydrate::{LoadStatus, RehydrationReport, Rehydrator};
pub use schema::{JsonbSchema, ObjectSchema, SchemaDefinition, SchemaKey, SchemaSummary};
pub use store::{ExtensionStore, FileExtensionStore, InMemoryExtensionStore, PersistedExtensionRow};
pub use validator::{FieldKind, FieldValidator, IssueCode, StringFormat, ValidationIssue};
pub use version::SchemaVersion;

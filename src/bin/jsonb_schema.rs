//! JSONB Schema CLI
//!
//! Inspect, validate against, extend and export the schemas declared in a
//! manifest directory.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use jsonb_schemas::{
    check_pattern_safety, compile_pattern, EngineConfig, FieldExtensionDefinition, JsonbSchemaEngine,
    ValidateOptions,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jsonb-schema")]
#[command(about = "Validate, extend and export JSONB column schemas")]
struct Cli {
    /// Config file (layered over jsonb-schemas.toml and JSONB_SCHEMAS__* variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Manifest directory (overrides [registry] manifest_dir)
    #[arg(short, long, global = true)]
    manifests: Option<PathBuf>,

    /// Extension store file (overrides [store] path)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered schemas
    List {
        /// Print summaries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a payload against a column schema
    Validate {
        #[arg(short, long)]
        table: String,
        #[arg(short = 'C', long)]
        column: String,
        /// Inline JSON payload
        #[arg(short, long, conflicts_with = "file")]
        payload: Option<String>,
        /// File holding the JSON payload
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Treat every field as optional
        #[arg(long)]
        partial: bool,
        /// Drop undeclared keys instead of rejecting them
        #[arg(long)]
        strip: bool,
    },

    /// Add fields to a column schema and persist them
    Extend {
        #[arg(short, long)]
        table: String,
        #[arg(short = 'C', long)]
        column: String,
        /// JSON file with an array of field definitions
        #[arg(short, long)]
        fields: PathBuf,
        /// Fail if any field is already declared
        #[arg(long)]
        strict: bool,
    },

    /// Export a column schema as JSON Schema
    Export {
        #[arg(short, long)]
        table: String,
        #[arg(short = 'C', long)]
        column: String,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a regex pattern for catastrophic backtracking
    CheckPattern {
        pattern: String,
        /// Sample values to match against the pattern
        #[arg(long)]
        sample: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = EngineConfig::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = cli.manifests {
        config = config.with_manifest_dir(dir);
    }
    if let Some(path) = cli.store {
        config = config.with_store_path(path);
    }

    if let Commands::CheckPattern { pattern, sample } = &cli.command {
        return check_pattern(&config, pattern, sample);
    }

    let engine = JsonbSchemaEngine::from_config(config);
    engine.load_configured_manifests()?;
    engine.ensure_jsonb_schema_extensions_loaded().await?;

    match cli.command {
        Commands::List { json } => {
            let summaries = engine.summaries();
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
                return Ok(());
            }
            if summaries.is_empty() {
                println!("No schemas registered");
                return Ok(());
            }
            println!("📋 {} schema(s):", summaries.len());
            for summary in summaries {
                let fingerprint = summary
                    .fingerprint
                    .as_ref()
                    .map(|f| f.short().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {}.{} {} [{}] {} field(s)",
                    summary.table,
                    summary.column,
                    summary.version,
                    fingerprint,
                    summary.fields.len()
                );
                for field in &summary.fields {
                    println!("    └─ {}", field);
                }
            }
            Ok(())
        }

        Commands::Validate {
            table,
            column,
            payload,
            file,
            partial,
            strip,
        } => {
            let raw = match (payload, file) {
                (Some(payload), _) => payload,
                (None, Some(file)) => std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?,
                (None, None) => bail!("either --payload or --file is required"),
            };
            let payload: Value = serde_json::from_str(&raw).context("payload is not valid JSON")?;
            let options = ValidateOptions {
                allow_partial: partial,
                strip_unknown_keys: strip,
            };

            let outcome = engine.validate(&table, &column, &payload, options)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                println!("❌ {}.{} - {} issue(s)", table, column, outcome.errors.len());
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Extend {
            table,
            column,
            fields,
            strict,
        } => {
            let content = std::fs::read_to_string(&fields)
                .with_context(|| format!("failed to read {}", fields.display()))?;
            let definitions: Vec<FieldExtensionDefinition> =
                serde_json::from_str(&content).context("fields file must hold an array of field definitions")?;
            if strict {
                engine.ensure_fields_absent(&table, &column, &definitions)?;
            }

            let outcome = engine
                .persist_schema_extensions(&table, &column, &definitions)
                .await?;
            if outcome.added_fields.is_empty() {
                println!("✅ {}.{} unchanged at {}", table, column, outcome.version);
            } else {
                println!("✅ {}.{} extended to {}", table, column, outcome.version);
                for field in &outcome.added_fields {
                    println!("   └─ {}", field);
                }
            }
            Ok(())
        }

        Commands::Export {
            table,
            column,
            output,
        } => {
            let document = engine.export_json_schema(&table, &column)?;
            let content = serde_json::to_string_pretty(&document)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("✅ Exported {}.{} to {}", table, column, path.display());
                }
                None => println!("{}", content),
            }
            Ok(())
        }

        Commands::CheckPattern { .. } => Ok(()),
    }
}

fn check_pattern(config: &EngineConfig, pattern: &str, samples: &[String]) -> anyhow::Result<()> {
    if let Err(e) = check_pattern_safety(pattern, &config.patterns) {
        println!("❌ {} - {}", pattern, e);
        std::process::exit(1);
    }
    let compiled = compile_pattern(pattern, &config.patterns)?;
    println!("✅ {} - safe", pattern);
    for sample in samples {
        let marker = if compiled.is_match(sample) { "✅" } else { "❌" };
        println!("   {} {}", marker, sample);
    }
    Ok(())
}

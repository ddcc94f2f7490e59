// src/settings.rs

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use config::{builder::DefaultState, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
const DEFAULT_COLLECTION: &str = "sacramento";

#[derive(Parser, Debug)]
#[command(version, about = "Healthcare provider directory search")]
pub struct Args {
    /// Path to the local configuration TOML file.
    #[arg(short, long, value_name = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Infer column types from a CSV file and write them as a schema file.
    Schema {
        #[arg(value_name = "CSV_PATH")]
        csv: PathBuf,
        #[arg(value_name = "SCHEMA_PATH", default_value = "schema.json")]
        output: PathBuf,
    },
    /// Load CSV rows into the provider collection.
    Import {
        #[arg(value_name = "CSV_PATH")]
        csv: PathBuf,
        /// Schema file produced by `schema`; inferred from the CSV when omitted.
        #[arg(long, value_name = "SCHEMA_PATH")]
        schema: Option<PathBuf>,
    },
    /// Ask questions about providers interactively.
    Chat,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QdrantSettings {
    pub url: String,
    pub collection: String,
    pub vector_size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OllamaSettings {
    pub host: String,
    pub port: u16,
    pub chat_model: String,
    pub embed_model: String,
}

/// Maps a CSV header to the property name stored in the collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
}

impl ColumnMapping {
    fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImportSettings {
    pub batch_size: usize,
    pub progress_interval: usize,
    pub latitude_column: Option<String>,
    pub longitude_column: Option<String>,
    /// Properties whose values are joined to form the embedded text.
    #[serde(default = "default_embed_fields")]
    pub embed_fields: Vec<String>,
    /// Empty means every CSV column is stored under its own header name.
    #[serde(default = "default_columns")]
    pub columns: Vec<ColumnMapping>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatSettings {
    pub result_limit: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Settings {
    pub qdrant: QdrantSettings,
    pub ollama: OllamaSettings,
    pub import: ImportSettings,
    pub chat: ChatSettings,
}

impl Settings {
    /// Load settings from the given TOML file, with sane defaults.
    ///
    /// `HEALTHSCOUT_<SECTION>__<KEY>` environment variables override both.
    pub fn from_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(
                Environment::with_prefix("HEALTHSCOUT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigBuilder::<DefaultState>::default()
            .set_default("qdrant.url", DEFAULT_QDRANT_URL)?
            .set_default("qdrant.collection", DEFAULT_COLLECTION)?
            .set_default("qdrant.vector_size", 768)?
            .set_default("ollama.host", "http://127.0.0.1")?
            .set_default("ollama.port", 11434)?
            .set_default("ollama.chat_model", "llama3.1")?
            .set_default("ollama.embed_model", "nomic-embed-text")?
            .set_default("import.batch_size", 200)?
            .set_default("import.progress_interval", 100)?
            .set_default("import.latitude_column", "Latitude")?
            .set_default("import.longitude_column", "Longitude")?
            .set_default("chat.result_limit", 3)
    }
}

fn default_embed_fields() -> Vec<String> {
    vec!["specialization".to_string(), "search_tags".to_string()]
}

fn default_columns() -> Vec<ColumnMapping> {
    [
        ("Provider First Name", "first_name"),
        ("Provider Last Name", "last_name"),
        ("Telephone Number", "doc_phone"),
        ("Cred", "doc_title"),
        ("pri_spec", "specialization"),
        ("adr_ln_1", "doc_address"),
        ("Managed Care Plan", "insurance_name"),
        ("Facility Name", "facility_name"),
        ("City/Town", "city"),
        ("Transportation Provider", "transportation_name"),
        ("Phone Number for Transportation", "transportation_phone"),
        ("Benefit Description", "transportation_desc"),
        ("terms", "search_tags"),
    ]
    .into_iter()
    .map(|(source, target)| ColumnMapping::new(source, target))
    .collect()
}

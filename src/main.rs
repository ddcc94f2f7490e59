mod chat;
mod import;
mod llm;
mod schema;
mod settings;
mod vector_db;

use std::io;
use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;
use llm::Assistant;
use settings::{Args, Command, Settings};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vector_db::VectorStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let settings = match Settings::from_file(args.config.as_deref()) {
        Ok(ret) => ret,
        Err(error) => {
            eprintln!("Problem while loading settings. {error}");
            exit(1);
        }
    };

    if let Err(error) = run(args.command, &settings).await {
        error!("{error:#}");
        exit(1);
    }
}

async fn run(command: Command, settings: &Settings) -> Result<()> {
    match command {
        Command::Schema { csv, output } => {
            schema::generate_schema(&csv, &output)?;
        }
        Command::Import { csv, schema } => {
            let properties = match schema {
                Some(path) => schema::read_schema_file(&path)?,
                None => {
                    let table = schema::read_table_from_path(&csv)?;
                    schema::build_schema(&table.header, &table.rows)
                }
            };
            let store = VectorStore::connect(&settings.qdrant.url)?;
            let assistant = Assistant::new(&settings.ollama)?;
            let total = import::import_csv(&store, &assistant, settings, &csv, &properties)
                .await
                .with_context(|| format!("Failed to import {}", csv.display()))?;
            info!("Imported {total} records into '{}'", settings.qdrant.collection);
        }
        Command::Chat => {
            let store = VectorStore::connect(&settings.qdrant.url)?;
            let assistant = Assistant::new(&settings.ollama)?;
            chat::run(
                &assistant,
                &store,
                settings,
                io::stdin().lock(),
                io::stdout(),
            )
            .await?;
        }
    }
    Ok(())
}

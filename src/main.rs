use std::path::PathBuf;
use std::sync::Arc;

use abnosql::backend::BackendKind;
use abnosql::sql::{bind_parameters, validate_statement, BindStyle};
use abnosql::value::item_from_json;
use abnosql::{Database, Parameters, PluginRegistry, Settings, TableConfig, Value};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Validate, bind and run portable read-only SQL
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that a statement is a single read-only SELECT
    Validate { statement: String },

    /// Bind @parameters and print the backend-ready statement as JSON
    Bind {
        statement: String,
        /// Parameter as @name=<json>; non-JSON values are taken as strings
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
        #[arg(long, value_enum, default_value_t = Style::Named)]
        style: Style,
    },

    /// Run a statement against an in-memory table seeded from a JSON array
    Query {
        #[arg(long)]
        table: String,
        /// Hash key name, then the optional range key name
        #[arg(long, value_delimiter = ',', required = true)]
        key_attrs: Vec<String>,
        #[arg(long)]
        seed: Option<PathBuf>,
        statement: String,
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        cursor: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Style {
    /// Keep @name placeholders (Cosmos)
    Named,
    /// Replace placeholders with ? (DynamoDB PartiQL)
    Positional,
}

fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected @name=value, got {raw:?}"))?;
    if !name.starts_with('@') {
        return Err(format!("parameter name must start with @, got {name:?}"));
    }
    let value = serde_json::from_str(value)
        .map(Value::from_json)
        .unwrap_or_else(|_| Value::from(value));
    Ok((name.to_string(), value))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { statement } => {
            validate_statement(&statement)?;
            println!("ok");
        }
        Command::Bind {
            statement,
            params,
            style,
        } => {
            let params: Parameters = params.into_iter().collect();
            let style = match style {
                Style::Named => BindStyle::Named,
                Style::Positional => BindStyle::Positional("?"),
            };
            validate_statement(&statement)?;
            let bound = bind_parameters(
                &statement,
                &params,
                |name, value| Ok(serde_json::json!({"name": name, "value": value.to_json()})),
                style,
            )?;
            print_json(&serde_json::json!({
                "statement": bound.statement,
                "params": bound.params,
            }))?;
        }
        Command::Query {
            table,
            key_attrs,
            seed,
            statement,
            params,
            limit,
            cursor,
        } => {
            let settings = Settings::load_default().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring settings file");
                Settings::default()
            });
            let registry = Arc::new(PluginRegistry::from_settings(&settings));
            let db = Database::new(registry).with_settings(settings);
            let tb = db.table_with(
                &table,
                Some(TableConfig::with_key_attrs(key_attrs)),
                Some(BackendKind::Memory),
            )?;

            if let Some(path) = seed {
                let data = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let rows: Vec<serde_json::Map<String, serde_json::Value>> =
                    serde_json::from_str(&data)
                        .with_context(|| format!("{} must hold a JSON array of objects", path.display()))?;
                tb.put_items(rows.into_iter().map(item_from_json).collect())?;
            }

            let params: Parameters = params.into_iter().collect();
            let page = tb.query_sql(&statement, Some(&params), limit, cursor.as_deref())?;
            print_json(&page.to_json())?;
        }
    }

    Ok(())
}

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use attribute_store_api::{load_config, AttributeStoreApi};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "astore")]
#[command(about = "User attribute store CLI")]
struct Cli {
    #[arg(long, default_value = "./attribute_store.sqlite3")]
    db: PathBuf,

    /// YAML file with patterns, upload policy and export directory.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Export(ExportArgs),
    Import(ImportArgs),
    Entries {
        #[command(subcommand)]
        command: EntriesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    user_ids: String,
    #[arg(long)]
    attributes: String,
    /// Write the CSV here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum EntriesCommand {
    List,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let api = AttributeStoreApi::new(cli.db, &config)?;

    match cli.command {
        Command::Db { command } => run_db(&command, &api),
        Command::Export(args) => run_export(&args, &api),
        Command::Import(args) => run_import(&args, &api),
        Command::Entries { command: EntriesCommand::List } => run_entries_list(&api),
    }
}

fn run_db(command: &DbCommand, api: &AttributeStoreApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(api.integrity_check()?)?),
    }
}

fn run_export(args: &ExportArgs, api: &AttributeStoreApi) -> Result<()> {
    let export = api.export(&args.user_ids, &args.attributes)?;

    let Some(out) = args.out.as_ref() else {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&export.bytes).context("failed to write CSV to stdout")?;
        return stdout.flush().context("failed to flush stdout");
    };

    fs::write(out, &export.bytes)
        .with_context(|| format!("failed to write export file {}", out.display()))?;
    emit_json(serde_json::json!({
        "out": out.display().to_string(),
        "rows": export.rows
    }))
}

fn run_import(args: &ImportArgs, api: &AttributeStoreApi) -> Result<()> {
    let body = fs::read(&args.input)
        .with_context(|| format!("failed to read import file {}", args.input.display()))?;
    let summary = api.import_csv(&body)?;
    emit_json(serde_json::json!({
        "in": args.input.display().to_string(),
        "imported_rows": summary.rows
    }))
}

fn run_entries_list(api: &AttributeStoreApi) -> Result<()> {
    let entries = api.list_entries()?;
    emit_json(serde_json::json!({ "entries": entries }))
}

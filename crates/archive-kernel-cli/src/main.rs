use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use archive_kernel_api::{ArchiveKernelApi, AuditQuery, KernelConfig};
use archive_kernel_core::{
    Actor, ArchivalId, ArchiveError, ArchiveRequest, AuditOperation, RecordId, RequestOrigin,
    RestoreRequest,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ak")]
#[command(about = "Archive Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./archive_kernel.sqlite3")]
    db: PathBuf,

    /// YAML file with layout, defaults policy and timeouts.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    busy_timeout_ms: Option<u64>,

    #[arg(long)]
    operation_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    Archive(ArchiveArgs),
    Restore(RestoreArgs),
    Archives {
        #[command(subcommand)]
        command: ArchivesCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum SchemaCommand {
    Describe {
        #[arg(default_value = "users")]
        entity: String,
    },
}

#[derive(Debug, Args)]
struct ActorArgs {
    #[arg(long)]
    admin_id: i64,
    #[arg(long, default_value = "")]
    admin_role: String,
}

impl ActorArgs {
    fn actor(&self) -> Actor {
        Actor { admin_id: RecordId(self.admin_id), role: self.admin_role.clone() }
    }
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    #[arg(long = "id")]
    original_id: i64,
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long)]
    archival_id: i64,
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    reason: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ArchivesCommand {
    List {
        #[arg(long)]
        original_id: Option<i64>,
    },
    Show {
        #[arg(long)]
        archival_id: i64,
    },
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    List {
        #[arg(long)]
        archival_id: Option<i64>,
        #[arg(long)]
        original_id: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
    },
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

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value)?)
}

fn load_config(cli: &Cli) -> Result<KernelConfig> {
    let mut config = match &cli.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };
    if let Some(ms) = cli.busy_timeout_ms {
        config.timeouts.busy_timeout_ms = ms;
    }
    if let Some(ms) = cli.operation_timeout_ms {
        config.timeouts.operation_timeout_ms = ms;
    }
    Ok(config)
}

fn main() -> ExitCode {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("archive_kernel=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let operation = match cli.command {
        Command::Archive(_) => Some(AuditOperation::Archive),
        Command::Restore(_) => Some(AuditOperation::Restore),
        _ => None,
    };

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_failure(&err, operation);
            ExitCode::FAILURE
        }
    }
}

/// Kernel errors are reported as JSON on stdout with their public message; anything else
/// is a local problem (bad config, unreadable file) and goes to stderr in full.
fn report_failure(err: &anyhow::Error, operation: Option<AuditOperation>) {
    let Some(archive_error) = err.downcast_ref::<ArchiveError>() else {
        eprintln!("error: {err:#}");
        return;
    };
    let body = failure_body(archive_error, operation);
    if let Err(emit_err) = emit_json(body) {
        eprintln!("error: {} ({emit_err})", archive_error.request_message(operation));
    }
}

fn failure_body(archive_error: &ArchiveError, operation: Option<AuditOperation>) -> Value {
    serde_json::json!({
        "error": {
            "code": archive_error.code(),
            "message": archive_error.request_message(operation),
            "retryable": archive_error.is_retryable(),
        }
    })
}

fn run(cli: &Cli) -> Result<()> {
    let api = ArchiveKernelApi::with_config(cli.db.clone(), load_config(cli)?);
    match &cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Schema { command: SchemaCommand::Describe { entity } } => {
            emit(&api.describe(entity)?)
        }
        Command::Archive(args) => run_archive(args, &api),
        Command::Restore(args) => run_restore(args, &api),
        Command::Archives { command } => run_archives(command, &api),
        Command::Audit { command: AuditCommand::List { archival_id, original_id, limit } } => {
            let entries = api.list_audit(&AuditQuery {
                archival_id: archival_id.map(ArchivalId),
                original_id: original_id.map(RecordId),
                limit: *limit,
            })?;
            emit_json(serde_json::json!({ "entries": entries }))
        }
    }
}

fn run_db(command: &DbCommand, api: &ArchiveKernelApi) -> Result<()> {
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
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
    }
}

fn run_archive(args: &ArchiveArgs, api: &ArchiveKernelApi) -> Result<()> {
    let outcome = api.archive(&ArchiveRequest {
        original_id: RecordId(args.original_id),
        actor: args.actor.actor(),
        reason: args.reason.clone(),
        notes: args.notes.clone(),
        origin: cli_origin(),
    })?;
    emit(&outcome)
}

fn run_restore(args: &RestoreArgs, api: &ArchiveKernelApi) -> Result<()> {
    let outcome = api.restore(&RestoreRequest {
        archival_id: ArchivalId(args.archival_id),
        actor: args.actor.actor(),
        reason: args.reason.clone(),
        origin: cli_origin(),
    })?;
    emit(&outcome)
}

fn run_archives(command: &ArchivesCommand, api: &ArchiveKernelApi) -> Result<()> {
    match command {
        ArchivesCommand::List { original_id } => {
            let records = api.list_archives(original_id.map(RecordId))?;
            emit_json(serde_json::json!({ "archives": records }))
        }
        ArchivesCommand::Show { archival_id } => emit(&api.get_archive(ArchivalId(*archival_id))?),
    }
}

fn cli_origin() -> RequestOrigin {
    RequestOrigin { ip: None, user_agent: Some(format!("ak/{}", env!("CARGO_PKG_VERSION"))) }
}

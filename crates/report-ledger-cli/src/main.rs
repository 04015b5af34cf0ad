use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use report_ledger_core::{
    ActorId, ChangeSeq, Content, EntityKind, EntryIdent, HistoryError, HistoryIdent, ReportId,
};
use report_ledger_store_sqlite::{SqliteStore, VersionUpdateRequest};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "RL_LOG";

#[derive(Debug, Parser)]
#[command(name = "rl")]
#[command(about = "Report change-history ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./report_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
    Entry {
        #[command(subcommand)]
        command: Box<EntryCommand>,
    },
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    DataHistory {
        #[command(subcommand)]
        command: Box<DataHistoryCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(OutArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct OutArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    Create {
        #[arg(long)]
        patient_label: String,
    },
    Show {
        #[arg(long)]
        report_id: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    GenomicAlterationIdentified,
    TherapeuticEvent,
    DetailedAlteration,
    AnalystComment,
    TumourAnalysis,
    KbMatch,
}

impl From<KindArg> for EntityKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::GenomicAlterationIdentified => Self::GenomicAlterationIdentified,
            KindArg::TherapeuticEvent => Self::TherapeuticEvent,
            KindArg::DetailedAlteration => Self::DetailedAlteration,
            KindArg::AnalystComment => Self::AnalystComment,
            KindArg::TumourAnalysis => Self::TumourAnalysis,
            KindArg::KbMatch => Self::KbMatch,
        }
    }
}

#[derive(Debug, Args)]
struct ActorArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Args)]
struct EntryRef {
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(long)]
    ident: String,
}

#[derive(Debug, Subcommand)]
enum EntryCommand {
    Create {
        #[arg(long, value_enum)]
        kind: KindArg,
        #[arg(long)]
        report_id: String,
        /// Record content as a JSON object.
        #[arg(long)]
        content: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        display_name: Option<String>,
    },
    Update {
        #[command(flatten)]
        entry: EntryRef,
        #[arg(long)]
        field: String,
        /// New field value as JSON; bare words are taken as strings.
        #[arg(long)]
        value: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    Delete {
        #[command(flatten)]
        entry: EntryRef,
        #[command(flatten)]
        actor: ActorArgs,
        /// Also delete dependent therapeutic events and detailed alterations.
        #[arg(long, default_value_t = false)]
        cascade: bool,
    },
    Get(EntryRef),
    Versions(EntryRef),
    List {
        #[arg(long, value_enum)]
        kind: KindArg,
        #[arg(long)]
        report_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum LedgerCommand {
    List {
        #[arg(long)]
        report_id: String,
    },
    Show {
        #[arg(long)]
        sequence: i64,
    },
    Revert {
        #[arg(long)]
        sequence: i64,
        #[command(flatten)]
        actor: ActorArgs,
    },
    Outbox,
    Retry {
        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

#[derive(Debug, Subcommand)]
enum DataHistoryCommand {
    VersionUpdate {
        #[command(flatten)]
        entry: EntryRef,
        #[arg(long)]
        content: String,
        #[command(flatten)]
        actor: ActorArgs,
        /// Keep the current version visible and skip the history entry.
        #[arg(long, default_value_t = false)]
        append_only: bool,
        #[arg(long, default_value = "ident")]
        retire_key: String,
        #[arg(long = "carry", default_values_t = ["ident".to_string()])]
        carried_columns: Vec<String>,
    },
    Revert {
        #[arg(long)]
        ident: String,
        #[command(flatten)]
        actor: ActorArgs,
    },
    Detail {
        #[arg(long)]
        ident: String,
    },
    Restore {
        #[arg(long)]
        ident: String,
        #[arg(long)]
        actor: String,
    },
    List {
        #[arg(long)]
        report_id: String,
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

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow!("failed to initialize tracing subscriber: {error}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Report { command } => {
            store.migrate()?;
            run_report(command, &mut store)
        }
        Command::Entry { command } => {
            store.migrate()?;
            run_entry(*command, &mut store)
        }
        Command::Ledger { command } => {
            store.migrate()?;
            run_ledger(command, &mut store)
        }
        Command::DataHistory { command } => {
            store.migrate()?;
            run_data_history(*command, &mut store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => {
            store.migrate()?;
            let manifest = store.export_audit(&args.out)?;
            emit_json(serde_json::json!({
                "export_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_report(command: ReportCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        ReportCommand::Create { patient_label } => {
            let report = store.create_report(&patient_label)?;
            emit_json(serde_json::to_value(&report).context("failed to serialize report")?)
        }
        ReportCommand::Show { report_id } => {
            let report_id = report_id.parse::<ReportId>()?;
            let report = store.get_report(report_id)?.ok_or_else(|| {
                HistoryError::not_found(format!("report {report_id} does not exist"))
            })?;
            emit_json(serde_json::json!({
                "report": report,
                "events": store.list_report_events(report_id)?,
                "data_history": store.data_history_for_report(report_id)?
            }))
        }
    }
}

fn run_entry(command: EntryCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        EntryCommand::Create { kind, report_id, content, actor, display_name } => {
            let written = store.create_entry(
                kind.into(),
                report_id.parse()?,
                parse_content(&content)?,
                &ActorId::new(actor)?,
                display_name,
            )?;
            emit_json(serde_json::to_value(&written).context("failed to serialize entry")?)
        }
        EntryCommand::Update { entry, field, value, actor } => {
            let written = store.update_entry_field(
                entry.kind.into(),
                entry.ident.parse()?,
                &field,
                parse_value(&value),
                &ActorId::new(actor.actor)?,
                actor.comment,
            )?;
            emit_json(serde_json::to_value(&written).context("failed to serialize entry")?)
        }
        EntryCommand::Delete { entry, actor, cascade } => {
            let outcome = store.delete_entry(
                entry.kind.into(),
                entry.ident.parse()?,
                &ActorId::new(actor.actor)?,
                actor.comment,
                cascade,
            )?;
            emit_json(serde_json::to_value(&outcome).context("failed to serialize deletion")?)
        }
        EntryCommand::Get(entry) => {
            let kind = EntityKind::from(entry.kind);
            let ident = entry.ident.parse::<EntryIdent>()?;
            let row = store.get_entry(kind, ident)?.ok_or_else(|| {
                HistoryError::not_found(format!("no live {kind} with ident {ident}"))
            })?;
            emit_json(serde_json::to_value(&row).context("failed to serialize entry")?)
        }
        EntryCommand::Versions(entry) => {
            let versions = store.entry_versions(entry.kind.into(), entry.ident.parse()?)?;
            emit_json(serde_json::json!({ "versions": versions }))
        }
        EntryCommand::List { kind, report_id } => {
            let entries = store.list_entries(kind.into(), report_id.parse()?)?;
            emit_json(serde_json::json!({ "entries": entries }))
        }
    }
}

fn run_ledger(command: LedgerCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        LedgerCommand::List { report_id } => {
            let events = store.list_report_events(report_id.parse()?)?;
            emit_json(serde_json::json!({ "events": events }))
        }
        LedgerCommand::Show { sequence } => {
            let event = store.get_event(ChangeSeq(sequence))?.ok_or_else(|| {
                HistoryError::not_found(format!("change history event {sequence} does not exist"))
            })?;
            emit_json(serde_json::to_value(&event).context("failed to serialize event")?)
        }
        LedgerCommand::Revert { sequence, actor } => {
            let recorded =
                store.try_revert(ChangeSeq(sequence), &ActorId::new(actor.actor)?, actor.comment)?;
            emit_json(serde_json::json!({
                "reverted": sequence,
                "recorded": recorded
            }))
        }
        LedgerCommand::Outbox => {
            let pending = store.pending_outbox()?;
            emit_json(serde_json::json!({ "pending": pending }))
        }
        LedgerCommand::Retry { max_attempts } => {
            let summary = store.replay_outbox(max_attempts)?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize replay summary")?)
        }
    }
}

fn run_data_history(command: DataHistoryCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DataHistoryCommand::VersionUpdate {
            entry,
            content,
            actor,
            append_only,
            retire_key,
            carried_columns,
        } => {
            let kind = EntityKind::from(entry.kind);
            let ident = entry.ident.parse::<EntryIdent>()?;
            let current = store.get_entry(kind, ident)?.ok_or_else(|| {
                HistoryError::not_found(format!("no live {kind} with ident {ident}"))
            })?;

            let actor_id = ActorId::new(actor.actor)?;
            let mut request = VersionUpdateRequest::new(current, parse_content(&content)?, actor_id)
                .carrying(carried_columns);
            request = if append_only {
                request.append_only()
            } else {
                request.retire_by(retire_key)
            };
            if let Some(comment) = actor.comment {
                request = request.with_comment(comment);
            }
            let outcome = store.version_update(&request)?;
            emit_json(serde_json::to_value(&outcome).context("failed to serialize version update")?)
        }
        DataHistoryCommand::Revert { ident, actor } => {
            let entry = store.data_history_revert(
                ident.parse::<HistoryIdent>()?,
                &ActorId::new(actor.actor)?,
                actor.comment,
            )?;
            emit_json(serde_json::to_value(&entry).context("failed to serialize history entry")?)
        }
        DataHistoryCommand::Detail { ident } => {
            let versions = store.data_history_detail(ident.parse()?)?;
            emit_json(serde_json::json!({ "versions": versions }))
        }
        DataHistoryCommand::Restore { ident, actor } => {
            let entry = store.data_history_restore(ident.parse()?, &ActorId::new(actor)?)?;
            emit_json(serde_json::to_value(&entry).context("failed to serialize history entry")?)
        }
        DataHistoryCommand::List { report_id } => {
            let entries = store.data_history_for_report(report_id.parse()?)?;
            emit_json(serde_json::json!({ "entries": entries }))
        }
    }
}

fn parse_content(raw: &str) -> Result<Content> {
    match serde_json::from_str::<Value>(raw).context("content must be valid JSON")? {
        Value::Object(map) => Ok(map),
        other => Err(HistoryError::validation(format!(
            "content must be a JSON object, got `{other}`"
        ))
        .into()),
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_words_parse_as_strings() {
        assert_eq!(parse_value("TP53 (p.R175H)"), Value::String("TP53 (p.R175H)".to_string()));
        assert_eq!(parse_value("42"), serde_json::json!(42));
        assert_eq!(parse_value("\"quoted\""), serde_json::json!("quoted"));
    }

    #[test]
    fn content_must_be_an_object() {
        assert!(parse_content("[1, 2]").is_err());
        assert!(parse_content("{\"comments\": \"ok\"}").is_ok());
    }
}

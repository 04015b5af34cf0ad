use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use report_ledger_core::{EntityKind, HistoryError, HistoryErrorKind};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

mod accessor;
mod cascade;
mod data_history;
mod entries;
mod ledger;
mod revert;
mod versioning;

pub use accessor::{DeleteOptions, EntityAccessor, EntityRegistry, RowFilter, TableAccessor};
pub use cascade::CascadeSummary;
pub use entries::{DeleteOutcome, EntryWrite, Report};
pub use ledger::{LedgerOutboxEntry, OutboxReplaySummary};
pub use versioning::{VersionUpdateOutcome, VersionUpdateRequest};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_REPORTS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS reports (
  report_id TEXT PRIMARY KEY,
  patient_label TEXT NOT NULL CHECK (length(trim(patient_label)) > 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_history (
  ident TEXT PRIMARY KEY,
  history_type TEXT NOT NULL CHECK (history_type IN ('change')),
  table_name TEXT NOT NULL,
  entity_kind TEXT NOT NULL,
  target_ident TEXT NOT NULL,
  previous_version INTEGER NOT NULL CHECK (previous_version >= 1),
  new_version INTEGER NOT NULL CHECK (new_version >= 1),
  owner_report_id TEXT NOT NULL REFERENCES reports(report_id) ON DELETE CASCADE,
  actor_id TEXT NOT NULL,
  comment TEXT,
  created_at TEXT NOT NULL,
  deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_data_history_owner ON data_history(owner_report_id);
CREATE INDEX IF NOT EXISTS idx_data_history_target ON data_history(target_ident);
";

const MIGRATION_002_LEDGER_SQL: &str = r"
CREATE TABLE IF NOT EXISTS change_history (
  sequence INTEGER PRIMARY KEY AUTOINCREMENT,
  event_type TEXT NOT NULL CHECK (event_type IN ('create', 'update', 'delete')),
  entry_ident TEXT NOT NULL,
  entity_kind TEXT NOT NULL,
  table_name TEXT NOT NULL,
  field_name TEXT,
  previous_value_json TEXT,
  new_value_json TEXT,
  deleted_snapshot_json TEXT,
  actor_id TEXT NOT NULL CHECK (length(trim(actor_id)) > 0),
  display_name TEXT,
  comment TEXT,
  created_at TEXT NOT NULL,
  CHECK (
    event_type != 'update'
    OR (field_name IS NOT NULL AND previous_value_json IS NOT NULL AND new_value_json IS NOT NULL)
  ),
  CHECK (event_type != 'delete' OR deleted_snapshot_json IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS report_change_history (
  change_history_sequence INTEGER NOT NULL UNIQUE REFERENCES change_history(sequence),
  report_id TEXT NOT NULL REFERENCES reports(report_id)
);

CREATE TABLE IF NOT EXISTS ledger_outbox (
  outbox_id INTEGER PRIMARY KEY AUTOINCREMENT,
  report_id TEXT NOT NULL,
  pending_event_json TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  created_at TEXT NOT NULL,
  delivered_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_report_change_history_report
  ON report_change_history(report_id, change_history_sequence);
CREATE INDEX IF NOT EXISTS idx_change_history_entry ON change_history(entry_ident);
CREATE INDEX IF NOT EXISTS idx_ledger_outbox_pending ON ledger_outbox(delivered_at, outbox_id);

CREATE TRIGGER IF NOT EXISTS change_history_no_update
BEFORE UPDATE ON change_history
BEGIN
  SELECT RAISE(ABORT, 'change_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS change_history_no_delete
BEFORE DELETE ON change_history
BEGIN
  SELECT RAISE(ABORT, 'change_history is append-only');
END;
";

/// Tunables applied when a store is opened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub busy_timeout_ms: u32,
    /// Delivery attempts after which a parked ledger event is no longer replayed.
    pub outbox_max_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { busy_timeout_ms: 5000, outbox_max_attempts: 5 }
    }
}

pub struct SqliteStore {
    conn: Connection,
    registry: EntityRegistry,
    config: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
    /// Ledger events left out of the export because they have no report link.
    pub unlinked_ledger_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Change-history events that no report can list.
    pub unlinked_ledger_events: usize,
    pub pending_outbox_events: usize,
    /// Parked events that reached the replay attempt limit.
    pub stalled_outbox_events: usize,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.unlinked_ledger_events == 0
            && self.pending_outbox_events == 0
            && self.schema_status.pending_versions.is_empty()
    }
}

impl SqliteStore {
    /// Open a SQLite-backed report store with default configuration.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Open a SQLite-backed report store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_config(path: &Path, config: StoreConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, registry: EntityRegistry::standard(), config })
    }

    #[must_use]
    pub fn config(&self) -> StoreConfig {
        self.config
    }

    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let mut sql = MIGRATION_001_REPORTS_SQL.to_string();
            for kind in EntityKind::ALL {
                sql.push_str(&entity_table_sql(kind));
            }
            self.apply_migration(1, &sql)?;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_LEDGER_SQL)?;
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration {version}"))?;
        tracing::debug!(version, "applied schema migration");
        Ok(())
    }

    /// Export the report-linked ledger, data-history entries, and undelivered outbox events as
    /// NDJSON files with a SHA-256 manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_audit(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let events = ledger::list_all_events(&self.conn)?;
        let history = data_history::list_all(&self.conn)?;
        let parked = ledger::pending_outbox(&self.conn)?;
        let files = vec![
            write_audit_file(out_dir, "change_history.ndjson", &events)?,
            write_audit_file(out_dir, "data_history.ndjson", &history)?,
            write_audit_file(out_dir, "ledger_outbox.ndjson", &parked)?,
        ];
        let manifest = ExportManifest {
            schema_version: current_schema_version(&self.conn)?,
            exported_at: now_rfc3339()?,
            files,
            unlinked_ledger_events: ledger::count_unlinked_events(&self.conn)?,
        };
        if manifest.unlinked_ledger_events > 0 {
            tracing::warn!(
                unlinked = manifest.unlinked_ledger_events,
                "audit export skipped ledger events without a report link"
            );
        }

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        tracing::info!(out_dir = %out_dir.display(), "exported audit trail");
        Ok(manifest)
    }

    /// Check storage health and the ledger invariants: every event linked to a report and
    /// no parked events left behind.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let foreign_key_violations = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        let schema_status = self.schema_status()?;
        let (unlinked_ledger_events, pending_outbox_events, stalled_outbox_events) =
            if schema_status.current_version >= 2 {
                let pending = ledger::pending_outbox(&self.conn)?;
                let stalled = pending
                    .iter()
                    .filter(|entry| entry.attempts >= self.config.outbox_max_attempts)
                    .count();
                (ledger::count_unlinked_events(&self.conn)?, pending.len(), stalled)
            } else {
                (0, 0, 0)
            };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            unlinked_ledger_events,
            pending_outbox_events,
            stalled_outbox_events,
            schema_status,
        })
    }
}

/// Map an error raised anywhere in the store onto the domain error taxonomy.
///
/// Errors that carry no [`HistoryError`] in their chain are storage failures.
#[must_use]
pub fn classify(err: &anyhow::Error) -> HistoryErrorKind {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<HistoryError>())
        .map_or(HistoryErrorKind::Storage, HistoryError::kind)
}

fn entity_table_sql(kind: EntityKind) -> String {
    let table = kind.table_name();
    format!(
        r"
CREATE TABLE IF NOT EXISTS {table} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ident TEXT NOT NULL,
  report_id TEXT NOT NULL REFERENCES reports(report_id) ON DELETE CASCADE,
  data_version INTEGER NOT NULL CHECK (data_version >= 1),
  content_json TEXT NOT NULL CHECK (json_valid(content_json)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  UNIQUE (ident, data_version)
);

CREATE INDEX IF NOT EXISTS idx_{table}_report ON {table}(report_id, deleted_at);
"
    )
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

pub(crate) fn parse_optional_rfc3339(value: Option<String>) -> Result<Option<OffsetDateTime>> {
    value.as_deref().map(parse_rfc3339).transpose()
}

fn write_audit_file<T: Serialize>(
    out_dir: &Path,
    name: &str,
    records: &[T],
) -> Result<ExportFileDigest> {
    let path = out_dir.join(name);
    let file = File::create(&path)
        .with_context(|| format!("failed to create audit file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for record in records {
        let mut line = serde_json::to_vec(record)
            .with_context(|| format!("failed to serialize {name} record"))?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .with_context(|| format!("failed to write audit file {}", path.display()))?;
        hasher.update(&line);
    }
    writer.flush().with_context(|| format!("failed to flush audit file {}", path.display()))?;

    Ok(ExportFileDigest {
        path: name.to_string(),
        sha256: format!("{:x}", hasher.finalize()),
        records: records.len(),
    })
}

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use report_ledger_core::{
    ActorId, ChangeHistoryEvent, ChangeSeq, Content, DataHistoryEntry, EntityKind, EntryIdent,
    HistoryError, HistoryIdent, ReportId, VersionedRow,
};
use report_ledger_store_sqlite::{
    DeleteOutcome, EntryWrite, LedgerOutboxEntry, OutboxReplaySummary, Report, SchemaStatus,
    SqliteStore, VersionUpdateOutcome, VersionUpdateRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateEntryRequest {
    pub kind: EntityKind,
    pub report_id: ReportId,
    pub content: Content,
    pub actor: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateFieldRequest {
    pub kind: EntityKind,
    pub ident: EntryIdent,
    pub field: String,
    pub value: Value,
    pub actor: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteEntryRequest {
    pub kind: EntityKind,
    pub ident: EntryIdent,
    pub actor: String,
    pub comment: Option<String>,
    pub cascade: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevertRequest {
    pub sequence: ChangeSeq,
    pub actor: String,
    pub comment: Option<String>,
}

/// Next data version of a live record. `retire_key: None` appends without retiring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionUpdateApiRequest {
    pub kind: EntityKind,
    pub ident: EntryIdent,
    pub content: Content,
    pub actor: String,
    pub comment: Option<String>,
    pub retire_key: Option<String>,
    pub carried_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataHistoryRevertRequest {
    pub ident: HistoryIdent,
    pub actor: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportHistory {
    pub report_id: ReportId,
    pub events: Vec<ChangeHistoryEvent>,
    pub data_history: Vec<DataHistoryEntry>,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ReportLedgerApi {
    db_path: PathBuf,
}

impl ReportLedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the label is blank or persistence fails.
    pub fn create_report(&self, patient_label: &str) -> Result<Report> {
        self.open_migrated()?.create_report(patient_label)
    }

    /// # Errors
    /// Returns an error when the actor is blank, the content is invalid, or the report is
    /// unknown.
    pub fn create_entry(&self, input: CreateEntryRequest) -> Result<EntryWrite> {
        let actor = ActorId::new(input.actor)?;
        self.open_migrated()?.create_entry(
            input.kind,
            input.report_id,
            input.content,
            &actor,
            input.display_name,
        )
    }

    /// # Errors
    /// Returns an error when the actor is blank or the field write is rejected.
    pub fn update_field(&self, input: UpdateFieldRequest) -> Result<EntryWrite> {
        let actor = ActorId::new(input.actor)?;
        self.open_migrated()?.update_entry_field(
            input.kind,
            input.ident,
            &input.field,
            input.value,
            &actor,
            input.comment,
        )
    }

    /// # Errors
    /// Returns an error when the actor is blank, no live record exists, or deletion fails.
    pub fn delete_entry(&self, input: DeleteEntryRequest) -> Result<DeleteOutcome> {
        let actor = ActorId::new(input.actor)?;
        self.open_migrated()?.delete_entry(
            input.kind,
            input.ident,
            &actor,
            input.comment,
            input.cascade,
        )
    }

    /// # Errors
    /// Returns an error when the record does not exist or the query fails.
    pub fn get_entry(&self, kind: EntityKind, ident: EntryIdent) -> Result<VersionedRow> {
        self.open_migrated()?.get_entry(kind, ident)?.ok_or_else(|| {
            HistoryError::not_found(format!("no live {kind} with ident {ident}")).into()
        })
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_entries(
        &self,
        kind: EntityKind,
        report_id: ReportId,
    ) -> Result<Vec<VersionedRow>> {
        self.open_migrated()?.list_entries(kind, report_id)
    }

    /// Change-history events and data-history entries of one report.
    ///
    /// # Errors
    /// Returns an error when the report does not exist or rows cannot be decoded.
    pub fn report_history(&self, report_id: ReportId) -> Result<ReportHistory> {
        let store = self.open_migrated()?;
        if store.get_report(report_id)?.is_none() {
            return Err(
                HistoryError::not_found(format!("report {report_id} does not exist")).into()
            );
        }
        Ok(ReportHistory {
            report_id,
            events: store.list_report_events(report_id)?,
            data_history: store.data_history_for_report(report_id)?,
            generated_at: OffsetDateTime::now_utc(),
        })
    }

    /// Undo one change-history event and return the event recorded for it.
    ///
    /// # Errors
    /// Returns an error when the actor is blank or the revert fails; nothing is written then.
    pub fn revert(&self, input: RevertRequest) -> Result<ChangeHistoryEvent> {
        let actor = ActorId::new(input.actor)?;
        self.open_migrated()?.try_revert(input.sequence, &actor, input.comment)
    }

    /// # Errors
    /// Returns an error when the outbox cannot be read.
    pub fn pending_outbox(&self) -> Result<Vec<LedgerOutboxEntry>> {
        self.open_migrated()?.pending_outbox()
    }

    /// # Errors
    /// Returns an error when the outbox cannot be read or updated.
    pub fn replay_outbox(&self, max_attempts: Option<u32>) -> Result<OutboxReplaySummary> {
        self.open_migrated()?.replay_outbox(max_attempts)
    }

    /// # Errors
    /// Returns an error when the actor is blank, no live record exists, or versioning fails.
    pub fn version_update(
        &self,
        input: VersionUpdateApiRequest,
    ) -> Result<VersionUpdateOutcome> {
        let actor = ActorId::new(input.actor)?;
        let mut store = self.open_migrated()?;
        let current = store.get_entry(input.kind, input.ident)?.ok_or_else(|| {
            HistoryError::not_found(format!("no live {} with ident {}", input.kind, input.ident))
        })?;

        let mut request = VersionUpdateRequest::new(current, input.content, actor)
            .carrying(input.carried_columns);
        request = match input.retire_key {
            Some(key) => request.retire_by(key),
            None => request.append_only(),
        };
        if let Some(comment) = input.comment {
            request = request.with_comment(comment);
        }
        store.version_update(&request)
    }

    /// # Errors
    /// Returns an error when the actor is blank or the revert fails.
    pub fn data_history_revert(
        &self,
        input: DataHistoryRevertRequest,
    ) -> Result<DataHistoryEntry> {
        let actor = ActorId::new(input.actor)?;
        self.open_migrated()?.data_history_revert(input.ident, &actor, input.comment)
    }

    /// # Errors
    /// Returns an error when the entry does not exist.
    pub fn data_history_detail(
        &self,
        ident: HistoryIdent,
    ) -> Result<BTreeMap<u32, VersionedRow>> {
        self.open_migrated()?.data_history_detail(ident)
    }

    /// # Errors
    /// Returns an error when the actor is blank or nothing could be restored.
    pub fn data_history_restore(
        &self,
        ident: HistoryIdent,
        actor: &str,
    ) -> Result<DataHistoryEntry> {
        let actor = ActorId::new(actor)?;
        self.open_migrated()?.data_history_restore(ident, &actor)
    }
}

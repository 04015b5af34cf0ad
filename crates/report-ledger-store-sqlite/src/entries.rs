use anyhow::{Context, Result};
use report_ledger_core::{
    ActorId, ChangeRecord, Content, EntityKind, EntryIdent, HistoryError, ReportId, RowSnapshot,
    VersionedRow,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::accessor::{DeleteOptions, EntityAccessor, RowFilter};
use crate::cascade::{cascade_alteration_delete, CascadeSummary};
use crate::ledger::record_event;
use crate::{parse_rfc3339, rfc3339, EntityRegistry, SqliteStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
    pub report_id: ReportId,
    pub patient_label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A stored row plus whether its ledger event was written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryWrite {
    pub entry: VersionedRow,
    pub ledger_recorded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteOutcome {
    pub deleted: RowSnapshot,
    pub ledger_recorded: bool,
    pub cascade: Option<CascadeSummary>,
}

pub(crate) fn load_report(conn: &Connection, report_id: ReportId) -> Result<Option<Report>> {
    conn.query_row(
        "SELECT report_id, patient_label, created_at FROM reports WHERE report_id = ?1",
        params![report_id.to_string()],
        |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
    )
    .optional()
    .with_context(|| format!("failed to load report {report_id}"))?
    .map(|(patient_label, created_at)| {
        Ok(Report { report_id, patient_label, created_at: parse_rfc3339(&created_at)? })
    })
    .transpose()
}

pub(crate) fn live_entry(
    conn: &Connection,
    accessor: &dyn EntityAccessor,
    ident: EntryIdent,
) -> Result<VersionedRow> {
    accessor.query(conn, &RowFilter::ident(ident), false)?.pop().ok_or_else(|| {
        HistoryError::not_found(format!("no live {} with ident {ident}", accessor.kind())).into()
    })
}

/// Physically remove one live row and record a `delete` event carrying its snapshot.
///
/// Returns whether the ledger event was written.
pub(crate) fn delete_with_event(
    conn: &Connection,
    registry: &EntityRegistry,
    row: &VersionedRow,
    actor: &ActorId,
    comment: Option<String>,
) -> Result<bool> {
    let accessor = registry.accessor(row.kind)?;
    let filter = RowFilter::ident(row.ident).with_versions([row.data_version]);
    let removed = accessor.delete(conn, &filter, DeleteOptions::hard())?;
    if removed != 1 {
        return Err(HistoryError::integrity(format!(
            "expected to delete exactly one {} row for {}, removed {removed}",
            row.kind, row.ident
        ))
        .into());
    }

    Ok(record_event(
        conn,
        registry,
        &ChangeRecord::delete(
            row.snapshot(),
            row.kind,
            actor.clone(),
            row.label().map(str::to_string),
            comment,
        ),
    ))
}

impl SqliteStore {
    /// # Errors
    /// Returns an error when the label is blank or the insert fails.
    pub fn create_report(&mut self, patient_label: &str) -> Result<Report> {
        let patient_label = patient_label.trim();
        if patient_label.is_empty() {
            return Err(HistoryError::validation("patient label MUST be provided").into());
        }

        let report = Report {
            report_id: ReportId::new(),
            patient_label: patient_label.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.conn
            .execute(
                "INSERT INTO reports(report_id, patient_label, created_at) VALUES (?1, ?2, ?3)",
                params![
                    report.report_id.to_string(),
                    report.patient_label,
                    rfc3339(report.created_at)?
                ],
            )
            .context("failed to insert report")?;
        Ok(report)
    }

    /// # Errors
    /// Returns an error when the report cannot be read.
    pub fn get_report(&self, report_id: ReportId) -> Result<Option<Report>> {
        load_report(&self.conn, report_id)
    }

    /// Insert the first version of a record and record a `create` event.
    ///
    /// # Errors
    /// Returns an error when the content is invalid for `kind`, the report is unknown, or the
    /// insert fails. Ledger failures are reported through [`EntryWrite::ledger_recorded`].
    pub fn create_entry(
        &mut self,
        kind: EntityKind,
        report_id: ReportId,
        content: Content,
        actor: &ActorId,
        display_name: Option<String>,
    ) -> Result<EntryWrite> {
        kind.validate_content(&content)?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        if load_report(&tx, report_id)?.is_none() {
            return Err(
                HistoryError::not_found(format!("report {report_id} does not exist")).into()
            );
        }

        let accessor = self.registry.accessor(kind)?;
        let entry = accessor.insert(&tx, &RowSnapshot::first_version(report_id, content))?;
        let display_name = display_name.or_else(|| entry.label().map(str::to_string));
        let ledger_recorded = record_event(
            &tx,
            &self.registry,
            &ChangeRecord::create(entry.ident, kind, actor.clone(), report_id, display_name),
        );

        tx.commit().context("failed to commit entry creation")?;
        Ok(EntryWrite { entry, ledger_recorded })
    }

    /// Write one field of a live record in place and record an `update` event.
    ///
    /// # Errors
    /// Returns an error when no live record exists, the field is reserved, the value is
    /// unchanged, or the resulting content is invalid for `kind`.
    pub fn update_entry_field(
        &mut self,
        kind: EntityKind,
        ident: EntryIdent,
        field: &str,
        value: Value,
        actor: &ActorId,
        comment: Option<String>,
    ) -> Result<EntryWrite> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let accessor = self.registry.accessor(kind)?;
        let current = live_entry(&tx, accessor, ident)?;
        let previous = current.column(field).unwrap_or(Value::Null);
        if previous == value {
            return Err(HistoryError::validation(format!(
                "`{field}` on {ident} already holds the requested value"
            ))
            .into());
        }

        let mut next_content = current.content.clone();
        next_content.insert(field.to_string(), value.clone());
        kind.validate_content(&next_content)?;

        let entry = accessor
            .update_field(&tx, ident, field, &value)?
            .ok_or_else(|| HistoryError::not_found(format!("no live {kind} with ident {ident}")))?;
        let ledger_recorded = record_event(
            &tx,
            &self.registry,
            &ChangeRecord::update(
                ident,
                kind,
                field,
                previous,
                value,
                actor.clone(),
                current.report_id,
                current.label().map(str::to_string),
                comment,
            ),
        );

        tx.commit().context("failed to commit entry update")?;
        Ok(EntryWrite { entry, ledger_recorded })
    }

    /// Physically delete a live record, record a `delete` event with its snapshot, and for
    /// genomic alterations identified optionally cascade to dependent records.
    ///
    /// # Errors
    /// Returns an error when no live record exists or any row deletion fails. The primary
    /// and cascaded deletions commit or roll back together.
    pub fn delete_entry(
        &mut self,
        kind: EntityKind,
        ident: EntryIdent,
        actor: &ActorId,
        comment: Option<String>,
        cascade: bool,
    ) -> Result<DeleteOutcome> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let accessor = self.registry.accessor(kind)?;
        let current = live_entry(&tx, accessor, ident)?;
        let ledger_recorded =
            delete_with_event(&tx, &self.registry, &current, actor, comment.clone())?;

        let cascade = if cascade && kind == EntityKind::GenomicAlterationIdentified {
            Some(cascade_alteration_delete(&tx, &self.registry, &current, actor, comment)?)
        } else {
            None
        };

        tx.commit().context("failed to commit entry deletion")?;
        tracing::info!(
            kind = %kind,
            ident = %ident,
            cascaded = cascade.is_some(),
            "deleted report entry"
        );
        Ok(DeleteOutcome { deleted: current.snapshot(), ledger_recorded, cascade })
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_entry(&self, kind: EntityKind, ident: EntryIdent) -> Result<Option<VersionedRow>> {
        let accessor = self.registry.accessor(kind)?;
        Ok(accessor.query(&self.conn, &RowFilter::ident(ident), false)?.pop())
    }

    /// Live records of one kind in a report.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_entries(&self, kind: EntityKind, report_id: ReportId) -> Result<Vec<VersionedRow>> {
        let accessor = self.registry.accessor(kind)?;
        accessor.query(&self.conn, &RowFilter::report(report_id), false)
    }

    /// Every stored data version of one record, soft-deleted versions included.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn entry_versions(&self, kind: EntityKind, ident: EntryIdent) -> Result<Vec<VersionedRow>> {
        let accessor = self.registry.accessor(kind)?;
        accessor.query(&self.conn, &RowFilter::ident(ident), true)
    }
}

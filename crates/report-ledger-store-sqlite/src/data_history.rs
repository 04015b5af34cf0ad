use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use report_ledger_core::{
    ActorId, DataHistoryEntry, EntityKind, HistoryError, HistoryIdent, ReportId, VersionedRow,
    CHANGE_HISTORY_TYPE,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;

use crate::accessor::{DeleteOptions, RowFilter};
use crate::{
    now_rfc3339, parse_optional_rfc3339, parse_rfc3339, rfc3339, EntityRegistry, SqliteStore,
};

const ENTRY_COLUMNS: &str = "ident, history_type, table_name, entity_kind, target_ident,
    previous_version, new_version, owner_report_id, actor_id, comment, created_at, deleted_at";

pub(crate) fn insert_entry(conn: &Connection, entry: &DataHistoryEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO data_history(
            ident, history_type, table_name, entity_kind, target_ident,
            previous_version, new_version, owner_report_id, actor_id, comment, created_at,
            deleted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            entry.ident.to_string(),
            entry.history_type,
            entry.table_name,
            entry.entity_kind.as_str(),
            entry.target_ident.to_string(),
            i64::from(entry.previous_version),
            i64::from(entry.new_version),
            entry.owner_report_id.to_string(),
            entry.actor_id.as_str(),
            entry.comment,
            rfc3339(entry.created_at)?,
            entry.deleted_at.map(rfc3339).transpose()?,
        ],
    )
    .with_context(|| format!("failed to insert data history entry {}", entry.ident))?;
    Ok(())
}

fn load_entry(
    conn: &Connection,
    ident: HistoryIdent,
    include_deleted: bool,
) -> Result<DataHistoryEntry> {
    let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM data_history WHERE ident = ?1");
    if !include_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }

    conn.query_row(&sql, params![ident.to_string()], |row| Ok(decode_entry(row)))
        .optional()
        .with_context(|| format!("failed to load data history entry {ident}"))?
        .transpose()?
        .ok_or_else(|| {
            HistoryError::not_found(format!("data history entry {ident} does not exist")).into()
        })
}

/// The previous and new version rows of an entry, soft-deleted rows included.
fn version_pair(
    conn: &Connection,
    registry: &EntityRegistry,
    entry: &DataHistoryEntry,
) -> Result<Vec<VersionedRow>> {
    let accessor = registry.accessor(entry.entity_kind)?;
    let filter = RowFilter::ident(entry.target_ident)
        .with_versions([entry.previous_version, entry.new_version]);
    accessor.query(conn, &filter, true)
}

pub(crate) fn revert(
    conn: &Connection,
    registry: &EntityRegistry,
    ident: HistoryIdent,
    actor: &ActorId,
    comment: Option<String>,
) -> Result<DataHistoryEntry> {
    let entry = load_entry(conn, ident, true)?;
    let rows = version_pair(conn, registry, &entry)?;
    if rows.len() != 2 {
        return Err(HistoryError::integrity(format!(
            "expected versions {} and {} of {} to exist, found {} rows",
            entry.previous_version,
            entry.new_version,
            entry.target_ident,
            rows.len()
        ))
        .into());
    }

    let accessor = registry.accessor(entry.entity_kind)?;
    let current_max = accessor.max_version(conn, entry.target_ident)?.ok_or_else(|| {
        HistoryError::integrity(format!("no stored versions of {}", entry.target_ident))
    })?;

    let superseded = accessor
        .query(conn, &RowFilter::ident(entry.target_ident), true)?
        .into_iter()
        .map(|row| row.data_version)
        .filter(|version| *version != entry.previous_version)
        .collect::<Vec<_>>();
    if !superseded.is_empty() {
        let filter = RowFilter::ident(entry.target_ident).with_versions(superseded);
        accessor.delete(conn, &filter, DeleteOptions::hard())?;
    }

    let previous = RowFilter::ident(entry.target_ident).with_versions([entry.previous_version]);
    accessor.restore(conn, &previous, Some(1))?;

    let reverted = DataHistoryEntry {
        ident: HistoryIdent::new(),
        history_type: CHANGE_HISTORY_TYPE.to_string(),
        table_name: entry.table_name.clone(),
        entity_kind: entry.entity_kind,
        target_ident: entry.target_ident,
        previous_version: current_max,
        new_version: entry.previous_version,
        owner_report_id: entry.owner_report_id,
        actor_id: actor.clone(),
        comment,
        created_at: OffsetDateTime::now_utc(),
        deleted_at: None,
    };
    insert_entry(conn, &reverted)?;
    Ok(reverted)
}

pub(crate) fn detail(
    conn: &Connection,
    registry: &EntityRegistry,
    ident: HistoryIdent,
) -> Result<BTreeMap<u32, VersionedRow>> {
    let entry = load_entry(conn, ident, true)?;
    Ok(version_pair(conn, registry, &entry)?
        .into_iter()
        .map(|row| (row.data_version, row))
        .collect())
}

pub(crate) fn restore(
    conn: &Connection,
    registry: &EntityRegistry,
    ident: HistoryIdent,
) -> Result<DataHistoryEntry> {
    let mut entry = load_entry(conn, ident, false)?;
    let accessor = registry.accessor(entry.entity_kind)?;
    let previous = RowFilter::ident(entry.target_ident).with_versions([entry.previous_version]);
    if accessor.restore(conn, &previous, Some(1))? == 0 {
        return Err(HistoryError::integrity(format!(
            "version {} of {} is not soft-deleted; nothing to restore",
            entry.previous_version, entry.target_ident
        ))
        .into());
    }

    let deleted_at = now_rfc3339()?;
    conn.execute(
        "UPDATE data_history SET deleted_at = ?1 WHERE ident = ?2",
        params![deleted_at, ident.to_string()],
    )
    .with_context(|| format!("failed to retire data history entry {ident}"))?;
    entry.deleted_at = Some(parse_rfc3339(&deleted_at)?);
    Ok(entry)
}

pub(crate) fn list_for_report(
    conn: &Connection,
    report_id: ReportId,
) -> Result<Vec<DataHistoryEntry>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM data_history
             WHERE owner_report_id = ?1
             ORDER BY created_at DESC, rowid DESC"
        ))
        .context("failed to prepare data history query")?;
    let mut rows = stmt.query(params![report_id.to_string()])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(decode_entry(row)?);
    }
    Ok(entries)
}

pub(crate) fn list_all(conn: &Connection) -> Result<Vec<DataHistoryEntry>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {ENTRY_COLUMNS} FROM data_history ORDER BY rowid ASC"))
        .context("failed to prepare data history export query")?;
    let mut rows = stmt.query([])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(decode_entry(row)?);
    }
    Ok(entries)
}

fn decode_entry(row: &Row<'_>) -> Result<DataHistoryEntry> {
    let ident_raw: String = row.get(0)?;
    let kind_raw: String = row.get(3)?;
    let target_raw: String = row.get(4)?;
    let owner_raw: String = row.get(7)?;
    let actor_raw: String = row.get(8)?;

    Ok(DataHistoryEntry {
        ident: ident_raw.parse()?,
        history_type: row.get(1)?,
        table_name: row.get(2)?,
        entity_kind: EntityKind::parse(&kind_raw)
            .ok_or_else(|| anyhow!("unknown entity_kind: {kind_raw}"))?,
        target_ident: target_raw.parse()?,
        previous_version: row.get(5)?,
        new_version: row.get(6)?,
        owner_report_id: owner_raw.parse()?,
        actor_id: ActorId::new(actor_raw)?,
        comment: row.get(9)?,
        created_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
        deleted_at: parse_optional_rfc3339(row.get(11)?)?,
    })
}

impl SqliteStore {
    /// Roll a record back to the previous version named by a data-history entry.
    ///
    /// Every other stored version of the record is physically removed, so a second revert
    /// of the same entry fails with an integrity error.
    ///
    /// # Errors
    /// Returns an error when the entry does not exist, the version pair is incomplete, or any
    /// write fails. Nothing is written on error.
    pub fn data_history_revert(
        &mut self,
        ident: HistoryIdent,
        actor: &ActorId,
        comment: Option<String>,
    ) -> Result<DataHistoryEntry> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let reverted = revert(&tx, &self.registry, ident, actor, comment)?;
        tx.commit().context("failed to commit data history revert")?;
        tracing::info!(
            history = %ident,
            target = %reverted.target_ident,
            restored_version = reverted.new_version,
            actor = %actor,
            "reverted data history entry"
        );
        Ok(reverted)
    }

    /// # Errors
    /// Returns an error when the entry does not exist or rows cannot be read.
    pub fn data_history_detail(&self, ident: HistoryIdent) -> Result<BTreeMap<u32, VersionedRow>> {
        detail(&self.conn, &self.registry, ident)
    }

    /// Un-delete the previous version named by an entry and retire the entry.
    ///
    /// # Errors
    /// Returns an error when the entry does not exist or no row was restored.
    pub fn data_history_restore(
        &mut self,
        ident: HistoryIdent,
        actor: &ActorId,
    ) -> Result<DataHistoryEntry> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let entry = restore(&tx, &self.registry, ident)?;
        tx.commit().context("failed to commit data history restore")?;
        tracing::info!(
            history = %ident,
            target = %entry.target_ident,
            restored_version = entry.previous_version,
            actor = %actor,
            "restored previous data version"
        );
        Ok(entry)
    }

    /// Data-history entries owned by a report, newest first.
    ///
    /// # Errors
    /// Returns an error when entries cannot be read or decoded.
    pub fn data_history_for_report(&self, report_id: ReportId) -> Result<Vec<DataHistoryEntry>> {
        list_for_report(&self.conn, report_id)
    }
}

use anyhow::{anyhow, Context, Result};
use report_ledger_core::{
    ActorId, ChangeHistoryEvent, ChangeRecord, ChangeSeq, EntityKind, EntryIdent, EventType,
    ReportId, RowSnapshot,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{now_rfc3339, parse_optional_rfc3339, parse_rfc3339, EntityRegistry, SqliteStore};

const EVENT_COLUMNS: &str = "ch.sequence, ch.event_type, ch.entry_ident, ch.entity_kind,
    ch.table_name, ch.field_name, ch.previous_value_json, ch.new_value_json,
    ch.deleted_snapshot_json, ch.actor_id, rch.report_id, ch.display_name, ch.comment,
    ch.created_at";

const EVENT_JOIN: &str = "FROM change_history ch
    JOIN report_change_history rch ON rch.change_history_sequence = ch.sequence";

/// A ledger event parked after its write failed, waiting for replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerOutboxEntry {
    pub outbox_id: i64,
    pub report_id: ReportId,
    pub pending: ChangeRecord,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxReplaySummary {
    pub delivered: Vec<ChangeSeq>,
    pub failed: usize,
    /// Pending entries skipped because they reached the attempt limit.
    pub exhausted: usize,
}

/// Insert one event and its report link. Fails on any problem.
pub(crate) fn append_event(
    conn: &Connection,
    registry: &EntityRegistry,
    record: &ChangeRecord,
) -> Result<ChangeHistoryEvent> {
    record.validate()?;
    let table_name = registry.accessor(record.entity_kind)?.kind().table_name();

    conn.execute(
        "INSERT INTO change_history(
            event_type, entry_ident, entity_kind, table_name, field_name,
            previous_value_json, new_value_json, deleted_snapshot_json,
            actor_id, display_name, comment, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            record.event_type.as_str(),
            record.entry_ident.to_string(),
            record.entity_kind.as_str(),
            table_name,
            record.field_name,
            record.previous_value.as_ref().map(Value::to_string),
            record.new_value.as_ref().map(Value::to_string),
            record
                .deleted_snapshot
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize deleted snapshot")?,
            record.actor_id.as_str(),
            record.display_name,
            record.comment,
            now_rfc3339()?,
        ],
    )
    .context("failed to insert change history event")?;
    let sequence = ChangeSeq(conn.last_insert_rowid());

    conn.execute(
        "INSERT INTO report_change_history(change_history_sequence, report_id) VALUES (?1, ?2)",
        params![sequence.0, record.report_id.to_string()],
    )
    .with_context(|| format!("failed to link change history event {sequence} to its report"))?;

    get_event(conn, sequence)?
        .ok_or_else(|| anyhow!("change history event {sequence} vanished after insert"))
}

/// Write an event inside a savepoint so the event row and its report link land together.
fn append_in_savepoint(
    conn: &Connection,
    registry: &EntityRegistry,
    record: &ChangeRecord,
) -> Result<ChangeHistoryEvent> {
    conn.execute_batch("SAVEPOINT ledger_event").context("failed to open ledger savepoint")?;
    match append_event(conn, registry, record) {
        Ok(event) => {
            conn.execute_batch("RELEASE ledger_event")
                .context("failed to release ledger savepoint")?;
            Ok(event)
        }
        Err(err) => {
            conn.execute_batch("ROLLBACK TO ledger_event; RELEASE ledger_event")
                .context("failed to roll back ledger savepoint")?;
            Err(err)
        }
    }
}

/// Record an event without failing the caller's mutation.
///
/// Invalid events are logged and dropped. Valid events whose write fails are parked in
/// the outbox for replay.
pub(crate) fn record_event(
    conn: &Connection,
    registry: &EntityRegistry,
    record: &ChangeRecord,
) -> bool {
    if let Err(err) = record.validate() {
        tracing::warn!(
            error = %err,
            event_type = %record.event_type,
            entry_ident = %record.entry_ident,
            "rejected change history event"
        );
        return false;
    }

    match append_in_savepoint(conn, registry, record) {
        Ok(event) => {
            tracing::debug!(
                sequence = %event.sequence,
                event_type = %event.event_type,
                entry_ident = %event.entry_ident,
                "recorded change history event"
            );
            true
        }
        Err(err) => {
            tracing::warn!(
                error = %format!("{err:#}"),
                event_type = %record.event_type,
                entry_ident = %record.entry_ident,
                report_id = %record.report_id,
                "failed to record change history event; parking it in the outbox"
            );
            if let Err(park_err) = park(conn, record, &err) {
                tracing::error!(
                    error = %format!("{park_err:#}"),
                    entry_ident = %record.entry_ident,
                    "failed to park change history event in the outbox"
                );
            }
            false
        }
    }
}

fn park(conn: &Connection, record: &ChangeRecord, cause: &anyhow::Error) -> Result<i64> {
    let pending_json =
        serde_json::to_string(record).context("failed to serialize pending change record")?;
    conn.execute(
        "INSERT INTO ledger_outbox(report_id, pending_event_json, attempts, last_error, created_at)
         VALUES (?1, ?2, 1, ?3, ?4)",
        params![record.report_id.to_string(), pending_json, format!("{cause:#}"), now_rfc3339()?],
    )
    .context("failed to insert ledger outbox entry")?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn get_event(
    conn: &Connection,
    sequence: ChangeSeq,
) -> Result<Option<ChangeHistoryEvent>> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} {EVENT_JOIN} WHERE ch.sequence = ?1"),
        params![sequence.0],
        |row| Ok(decode_event(row)),
    )
    .optional()
    .with_context(|| format!("failed to load change history event {sequence}"))?
    .transpose()
}

pub(crate) fn list_report_events(
    conn: &Connection,
    report_id: ReportId,
) -> Result<Vec<ChangeHistoryEvent>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EVENT_COLUMNS} {EVENT_JOIN} WHERE rch.report_id = ?1 ORDER BY ch.sequence ASC"
        ))
        .context("failed to prepare report change history query")?;
    let mut rows = stmt.query(params![report_id.to_string()])?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        events.push(decode_event(row)?);
    }
    Ok(events)
}

pub(crate) fn list_all_events(conn: &Connection) -> Result<Vec<ChangeHistoryEvent>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {EVENT_COLUMNS} {EVENT_JOIN} ORDER BY ch.sequence ASC"))
        .context("failed to prepare change history export query")?;
    let mut rows = stmt.query([])?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        events.push(decode_event(row)?);
    }
    Ok(events)
}

pub(crate) fn count_unlinked_events(conn: &Connection) -> Result<usize> {
    let count = conn
        .query_row(
            "SELECT COUNT(*)
             FROM change_history ch
             LEFT JOIN report_change_history rch ON rch.change_history_sequence = ch.sequence
             WHERE rch.change_history_sequence IS NULL",
            [],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to count change history events without a report link")?;
    Ok(usize::try_from(count).unwrap_or_default())
}

/// Sequence of the newest `delete` event linked to `report_id`.
pub(crate) fn latest_report_delete(
    conn: &Connection,
    report_id: ReportId,
) -> Result<Option<ChangeSeq>> {
    let latest = conn
        .query_row(
            &format!(
                "SELECT MAX(ch.sequence) {EVENT_JOIN}
                 WHERE rch.report_id = ?1 AND ch.event_type = 'delete'"
            ),
            params![report_id.to_string()],
            |row| row.get::<_, Option<i64>>(0),
        )
        .with_context(|| format!("failed to find latest delete event for report {report_id}"))?;
    Ok(latest.map(ChangeSeq))
}

pub(crate) fn pending_outbox(conn: &Connection) -> Result<Vec<LedgerOutboxEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT outbox_id, report_id, pending_event_json, attempts, last_error, created_at,
                    delivered_at
             FROM ledger_outbox
             WHERE delivered_at IS NULL
             ORDER BY outbox_id ASC",
        )
        .context("failed to prepare ledger outbox query")?;
    let mut rows = stmt.query([])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let report_raw: String = row.get(1)?;
        let pending_json: String = row.get(2)?;
        entries.push(LedgerOutboxEntry {
            outbox_id: row.get(0)?,
            report_id: report_raw.parse()?,
            pending: serde_json::from_str(&pending_json)
                .context("failed to decode pending change record")?,
            attempts: row.get(3)?,
            last_error: row.get(4)?,
            created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
            delivered_at: parse_optional_rfc3339(row.get(6)?)?,
        });
    }
    Ok(entries)
}

pub(crate) fn replay_outbox(
    conn: &Connection,
    registry: &EntityRegistry,
    max_attempts: u32,
) -> Result<OutboxReplaySummary> {
    let mut summary = OutboxReplaySummary::default();

    for entry in pending_outbox(conn)? {
        if entry.attempts >= max_attempts {
            summary.exhausted += 1;
            continue;
        }

        match append_in_savepoint(conn, registry, &entry.pending) {
            Ok(event) => {
                conn.execute(
                    "UPDATE ledger_outbox SET delivered_at = ?1 WHERE outbox_id = ?2",
                    params![now_rfc3339()?, entry.outbox_id],
                )
                .with_context(|| {
                    format!("failed to mark outbox entry {} delivered", entry.outbox_id)
                })?;
                tracing::info!(
                    outbox_id = entry.outbox_id,
                    sequence = %event.sequence,
                    "delivered parked change history event"
                );
                summary.delivered.push(event.sequence);
            }
            Err(err) => {
                conn.execute(
                    "UPDATE ledger_outbox SET attempts = attempts + 1, last_error = ?1
                     WHERE outbox_id = ?2",
                    params![format!("{err:#}"), entry.outbox_id],
                )
                .with_context(|| format!("failed to update outbox entry {}", entry.outbox_id))?;
                tracing::warn!(
                    outbox_id = entry.outbox_id,
                    attempts = entry.attempts + 1,
                    error = %format!("{err:#}"),
                    "parked change history event is still undeliverable"
                );
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

fn decode_event(row: &Row<'_>) -> Result<ChangeHistoryEvent> {
    let event_type_raw: String = row.get(1)?;
    let entry_raw: String = row.get(2)?;
    let kind_raw: String = row.get(3)?;
    let previous_json: Option<String> = row.get(6)?;
    let new_json: Option<String> = row.get(7)?;
    let snapshot_json: Option<String> = row.get(8)?;
    let actor_raw: String = row.get(9)?;
    let report_raw: String = row.get(10)?;

    Ok(ChangeHistoryEvent {
        sequence: ChangeSeq(row.get(0)?),
        event_type: EventType::parse(&event_type_raw)
            .ok_or_else(|| anyhow!("unknown event_type: {event_type_raw}"))?,
        entry_ident: entry_raw.parse()?,
        entity_kind: EntityKind::parse(&kind_raw)
            .ok_or_else(|| anyhow!("unknown entity_kind: {kind_raw}"))?,
        table_name: row.get(4)?,
        field_name: row.get(5)?,
        previous_value: decode_json(previous_json.as_deref())?,
        new_value: decode_json(new_json.as_deref())?,
        deleted_snapshot: snapshot_json
            .as_deref()
            .map(serde_json::from_str::<RowSnapshot>)
            .transpose()
            .context("failed to decode deleted snapshot")?,
        actor_id: ActorId::new(actor_raw)?,
        report_id: report_raw.parse()?,
        display_name: row.get(11)?,
        comment: row.get(12)?,
        created_at: parse_rfc3339(&row.get::<_, String>(13)?)?,
    })
}

fn decode_json(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(serde_json::from_str::<Value>).transpose().context("failed to decode stored JSON value")
}

impl SqliteStore {
    /// Record a change event in its own transaction.
    ///
    /// Returns `false` when the event was rejected or parked in the outbox.
    #[must_use]
    pub fn record(&mut self, record: &ChangeRecord) -> bool {
        let tx = match self.conn.transaction() {
            Ok(tx) => tx,
            Err(err) => {
                tracing::warn!(error = %err, "failed to start ledger transaction");
                return false;
            }
        };
        let recorded = record_event(&tx, &self.registry, record);
        if let Err(err) = tx.commit() {
            tracing::warn!(error = %err, "failed to commit ledger transaction");
            return false;
        }
        recorded
    }

    #[must_use]
    pub fn record_create(
        &mut self,
        entry_ident: EntryIdent,
        kind: EntityKind,
        actor_id: &ActorId,
        report_id: ReportId,
        display_name: Option<String>,
    ) -> bool {
        self.record(&ChangeRecord::create(
            entry_ident,
            kind,
            actor_id.clone(),
            report_id,
            display_name,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn record_update(
        &mut self,
        entry_ident: EntryIdent,
        kind: EntityKind,
        field_name: &str,
        previous_value: Value,
        new_value: Value,
        actor_id: &ActorId,
        report_id: ReportId,
        display_name: Option<String>,
        comment: Option<String>,
    ) -> bool {
        self.record(&ChangeRecord::update(
            entry_ident,
            kind,
            field_name,
            previous_value,
            new_value,
            actor_id.clone(),
            report_id,
            display_name,
            comment,
        ))
    }

    #[must_use]
    pub fn record_delete(
        &mut self,
        deleted: RowSnapshot,
        kind: EntityKind,
        actor_id: &ActorId,
        display_name: Option<String>,
        comment: Option<String>,
    ) -> bool {
        self.record(&ChangeRecord::delete(deleted, kind, actor_id.clone(), display_name, comment))
    }

    /// Ledger events of one report in ledger order.
    ///
    /// # Errors
    /// Returns an error when events cannot be read or decoded.
    pub fn list_report_events(&self, report_id: ReportId) -> Result<Vec<ChangeHistoryEvent>> {
        list_report_events(&self.conn, report_id)
    }

    /// # Errors
    /// Returns an error when the event cannot be read or decoded.
    pub fn get_event(&self, sequence: ChangeSeq) -> Result<Option<ChangeHistoryEvent>> {
        get_event(&self.conn, sequence)
    }

    /// # Errors
    /// Returns an error when outbox entries cannot be read or decoded.
    pub fn pending_outbox(&self) -> Result<Vec<LedgerOutboxEntry>> {
        pending_outbox(&self.conn)
    }

    /// Retry parked ledger events, oldest first.
    ///
    /// `max_attempts` defaults to [`crate::StoreConfig::outbox_max_attempts`].
    ///
    /// # Errors
    /// Returns an error when the outbox itself cannot be read or updated.
    pub fn replay_outbox(&mut self, max_attempts: Option<u32>) -> Result<OutboxReplaySummary> {
        let max_attempts = max_attempts.unwrap_or(self.config.outbox_max_attempts);
        let tx = self.conn.transaction().context("failed to start outbox replay transaction")?;
        let summary = replay_outbox(&tx, &self.registry, max_attempts)?;
        tx.commit().context("failed to commit outbox replay transaction")?;
        Ok(summary)
    }
}

use anyhow::{Context, Result};
use report_ledger_core::{
    ActorId, ChangeHistoryEvent, ChangeRecord, ChangeSeq, DeleteRevertCheck, EventType,
    HistoryError,
};
use rusqlite::Connection;

use crate::accessor::RowFilter;
use crate::ledger::{append_event, get_event, latest_report_delete};
use crate::{EntityRegistry, SqliteStore};

/// Apply the compensating write for one ledger event and append its own event.
///
/// Problems found after the write starts are collected and raised together as one
/// integrity error; the caller's transaction must then be rolled back.
pub(crate) fn revert_event(
    conn: &Connection,
    registry: &EntityRegistry,
    sequence: ChangeSeq,
    actor: &ActorId,
    comment: Option<String>,
) -> Result<ChangeHistoryEvent> {
    let event = get_event(conn, sequence)?.ok_or_else(|| {
        HistoryError::not_found(format!("no change history event with sequence {sequence}"))
    })?;

    match event.event_type {
        EventType::Update => revert_update(conn, registry, &event, actor, comment),
        EventType::Delete => revert_delete(conn, registry, &event, actor),
        EventType::Create => Err(HistoryError::integrity(format!(
            "change history events of type {} cannot be reverted",
            event.event_type
        ))
        .into()),
    }
}

fn revert_update(
    conn: &Connection,
    registry: &EntityRegistry,
    event: &ChangeHistoryEvent,
    actor: &ActorId,
    comment: Option<String>,
) -> Result<ChangeHistoryEvent> {
    let compensating = event.swapped_update(actor.clone(), comment)?;
    let (Some(field), Some(previous)) = (&event.field_name, &event.previous_value) else {
        return Err(HistoryError::integrity(format!(
            "event {} has no field to restore",
            event.sequence
        ))
        .into());
    };

    let accessor = registry.accessor(event.entity_kind)?;
    let mut problems = Vec::new();

    match accessor.update_field(conn, event.entry_ident, field, previous)? {
        Some(row) if row.column(field).as_ref() == Some(previous) => {}
        Some(_) => {
            problems.push(format!("field {field} did not have its value updated properly"));
        }
        None => {
            problems.push(format!("no live record with ident {} to update", event.entry_ident));
        }
    }

    let recorded = append_event(conn, registry, &compensating);
    if let Err(err) = &recorded {
        problems.push(format!(
            "failed to record change history event for updating field {field}: {err:#}"
        ));
    }

    if problems.is_empty() {
        recorded
    } else {
        Err(HistoryError::integrity(problems.join(", ")).into())
    }
}

fn revert_delete(
    conn: &Connection,
    registry: &EntityRegistry,
    event: &ChangeHistoryEvent,
    actor: &ActorId,
) -> Result<ChangeHistoryEvent> {
    let snapshot = event.deleted_snapshot.as_ref().ok_or_else(|| {
        HistoryError::integrity(format!(
            "delete event {} carries no deleted content",
            event.sequence
        ))
    })?;
    let accessor = registry.accessor(event.entity_kind)?;

    let live_rows = accessor.query(conn, &RowFilter::ident(snapshot.ident), false)?;
    let check = DeleteRevertCheck {
        candidate: event.sequence,
        live_row_exists: !live_rows.is_empty(),
        latest_report_delete: latest_report_delete(conn, event.report_id)?,
    };
    check.evaluate(snapshot.ident)?;

    let recreated = accessor.insert(conn, snapshot)?;
    let mut problems = Vec::new();
    if recreated.ident != snapshot.ident {
        problems.push(format!(
            "record with ident {} in table {} was not recreated properly",
            recreated.ident, event.table_name
        ));
    }

    let recorded = append_event(
        conn,
        registry,
        &ChangeRecord::create(
            recreated.ident,
            event.entity_kind,
            actor.clone(),
            event.report_id,
            event.display_name.clone(),
        ),
    );
    if let Err(err) = &recorded {
        problems.push(format!(
            "failed to record change history event for creating record with ident {} \
             in table {}: {err:#}",
            recreated.ident, event.table_name
        ));
    }

    if problems.is_empty() {
        recorded
    } else {
        Err(HistoryError::integrity(problems.join(", ")).into())
    }
}

impl SqliteStore {
    /// Undo one ledger event. Failures are logged and reported as `false`; nothing is
    /// written unless the whole revert succeeds.
    #[must_use]
    pub fn revert(
        &mut self,
        sequence: ChangeSeq,
        actor: &ActorId,
        comment: Option<String>,
    ) -> bool {
        match self.try_revert(sequence, actor, comment) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(
                    sequence = %sequence,
                    actor = %actor,
                    error = %format!("{err:#}"),
                    "failed to revert change history event"
                );
                false
            }
        }
    }

    /// Undo one ledger event and return the event recorded for the revert.
    ///
    /// # Errors
    /// Returns an error when the event does not exist, its type cannot be reverted, a
    /// precondition fails, or any write fails. The transaction is rolled back on error.
    pub fn try_revert(
        &mut self,
        sequence: ChangeSeq,
        actor: &ActorId,
        comment: Option<String>,
    ) -> Result<ChangeHistoryEvent> {
        let tx = self.conn.transaction().context("failed to start revert transaction")?;
        let recorded = revert_event(&tx, &self.registry, sequence, actor, comment)?;
        tx.commit().context("failed to commit revert transaction")?;

        tracing::info!(
            reverted = %sequence,
            recorded = %recorded.sequence,
            event_type = %recorded.event_type,
            entry_ident = %recorded.entry_ident,
            "reverted change history event"
        );
        Ok(recorded)
    }
}

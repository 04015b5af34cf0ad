use anyhow::{Context, Result};
use report_ledger_core::{
    ActorId, Content, DataHistoryEntry, HistoryError, HistoryIdent, RowSnapshot, VersionedRow,
    CHANGE_HISTORY_TYPE,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::accessor::{DeleteOptions, RowFilter};
use crate::{data_history, EntityRegistry, SqliteStore};

/// Input for creating the next data version of a record.
///
/// By default the new row carries the current row's `ident` and retires the current row by
/// `ident`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionUpdateRequest {
    pub current: VersionedRow,
    pub content: Content,
    pub actor_id: ActorId,
    pub comment: Option<String>,
    pub retire_key: Option<String>,
    pub carried_columns: Vec<String>,
}

impl VersionUpdateRequest {
    #[must_use]
    pub fn new(current: VersionedRow, content: Content, actor_id: ActorId) -> Self {
        Self {
            current,
            content,
            actor_id,
            comment: None,
            retire_key: Some("ident".to_string()),
            carried_columns: vec!["ident".to_string()],
        }
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Keep the current row visible and skip the history entry.
    #[must_use]
    pub fn append_only(mut self) -> Self {
        self.retire_key = None;
        self
    }

    #[must_use]
    pub fn retire_by(mut self, key: impl Into<String>) -> Self {
        self.retire_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn carrying<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.carried_columns = columns.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionUpdateOutcome {
    pub created: VersionedRow,
    pub history_entry: Option<DataHistoryEntry>,
    pub retired_count: usize,
}

pub(crate) fn version_update(
    conn: &Connection,
    registry: &EntityRegistry,
    request: &VersionUpdateRequest,
) -> Result<VersionUpdateOutcome> {
    let current = &request.current;
    let kind = current.kind;
    let accessor = registry.accessor(kind)?;

    let mut draft = RowSnapshot::first_version(current.report_id, request.content.clone());
    for column in &request.carried_columns {
        let value = current.column(column).ok_or_else(|| {
            HistoryError::validation(format!(
                "carried column `{column}` is missing on the current entry"
            ))
        })?;
        draft.set_column(column, value)?;
    }
    kind.validate_content(&draft.content)?;

    let max_version = accessor.max_version(conn, current.ident)?.ok_or_else(|| {
        HistoryError::integrity(format!("no stored versions of {kind} {}", current.ident))
    })?;
    if request.retire_key.is_some() {
        let stored = RowFilter::ident(current.ident).with_versions([current.data_version]);
        let live = !accessor.query(conn, &stored, false)?.is_empty();
        if !live || current.data_version != max_version {
            return Err(HistoryError::integrity(format!(
                "stale current entry: {kind} {} version {} is not the live latest version {}",
                current.ident, current.data_version, max_version
            ))
            .into());
        }
    }
    draft.data_version = max_version + 1;
    let created = accessor.insert(conn, &draft)?;

    let Some(retire_key) = &request.retire_key else {
        return Ok(VersionUpdateOutcome { created, history_entry: None, retired_count: 0 });
    };

    let retire_value = current.column(retire_key).ok_or_else(|| {
        HistoryError::validation(format!(
            "retire key `{retire_key}` is missing on the current entry"
        ))
    })?;
    let retire_filter = RowFilter::default()
        .with_versions([current.data_version])
        .with_column(retire_key.clone(), retire_value);
    let retired_count = accessor.delete(conn, &retire_filter, DeleteOptions::soft_one())?;

    let history_entry = DataHistoryEntry {
        ident: HistoryIdent::new(),
        history_type: CHANGE_HISTORY_TYPE.to_string(),
        table_name: kind.table_name().to_string(),
        entity_kind: kind,
        target_ident: current.ident,
        previous_version: current.data_version,
        new_version: created.data_version,
        owner_report_id: current.report_id,
        actor_id: request.actor_id.clone(),
        comment: request.comment.clone(),
        created_at: OffsetDateTime::now_utc(),
        deleted_at: None,
    };
    data_history::insert_entry(conn, &history_entry)?;

    Ok(VersionUpdateOutcome { created, history_entry: Some(history_entry), retired_count })
}

impl SqliteStore {
    /// Create the next data version of a record, retire the current one, and link both
    /// through a data-history entry.
    ///
    /// # Errors
    /// Returns an error when a carried column or retire key is missing, the record has no
    /// stored versions, or any write fails. Nothing is written on error.
    pub fn version_update(
        &mut self,
        request: &VersionUpdateRequest,
    ) -> Result<VersionUpdateOutcome> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let outcome = version_update(&tx, &self.registry, request)?;
        tx.commit().context("failed to commit version update")?;

        tracing::debug!(
            kind = %request.current.kind,
            ident = %request.current.ident,
            previous_version = request.current.data_version,
            new_version = outcome.created.data_version,
            retired = outcome.retired_count,
            "created new data version"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use report_ledger_core::{EntityKind, HistoryErrorKind};
    use serde_json::json;

    use super::*;
    use crate::{classify, test_support};

    fn seeded(store: &mut SqliteStore) -> Result<VersionedRow> {
        let report = store.create_report("POG0300")?;
        Ok(test_support::create(
            store,
            EntityKind::GenomicAlterationIdentified,
            report.report_id,
            json!({"geneVariant": "TP53 (p.R175H)"}),
        )?
        .entry)
    }

    // Test IDs: TVER-001
    #[test]
    fn version_update_leaves_one_visible_row_at_next_version() -> Result<()> {
        let mut store = test_support::migrated_store()?;
        let current = seeded(&mut store)?;

        let outcome = store.version_update(
            &VersionUpdateRequest::new(
                current.clone(),
                test_support::content(json!({"geneVariant": "TP53 (p.R175H) [confirmed]"}))?,
                test_support::actor("curator")?,
            )
            .with_comment("confirmed"),
        )?;

        assert_eq!(outcome.created.ident, current.ident);
        assert_eq!(outcome.created.data_version, current.data_version + 1);
        assert_eq!(outcome.retired_count, 1);
        let history = outcome.history_entry.ok_or_else(|| anyhow!("history entry expected"))?;
        assert_eq!((history.previous_version, history.new_version), (1, 2));
        assert_eq!(history.comment.as_deref(), Some("confirmed"));

        let visible = store
            .entry_versions(EntityKind::GenomicAlterationIdentified, current.ident)?
            .into_iter()
            .filter(VersionedRow::is_live)
            .collect::<Vec<_>>();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].data_version, 2);
        Ok(())
    }

    #[test]
    fn append_only_update_keeps_both_versions_visible() -> Result<()> {
        let mut store = test_support::migrated_store()?;
        let current = seeded(&mut store)?;

        let outcome = store.version_update(
            &VersionUpdateRequest::new(
                current.clone(),
                test_support::content(json!({"geneVariant": "TP53 (p.R248Q)"}))?,
                test_support::actor("curator")?,
            )
            .append_only(),
        )?;
        assert!(outcome.history_entry.is_none());
        assert_eq!(outcome.retired_count, 0);

        let versions =
            store.entry_versions(EntityKind::GenomicAlterationIdentified, current.ident)?;
        assert_eq!(versions.iter().filter(|row| row.is_live()).count(), 2);
        Ok(())
    }

    // Test IDs: TVER-002
    #[test]
    fn stale_current_entry_is_rejected_without_writes() -> Result<()> {
        let mut store = test_support::migrated_store()?;
        let first = seeded(&mut store)?;
        let actor = test_support::actor("curator")?;

        let second = store
            .version_update(&VersionUpdateRequest::new(
                first.clone(),
                test_support::content(json!({"geneVariant": "TP53 (p.R175H) edit A"}))?,
                actor.clone(),
            ))?
            .created;
        let err = store
            .version_update(&VersionUpdateRequest::new(
                first.clone(),
                test_support::content(json!({"geneVariant": "TP53 (p.R175H) edit B"}))?,
                actor.clone(),
            ))
            .err()
            .ok_or_else(|| anyhow!("versioning from a retired row must fail"))?;
        assert_eq!(classify(&err), HistoryErrorKind::Integrity);

        let visible = store
            .entry_versions(EntityKind::GenomicAlterationIdentified, first.ident)?
            .into_iter()
            .filter(VersionedRow::is_live)
            .collect::<Vec<_>>();
        assert_eq!(visible, vec![second.clone()]);

        let third = store.version_update(&VersionUpdateRequest::new(
            second.clone(),
            test_support::content(json!({"geneVariant": "TP53 (p.R175H) edit B"}))?,
            actor,
        ))?;
        assert_eq!(third.created.data_version, second.data_version + 1);
        assert_eq!(third.retired_count, 1);
        Ok(())
    }

    #[test]
    fn missing_carried_column_is_rejected_without_writes() -> Result<()> {
        let mut store = test_support::migrated_store()?;
        let current = seeded(&mut store)?;

        let err = store
            .version_update(
                &VersionUpdateRequest::new(
                    current.clone(),
                    test_support::content(json!({"geneVariant": "TP53 (p.R175H)"}))?,
                    test_support::actor("curator")?,
                )
                .carrying(["ident", "kbVariant"]),
            )
            .err()
            .ok_or_else(|| anyhow!("missing carried column must fail"))?;
        assert_eq!(classify(&err), HistoryErrorKind::Validation);
        assert_eq!(
            store.entry_versions(EntityKind::GenomicAlterationIdentified, current.ident)?.len(),
            1
        );
        Ok(())
    }

    #[test]
    fn retire_by_content_key_matches_current_value() -> Result<()> {
        let mut store = test_support::migrated_store()?;
        let report = store.create_report("POG0301")?;
        let current = test_support::create(
            &mut store,
            EntityKind::DetailedAlteration,
            report.report_id,
            json!({"gene": "EGFR", "variant": "p.L858R"}),
        )?
        .entry;

        let outcome = store.version_update(
            &VersionUpdateRequest::new(
                current.clone(),
                test_support::content(json!({"variant": "p.L858R", "zygosity": "het"}))?,
                test_support::actor("curator")?,
            )
            .carrying(["ident", "gene"])
            .retire_by("gene"),
        )?;
        assert_eq!(outcome.retired_count, 1);
        assert_eq!(outcome.created.column("gene"), Some(json!("EGFR")));
        assert!(store.get_entry(EntityKind::DetailedAlteration, current.ident)?.is_some());
        Ok(())
    }
}

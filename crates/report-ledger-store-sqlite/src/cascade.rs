use anyhow::Result;
use report_ledger_core::{ActorId, AlterationKey, EntityKind, HistoryError, VersionedRow};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::accessor::RowFilter;
use crate::entries::delete_with_event;
use crate::EntityRegistry;

/// Dependent records removed alongside one genomic alteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CascadeSummary {
    pub key: Option<AlterationKey>,
    pub therapeutic_events: usize,
    pub detailed_alterations: usize,
    /// Cascaded deletions whose ledger event was parked in the outbox.
    pub ledger_failures: usize,
}

const DEPENDENT_KINDS: [EntityKind; 2] =
    [EntityKind::TherapeuticEvent, EntityKind::DetailedAlteration];

/// Delete every therapeutic event and detailed alteration of the same report that refers to
/// the deleted alteration, recording one `delete` event per removed record.
///
/// Therapeutic events match on the exact alteration label, or on explicit `gene`/`variant`
/// fields when both records carry them. Detailed alterations match on the parsed key.
pub(crate) fn cascade_alteration_delete(
    conn: &Connection,
    registry: &EntityRegistry,
    deleted: &VersionedRow,
    actor: &ActorId,
    comment: Option<String>,
) -> Result<CascadeSummary> {
    if deleted.kind != EntityKind::GenomicAlterationIdentified {
        return Err(HistoryError::validation(format!(
            "only genomic alterations identified cascade deletes, got {}",
            deleted.kind
        ))
        .into());
    }

    let key = AlterationKey::from_content(deleted.kind, &deleted.content);
    if key.is_none() {
        tracing::warn!(
            ident = %deleted.ident,
            label = deleted.label().unwrap_or_default(),
            "alteration label has no gene/variant pair; detailed alterations are not cascaded"
        );
    }

    let mut summary = CascadeSummary { key, ..CascadeSummary::default() };
    for kind in DEPENDENT_KINDS {
        let accessor = registry.accessor(kind)?;
        let dependents = accessor
            .query(conn, &RowFilter::report(deleted.report_id), false)?
            .into_iter()
            .filter(|row| refers_to(deleted, summary.key.as_ref(), row));

        for row in dependents {
            if !delete_with_event(conn, registry, &row, actor, comment.clone())? {
                summary.ledger_failures += 1;
            }
            match kind {
                EntityKind::TherapeuticEvent => summary.therapeutic_events += 1,
                _ => summary.detailed_alterations += 1,
            }
        }
    }

    tracing::info!(
        ident = %deleted.ident,
        key = ?summary.key,
        therapeutic_events = summary.therapeutic_events,
        detailed_alterations = summary.detailed_alterations,
        ledger_failures = summary.ledger_failures,
        "cascaded genomic alteration delete"
    );
    Ok(summary)
}

fn refers_to(deleted: &VersionedRow, key: Option<&AlterationKey>, row: &VersionedRow) -> bool {
    match row.kind {
        EntityKind::TherapeuticEvent => {
            let same_label = matches!(
                (deleted.label(), row.label()),
                (Some(left), Some(right)) if left == right
            );
            let same_fields = matches!(
                (
                    AlterationKey::from_fields(&deleted.content),
                    AlterationKey::from_fields(&row.content),
                ),
                (Some(left), Some(right)) if left == right
            );
            same_label || same_fields
        }
        EntityKind::DetailedAlteration => key.is_some_and(|key| {
            AlterationKey::from_content(row.kind, &row.content).as_ref() == Some(key)
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use report_ledger_core::{EventType, ReportId};
    use serde_json::json;

    use super::*;
    use crate::{test_support, SqliteStore};

    struct Seeded {
        store: SqliteStore,
        report_id: ReportId,
        alteration: VersionedRow,
    }

    fn seeded(label: &str) -> Result<Seeded> {
        let mut store = test_support::migrated_store()?;
        let report = store.create_report("POG0600")?;
        let alteration = test_support::create(
            &mut store,
            EntityKind::GenomicAlterationIdentified,
            report.report_id,
            json!({"geneVariant": label}),
        )?
        .entry;
        Ok(Seeded { store, report_id: report.report_id, alteration })
    }

    // Test IDs: TCAS-001
    #[test]
    fn cascade_deletes_matching_therapeutic_event_with_independent_events() -> Result<()> {
        let Seeded { mut store, report_id, alteration } = seeded("KRAS (p.G12D)")?;
        let therapeutic = test_support::create(
            &mut store,
            EntityKind::TherapeuticEvent,
            report_id,
            json!({"genomicEvent": "KRAS (p.G12D)", "therapy": "sotorasib"}),
        )?
        .entry;
        let unrelated = test_support::create(
            &mut store,
            EntityKind::TherapeuticEvent,
            report_id,
            json!({"genomicEvent": "KRAS (p.G12C)", "therapy": "sotorasib"}),
        )?
        .entry;

        let outcome = store.delete_entry(
            EntityKind::GenomicAlterationIdentified,
            alteration.ident,
            &test_support::actor("curator")?,
            Some("false positive".to_string()),
            true,
        )?;
        let summary = outcome.cascade.ok_or_else(|| anyhow!("cascade summary expected"))?;
        assert_eq!(summary.therapeutic_events, 1);
        assert_eq!(summary.detailed_alterations, 0);
        assert_eq!(summary.ledger_failures, 0);

        assert!(store.entry_versions(EntityKind::TherapeuticEvent, therapeutic.ident)?.is_empty());
        assert!(store.get_entry(EntityKind::TherapeuticEvent, unrelated.ident)?.is_some());

        let deletes = store
            .list_report_events(report_id)?
            .into_iter()
            .filter(|event| event.event_type == EventType::Delete)
            .collect::<Vec<_>>();
        assert_eq!(deletes.len(), 2);
        assert_eq!(deletes[0].entry_ident, alteration.ident);
        assert_eq!(deletes[0].deleted_snapshot.as_ref(), Some(&alteration.snapshot()));
        assert_eq!(deletes[1].entry_ident, therapeutic.ident);
        assert_eq!(deletes[1].deleted_snapshot.as_ref(), Some(&therapeutic.snapshot()));
        assert!(deletes[0].sequence < deletes[1].sequence);
        Ok(())
    }

    // Test IDs: TCAS-002
    #[test]
    fn cascade_matches_detailed_alterations_by_gene_and_variant() -> Result<()> {
        let Seeded { mut store, report_id, alteration } = seeded("TP53 (p.R175H)")?;
        test_support::create(
            &mut store,
            EntityKind::DetailedAlteration,
            report_id,
            json!({"gene": "TP53", "variant": "p.R175H"}),
        )?;
        let other_gene = test_support::create(
            &mut store,
            EntityKind::DetailedAlteration,
            report_id,
            json!({"gene": "TP53", "variant": "p.R248Q"}),
        )?
        .entry;

        let outcome = store.delete_entry(
            EntityKind::GenomicAlterationIdentified,
            alteration.ident,
            &test_support::actor("curator")?,
            None,
            true,
        )?;
        let summary = outcome.cascade.ok_or_else(|| anyhow!("cascade summary expected"))?;
        assert_eq!(summary.detailed_alterations, 1);
        assert_eq!(
            summary.key,
            Some(AlterationKey { gene: "TP53".to_string(), variant: "p.R175H".to_string() })
        );
        assert_eq!(
            store.list_entries(EntityKind::DetailedAlteration, report_id)?,
            vec![other_gene]
        );
        Ok(())
    }

    #[test]
    fn cascade_stays_within_the_report() -> Result<()> {
        let Seeded { mut store, alteration, .. } = seeded("BRAF (p.V600E)")?;
        let other_report = store.create_report("POG0601")?;
        let foreign = test_support::create(
            &mut store,
            EntityKind::TherapeuticEvent,
            other_report.report_id,
            json!({"genomicEvent": "BRAF (p.V600E)"}),
        )?
        .entry;

        store.delete_entry(
            EntityKind::GenomicAlterationIdentified,
            alteration.ident,
            &test_support::actor("curator")?,
            None,
            true,
        )?;
        assert!(store.get_entry(EntityKind::TherapeuticEvent, foreign.ident)?.is_some());
        Ok(())
    }

    #[test]
    fn delete_without_cascade_leaves_dependents() -> Result<()> {
        let Seeded { mut store, report_id, alteration } = seeded("EGFR (p.L858R)")?;
        test_support::create(
            &mut store,
            EntityKind::TherapeuticEvent,
            report_id,
            json!({"genomicEvent": "EGFR (p.L858R)"}),
        )?;

        let outcome = store.delete_entry(
            EntityKind::GenomicAlterationIdentified,
            alteration.ident,
            &test_support::actor("curator")?,
            None,
            false,
        )?;
        assert!(outcome.cascade.is_none());
        assert_eq!(store.list_entries(EntityKind::TherapeuticEvent, report_id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn unparseable_label_cascades_only_exact_therapeutic_labels() -> Result<()> {
        let Seeded { mut store, report_id, alteration } = seeded("MSI-high")?;
        let therapeutic = test_support::create(
            &mut store,
            EntityKind::TherapeuticEvent,
            report_id,
            json!({"genomicEvent": "MSI-high"}),
        )?
        .entry;
        test_support::create(
            &mut store,
            EntityKind::DetailedAlteration,
            report_id,
            json!({"gene": "MSI", "variant": "high"}),
        )?;

        let outcome = store.delete_entry(
            EntityKind::GenomicAlterationIdentified,
            alteration.ident,
            &test_support::actor("curator")?,
            None,
            true,
        )?;
        let summary = outcome.cascade.ok_or_else(|| anyhow!("cascade summary expected"))?;
        assert_eq!(summary.key, None);
        assert_eq!((summary.therapeutic_events, summary.detailed_alterations), (1, 0));
        assert!(store.get_entry(EntityKind::TherapeuticEvent, therapeutic.ident)?.is_none());
        assert_eq!(store.list_entries(EntityKind::DetailedAlteration, report_id)?.len(), 1);
        Ok(())
    }

    // Test IDs: TCAS-003
    #[test]
    fn therapeutic_event_needs_exact_label_or_matching_fields() -> Result<()> {
        let Seeded { mut store, report_id, alteration } = seeded("KRAS (p.G12D)")?;
        let reworded = test_support::create(
            &mut store,
            EntityKind::TherapeuticEvent,
            report_id,
            json!({"genomicEvent": "KRAS p.G12D"}),
        )?
        .entry;
        let spaced = test_support::create(
            &mut store,
            EntityKind::TherapeuticEvent,
            report_id,
            json!({"genomicEvent": "KRAS  (p.G12D)"}),
        )?
        .entry;

        let outcome = store.delete_entry(
            EntityKind::GenomicAlterationIdentified,
            alteration.ident,
            &test_support::actor("curator")?,
            None,
            true,
        )?;
        let summary = outcome.cascade.ok_or_else(|| anyhow!("cascade summary expected"))?;
        assert_eq!(summary.therapeutic_events, 0);
        assert!(store.get_entry(EntityKind::TherapeuticEvent, reworded.ident)?.is_some());
        assert!(store.get_entry(EntityKind::TherapeuticEvent, spaced.ident)?.is_some());
        Ok(())
    }

    #[test]
    fn therapeutic_event_matches_on_explicit_gene_and_variant() -> Result<()> {
        let mut store = test_support::migrated_store()?;
        let report = store.create_report("POG0602")?;
        let alteration = test_support::create(
            &mut store,
            EntityKind::GenomicAlterationIdentified,
            report.report_id,
            json!({"geneVariant": "KRAS (p.G12D)", "gene": "KRAS", "variant": "p.G12D"}),
        )?
        .entry;
        let structured = test_support::create(
            &mut store,
            EntityKind::TherapeuticEvent,
            report.report_id,
            json!({"genomicEvent": "KRAS G12D", "gene": "KRAS", "variant": "p.G12D"}),
        )?
        .entry;

        store.delete_entry(
            EntityKind::GenomicAlterationIdentified,
            alteration.ident,
            &test_support::actor("curator")?,
            None,
            true,
        )?;
        assert!(store.get_entry(EntityKind::TherapeuticEvent, structured.ident)?.is_none());
        Ok(())
    }

    // Test IDs: TCAS-004
    #[test]
    fn cascade_parks_every_event_when_the_ledger_is_unavailable() -> Result<()> {
        let Seeded { mut store, report_id, alteration } = seeded("BRAF (p.V600E)")?;
        let therapeutic = test_support::create(
            &mut store,
            EntityKind::TherapeuticEvent,
            report_id,
            json!({"genomicEvent": "BRAF (p.V600E)"}),
        )?
        .entry;
        let detailed = test_support::create(
            &mut store,
            EntityKind::DetailedAlteration,
            report_id,
            json!({"gene": "BRAF", "variant": "p.V600E"}),
        )?
        .entry;
        store.conn.execute_batch("DROP TABLE report_change_history")?;

        let outcome = store.delete_entry(
            EntityKind::GenomicAlterationIdentified,
            alteration.ident,
            &test_support::actor("curator")?,
            None,
            true,
        )?;
        assert!(!outcome.ledger_recorded);
        let summary = outcome.cascade.ok_or_else(|| anyhow!("cascade summary expected"))?;
        assert_eq!((summary.therapeutic_events, summary.detailed_alterations), (1, 1));
        assert_eq!(summary.ledger_failures, 2);
        assert!(store.get_entry(EntityKind::TherapeuticEvent, therapeutic.ident)?.is_none());
        assert!(store.get_entry(EntityKind::DetailedAlteration, detailed.ident)?.is_none());

        // One parked event for the alteration itself plus one per cascaded dependent.
        assert_eq!(store.pending_outbox()?.len(), 3);

        store.conn.execute_batch(crate::MIGRATION_002_LEDGER_SQL)?;
        assert_eq!(store.replay_outbox(None)?.delivered.len(), 3);
        let deletes = store
            .list_report_events(report_id)?
            .into_iter()
            .filter(|event| event.event_type == EventType::Delete)
            .count();
        assert_eq!(deletes, 3);
        Ok(())
    }
}

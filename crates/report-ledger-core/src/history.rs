use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    ActorId, ChangeSeq, EntityKind, EntryIdent, HistoryError, HistoryIdent, ReportId, RowSnapshot,
};

/// Data-history entries written by versioned updates and by legacy reverts.
pub const CHANGE_HISTORY_TYPE: &str = "change";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger event that has not been written yet.
///
/// Also the payload parked in the ledger outbox when a write fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub event_type: EventType,
    pub entry_ident: EntryIdent,
    pub entity_kind: EntityKind,
    pub field_name: Option<String>,
    pub previous_value: Option<Value>,
    pub new_value: Option<Value>,
    pub deleted_snapshot: Option<RowSnapshot>,
    pub actor_id: ActorId,
    pub report_id: ReportId,
    pub display_name: Option<String>,
    pub comment: Option<String>,
}

impl ChangeRecord {
    #[must_use]
    pub fn create(
        entry_ident: EntryIdent,
        entity_kind: EntityKind,
        actor_id: ActorId,
        report_id: ReportId,
        display_name: Option<String>,
    ) -> Self {
        Self {
            event_type: EventType::Create,
            entry_ident,
            entity_kind,
            field_name: None,
            previous_value: None,
            new_value: None,
            deleted_snapshot: None,
            actor_id,
            report_id,
            display_name,
            comment: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn update(
        entry_ident: EntryIdent,
        entity_kind: EntityKind,
        field_name: impl Into<String>,
        previous_value: Value,
        new_value: Value,
        actor_id: ActorId,
        report_id: ReportId,
        display_name: Option<String>,
        comment: Option<String>,
    ) -> Self {
        Self {
            event_type: EventType::Update,
            entry_ident,
            entity_kind,
            field_name: Some(field_name.into()),
            previous_value: Some(previous_value),
            new_value: Some(new_value),
            deleted_snapshot: None,
            actor_id,
            report_id,
            display_name,
            comment,
        }
    }

    #[must_use]
    pub fn delete(
        snapshot: RowSnapshot,
        entity_kind: EntityKind,
        actor_id: ActorId,
        display_name: Option<String>,
        comment: Option<String>,
    ) -> Self {
        Self {
            event_type: EventType::Delete,
            entry_ident: snapshot.ident,
            entity_kind,
            field_name: None,
            previous_value: None,
            new_value: None,
            report_id: snapshot.report_id,
            deleted_snapshot: Some(snapshot),
            actor_id,
            display_name,
            comment,
        }
    }

    /// Check the mandatory parameters for this event type.
    ///
    /// # Errors
    /// Returns [`HistoryError::Validation`] naming the first missing parameter.
    pub fn validate(&self) -> Result<(), HistoryError> {
        if self.actor_id.as_str().trim().is_empty() {
            return Err(HistoryError::validation("actor_id is mandatory"));
        }

        match self.event_type {
            EventType::Create => Ok(()),
            EventType::Update => {
                if self.field_name.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                    return Err(HistoryError::validation("update events require field_name"));
                }
                if self.previous_value.is_none() || self.new_value.is_none() {
                    return Err(HistoryError::validation(
                        "update events require previous_value and new_value",
                    ));
                }
                Ok(())
            }
            EventType::Delete => match &self.deleted_snapshot {
                None => Err(HistoryError::validation("delete events require deleted content")),
                Some(snapshot) if snapshot.ident != self.entry_ident => Err(
                    HistoryError::validation("deleted content ident MUST match entry_ident"),
                ),
                Some(_) => Ok(()),
            },
        }
    }
}

/// One immutable entry of the change-history ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeHistoryEvent {
    pub sequence: ChangeSeq,
    pub event_type: EventType,
    pub entry_ident: EntryIdent,
    pub entity_kind: EntityKind,
    pub table_name: String,
    pub field_name: Option<String>,
    pub previous_value: Option<Value>,
    pub new_value: Option<Value>,
    pub deleted_snapshot: Option<RowSnapshot>,
    pub actor_id: ActorId,
    pub report_id: ReportId,
    pub display_name: Option<String>,
    pub comment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ChangeHistoryEvent {
    /// The compensating `update` record for this event: previous and new values swapped.
    ///
    /// # Errors
    /// Returns [`HistoryError::Integrity`] when this is not a complete update event.
    pub fn swapped_update(
        &self,
        actor_id: ActorId,
        comment: Option<String>,
    ) -> Result<ChangeRecord, HistoryError> {
        let (Some(field), Some(previous), Some(new)) =
            (&self.field_name, &self.previous_value, &self.new_value)
        else {
            return Err(HistoryError::integrity(format!(
                "change history event {} is not a complete update event",
                self.sequence
            )));
        };

        Ok(ChangeRecord::update(
            self.entry_ident,
            self.entity_kind,
            field.clone(),
            new.clone(),
            previous.clone(),
            actor_id,
            self.report_id,
            self.display_name.clone(),
            comment,
        ))
    }
}

/// Preconditions gathered before a `delete` event may be reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteRevertCheck {
    pub candidate: ChangeSeq,
    pub live_row_exists: bool,
    pub latest_report_delete: Option<ChangeSeq>,
}

impl DeleteRevertCheck {
    /// # Errors
    /// Returns [`HistoryError::Integrity`] listing every violated precondition.
    pub fn evaluate(&self, ident: EntryIdent) -> Result<(), HistoryError> {
        let mut problems = Vec::new();
        if self.live_row_exists {
            problems.push(format!("record with ident {ident} already exists"));
        }
        if self.latest_report_delete != Some(self.candidate) {
            problems.push(
                "the record you are attempting to restore is outdated; only the most recent \
                 deletion in the report may be restored"
                    .to_string(),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(HistoryError::integrity(problems.join(", ")))
        }
    }
}

/// Legacy version-to-version history entry written by versioned updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataHistoryEntry {
    pub ident: HistoryIdent,
    pub history_type: String,
    pub table_name: String,
    pub entity_kind: EntityKind,
    pub target_ident: EntryIdent,
    pub previous_version: u32,
    pub new_version: u32,
    pub owner_report_id: ReportId,
    pub actor_id: ActorId,
    pub comment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{EntityKind, EntryIdent, HistoryError, ReportId};

/// Domain fields of one record, keyed by field name.
pub type Content = serde_json::Map<String, Value>;

/// One stored data version of a report-scoped record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedRow {
    pub row_id: i64,
    pub kind: EntityKind,
    pub ident: EntryIdent,
    pub report_id: ReportId,
    pub data_version: u32,
    pub content: Content,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl VersionedRow {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Look up a column by name: storage columns first, then content fields.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Value> {
        match name {
            "ident" => Some(Value::String(self.ident.to_string())),
            "report_id" => Some(Value::String(self.report_id.to_string())),
            "data_version" => Some(Value::from(self.data_version)),
            _ => self.content.get(name).cloned(),
        }
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.kind.label_field().and_then(|field| self.content.get(field)).and_then(Value::as_str)
    }

    /// Full record contents minus the internal row id.
    #[must_use]
    pub fn snapshot(&self) -> RowSnapshot {
        RowSnapshot {
            ident: self.ident,
            report_id: self.report_id,
            data_version: self.data_version,
            content: self.content.clone(),
            created_at: Some(self.created_at),
            updated_at: Some(self.updated_at),
        }
    }
}

/// Record contents without storage identity.
///
/// Used both as the insert payload for a new row and as the pre-delete image kept on
/// `delete` ledger events. Missing timestamps are stamped by storage on insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowSnapshot {
    pub ident: EntryIdent,
    pub report_id: ReportId,
    pub data_version: u32,
    pub content: Content,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl RowSnapshot {
    #[must_use]
    pub fn first_version(report_id: ReportId, content: Content) -> Self {
        Self {
            ident: EntryIdent::new(),
            report_id,
            data_version: 1,
            content,
            created_at: None,
            updated_at: None,
        }
    }

    /// Write one named column, mirroring [`VersionedRow::column`].
    ///
    /// # Errors
    /// Returns [`HistoryError::Validation`] when a storage column receives a malformed value.
    pub fn set_column(&mut self, name: &str, value: Value) -> Result<(), HistoryError> {
        match name {
            "ident" => {
                self.ident = value_as_str(name, &value)?.parse()?;
            }
            "report_id" => {
                self.report_id = value_as_str(name, &value)?.parse()?;
            }
            "data_version" => {
                let version = value
                    .as_u64()
                    .and_then(|raw| u32::try_from(raw).ok())
                    .filter(|version| *version >= 1)
                    .ok_or_else(|| {
                        HistoryError::validation("data_version MUST be a positive integer")
                    })?;
                self.data_version = version;
            }
            _ => {
                self.content.insert(name.to_string(), value);
            }
        }
        Ok(())
    }
}

fn value_as_str<'a>(name: &str, value: &'a Value) -> Result<&'a str, HistoryError> {
    value.as_str().ok_or_else(|| HistoryError::validation(format!("column `{name}` MUST be text")))
}

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use report_ledger_core::{
    EntityKind, EntryIdent, HistoryError, ReportId, RowSnapshot, VersionedRow, RESERVED_COLUMNS,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::{now_rfc3339, parse_optional_rfc3339, parse_rfc3339, rfc3339};

/// Row selection shared by every accessor operation.
///
/// `ident`, `report_id`, and `data_versions` narrow the SQL query; `columns` are matched
/// against each candidate row through [`VersionedRow::column`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    pub ident: Option<EntryIdent>,
    pub report_id: Option<ReportId>,
    pub data_versions: Vec<u32>,
    pub columns: Vec<(String, Value)>,
}

impl RowFilter {
    #[must_use]
    pub fn ident(ident: EntryIdent) -> Self {
        Self { ident: Some(ident), ..Self::default() }
    }

    #[must_use]
    pub fn report(report_id: ReportId) -> Self {
        Self { report_id: Some(report_id), ..Self::default() }
    }

    #[must_use]
    pub fn with_versions(mut self, versions: impl IntoIterator<Item = u32>) -> Self {
        self.data_versions.extend(versions);
        self
    }

    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, value: Value) -> Self {
        self.columns.push((name.into(), value));
        self
    }

    fn matches(&self, row: &VersionedRow) -> bool {
        self.columns.iter().all(|(name, expected)| row.column(name).as_ref() == Some(expected))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub limit: Option<usize>,
    /// Physically remove matching rows, soft-deleted ones included. A soft delete only
    /// touches live rows.
    pub hard: bool,
}

impl DeleteOptions {
    #[must_use]
    pub fn soft_one() -> Self {
        Self { limit: Some(1), hard: false }
    }

    #[must_use]
    pub fn hard() -> Self {
        Self { limit: None, hard: true }
    }
}

/// Storage operations for one entity kind.
///
/// Every method runs on the caller's connection so it joins the caller's transaction.
pub trait EntityAccessor: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Insert a row and return it as stored.
    ///
    /// # Errors
    /// Returns an error when the insert violates a constraint or cannot be read back.
    fn insert(&self, conn: &Connection, row: &RowSnapshot) -> Result<VersionedRow>;

    /// Write one content field on the live row with `ident` and return the row as re-read.
    ///
    /// Returns `Ok(None)` when no live row exists.
    ///
    /// # Errors
    /// Returns an error for reserved field names or when the write fails.
    fn update_field(
        &self,
        conn: &Connection,
        ident: EntryIdent,
        field: &str,
        value: &Value,
    ) -> Result<Option<VersionedRow>>;

    /// # Errors
    /// Returns an error when matching rows cannot be read or removed.
    fn delete(&self, conn: &Connection, filter: &RowFilter, options: DeleteOptions)
        -> Result<usize>;

    /// Clear `deleted_at` on matching soft-deleted rows.
    ///
    /// # Errors
    /// Returns an error when matching rows cannot be read or updated.
    fn restore(&self, conn: &Connection, filter: &RowFilter, limit: Option<usize>) -> Result<usize>;

    /// Highest data version for `ident`, soft-deleted rows included.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    fn max_version(&self, conn: &Connection, ident: EntryIdent) -> Result<Option<u32>>;

    /// Matching rows ordered by data version.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    fn query(
        &self,
        conn: &Connection,
        filter: &RowFilter,
        include_deleted: bool,
    ) -> Result<Vec<VersionedRow>>;
}

const ROW_COLUMNS: &str =
    "id, ident, report_id, data_version, content_json, created_at, updated_at, deleted_at";

/// Accessor over the table named by [`EntityKind::table_name`].
#[derive(Debug, Clone, Copy)]
pub struct TableAccessor {
    kind: EntityKind,
}

impl TableAccessor {
    #[must_use]
    pub fn new(kind: EntityKind) -> Self {
        Self { kind }
    }

    fn table(&self) -> &'static str {
        self.kind.table_name()
    }

    fn load_row(&self, conn: &Connection, row_id: i64) -> Result<Option<VersionedRow>> {
        conn.query_row(
            &format!("SELECT {ROW_COLUMNS} FROM {} WHERE id = ?1", self.table()),
            params![row_id],
            |row| Ok(self.raw_row(row)),
        )
        .optional()
        .with_context(|| format!("failed to load row {row_id} from {}", self.table()))?
        .transpose()
    }

    fn raw_row(&self, row: &Row<'_>) -> Result<VersionedRow> {
        let ident_raw: String = row.get(1)?;
        let report_raw: String = row.get(2)?;
        let content_json: String = row.get(4)?;
        let content = serde_json::from_str(&content_json)
            .with_context(|| format!("failed to decode content_json in {}", self.table()))?;

        Ok(VersionedRow {
            row_id: row.get(0)?,
            kind: self.kind,
            ident: ident_raw.parse()?,
            report_id: report_raw.parse()?,
            data_version: row.get::<_, u32>(3)?,
            content,
            created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
            updated_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
            deleted_at: parse_optional_rfc3339(row.get(7)?)?,
        })
    }

    fn targets(
        &self,
        conn: &Connection,
        filter: &RowFilter,
        include_deleted: bool,
        limit: Option<usize>,
    ) -> Result<Vec<i64>> {
        let rows = self.query(conn, filter, include_deleted)?;
        let ids = rows.into_iter().map(|row| row.row_id);
        Ok(match limit {
            Some(limit) => ids.take(limit).collect(),
            None => ids.collect(),
        })
    }
}

impl EntityAccessor for TableAccessor {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn insert(&self, conn: &Connection, row: &RowSnapshot) -> Result<VersionedRow> {
        let now = now_rfc3339()?;
        let created_at = row.created_at.map(rfc3339).transpose()?.unwrap_or_else(|| now.clone());
        let updated_at = row.updated_at.map(rfc3339).transpose()?.unwrap_or(now);
        let content_json =
            serde_json::to_string(&row.content).context("failed to serialize row content")?;

        conn.execute(
            &format!(
                "INSERT INTO {}(ident, report_id, data_version, content_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                self.table()
            ),
            params![
                row.ident.to_string(),
                row.report_id.to_string(),
                i64::from(row.data_version),
                content_json,
                created_at,
                updated_at,
            ],
        )
        .with_context(|| {
            format!("failed to insert {} v{} into {}", row.ident, row.data_version, self.table())
        })?;

        self.load_row(conn, conn.last_insert_rowid())?
            .ok_or_else(|| anyhow!("inserted row vanished from {}", self.table()))
    }

    fn update_field(
        &self,
        conn: &Connection,
        ident: EntryIdent,
        field: &str,
        value: &Value,
    ) -> Result<Option<VersionedRow>> {
        if RESERVED_COLUMNS.contains(&field) {
            return Err(HistoryError::validation(format!(
                "`{field}` is managed by storage and cannot be updated"
            ))
            .into());
        }

        let Some(mut live) = self.query(conn, &RowFilter::ident(ident), false)?.pop() else {
            return Ok(None);
        };
        live.content.insert(field.to_string(), value.clone());
        let content_json =
            serde_json::to_string(&live.content).context("failed to serialize row content")?;

        conn.execute(
            &format!(
                "UPDATE {} SET content_json = ?1, updated_at = ?2 WHERE id = ?3",
                self.table()
            ),
            params![content_json, now_rfc3339()?, live.row_id],
        )
        .with_context(|| format!("failed to update `{field}` on {ident} in {}", self.table()))?;

        self.load_row(conn, live.row_id)
    }

    fn delete(
        &self,
        conn: &Connection,
        filter: &RowFilter,
        options: DeleteOptions,
    ) -> Result<usize> {
        let targets = self.targets(conn, filter, options.hard, options.limit)?;
        let now = now_rfc3339()?;

        let mut removed = 0;
        for row_id in targets {
            let result = if options.hard {
                let sql = format!("DELETE FROM {} WHERE id = ?1", self.table());
                conn.execute(&sql, params![row_id])
            } else {
                conn.execute(
                    &format!(
                        "UPDATE {} SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                        self.table()
                    ),
                    params![row_id, now],
                )
            };
            removed += result
                .with_context(|| format!("failed to delete row {row_id} from {}", self.table()))?;
        }
        Ok(removed)
    }

    fn restore(
        &self,
        conn: &Connection,
        filter: &RowFilter,
        limit: Option<usize>,
    ) -> Result<usize> {
        let deleted = self
            .query(conn, filter, true)?
            .into_iter()
            .filter(|row| !row.is_live())
            .map(|row| row.row_id);
        let targets: Vec<i64> = match limit {
            Some(limit) => deleted.take(limit).collect(),
            None => deleted.collect(),
        };

        let mut restored = 0;
        for row_id in targets {
            restored += conn
                .execute(
                    &format!("UPDATE {} SET deleted_at = NULL WHERE id = ?1", self.table()),
                    params![row_id],
                )
                .with_context(|| format!("failed to restore row {row_id} in {}", self.table()))?;
        }
        Ok(restored)
    }

    fn max_version(&self, conn: &Connection, ident: EntryIdent) -> Result<Option<u32>> {
        conn.query_row(
            &format!("SELECT MAX(data_version) FROM {} WHERE ident = ?1", self.table()),
            params![ident.to_string()],
            |row| row.get::<_, Option<u32>>(0),
        )
        .with_context(|| format!("failed to read max data_version for {ident}"))
    }

    fn query(
        &self,
        conn: &Connection,
        filter: &RowFilter,
        include_deleted: bool,
    ) -> Result<Vec<VersionedRow>> {
        let mut sql = format!("SELECT {ROW_COLUMNS} FROM {} WHERE 1 = 1", self.table());
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(ident) = filter.ident {
            args.push(SqlValue::Text(ident.to_string()));
            sql.push_str(&format!(" AND ident = ?{}", args.len()));
        }
        if let Some(report_id) = filter.report_id {
            args.push(SqlValue::Text(report_id.to_string()));
            sql.push_str(&format!(" AND report_id = ?{}", args.len()));
        }
        if !filter.data_versions.is_empty() {
            let mut placeholders = Vec::with_capacity(filter.data_versions.len());
            for version in &filter.data_versions {
                args.push(SqlValue::Integer(i64::from(*version)));
                placeholders.push(format!("?{}", args.len()));
            }
            sql.push_str(&format!(" AND data_version IN ({})", placeholders.join(", ")));
        }
        if !include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        sql.push_str(" ORDER BY data_version ASC, id ASC");

        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare query on {}", self.table()))?;
        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        let mut matched = Vec::new();
        while let Some(row) = rows.next()? {
            let decoded = self.raw_row(row)?;
            if filter.matches(&decoded) {
                matched.push(decoded);
            }
        }
        Ok(matched)
    }
}

/// Kind-to-accessor table built once when a store is opened.
pub struct EntityRegistry {
    accessors: BTreeMap<EntityKind, Box<dyn EntityAccessor>>,
}

impl EntityRegistry {
    /// A registry with a [`TableAccessor`] for every known kind.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self { accessors: BTreeMap::new() };
        for kind in EntityKind::ALL {
            registry.register(Box::new(TableAccessor::new(kind)));
        }
        registry
    }

    pub fn register(&mut self, accessor: Box<dyn EntityAccessor>) {
        self.accessors.insert(accessor.kind(), accessor);
    }

    /// # Errors
    /// Returns [`HistoryError::Validation`] when no accessor is registered for `kind`.
    pub fn accessor(&self, kind: EntityKind) -> Result<&dyn EntityAccessor> {
        self.accessors
            .get(&kind)
            .map(|accessor| accessor.as_ref())
            .ok_or_else(|| {
                HistoryError::validation(format!("no accessor registered for {kind}")).into()
            })
    }
}

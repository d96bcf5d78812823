//! The `rename_column` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified};

use super::{ensure_unreserved, execute};

/// Renames a column.
///
/// Purely virtual during the transition: the old view keeps exposing the old
/// name, the new view aliases the same physical column under the new name.
/// No duplicate column, no triggers, no backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpRenameColumn {
    /// Table name.
    pub table: String,
    /// Current column name.
    pub from: String,
    /// New column name.
    pub to: String,
}

impl OpRenameColumn {
    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        ensure_unreserved(&self.to)?;
        let table = schema.table(&self.table).ok_or_else(|| RollError::TableDoesNotExist {
            name: self.table.clone(),
        })?;
        if table.column(&self.from).is_none() {
            return Err(RollError::ColumnDoesNotExist {
                table: self.table.clone(),
                column: self.from.clone(),
            });
        }
        if table.column(&self.to).is_some() {
            return Err(RollError::ColumnAlreadyExists {
                table: self.table.clone(),
                column: self.to.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        if let Some(table) = schema.table_mut(&self.table) {
            table.rename_column(&self.from, &self.to);
        }
    }

    pub(crate) async fn start(
        &self,
        _conn: &mut PgConnection,
        _state_schema: &str,
        schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        self.update_schema(schema);
        Ok(None)
    }

    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {table} RENAME COLUMN {from} TO {to}",
            table = quote_qualified(schema, &self.table),
            from = quote_ident(&self.from),
            to = quote_ident(&self.to),
        );
        execute(conn, "rename column", &sql).await
    }

    pub(crate) async fn rollback(&self, _conn: &mut PgConnection, _schema: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Table};

    fn schema() -> Schema {
        let mut schema = Schema::new("public");
        let mut table = Table::new("users");
        table.add_column(
            "fullname",
            Column {
                name: "fullname".to_string(),
                sql_type: "text".to_string(),
                ..Column::default()
            },
        );
        schema.add_table("users", table);
        schema
    }

    #[test]
    fn test_rename_remaps_the_visible_name() {
        let mut schema = schema();
        let op = OpRenameColumn {
            table: "users".to_string(),
            from: "fullname".to_string(),
            to: "name".to_string(),
        };
        op.validate(&schema).unwrap();
        op.update_schema(&mut schema);

        let table = schema.table("users").unwrap();
        assert!(table.column("fullname").is_none());
        assert_eq!(table.column("name").unwrap().name, "fullname");
    }

    #[test]
    fn test_validate_rejects_missing_column() {
        let op = OpRenameColumn {
            table: "users".to_string(),
            from: "missing".to_string(),
            to: "name".to_string(),
        };
        let err = op.validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::ColumnDoesNotExist { .. }));
    }

    #[test]
    fn test_validate_rejects_existing_target() {
        let op = OpRenameColumn {
            table: "users".to_string(),
            from: "fullname".to_string(),
            to: "fullname".to_string(),
        };
        let err = op.validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::ColumnAlreadyExists { .. }));
    }
}

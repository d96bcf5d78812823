//! The `create_index` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::{Index, Schema};
use crate::sql::{quote_ident, quote_qualified};

use super::{ensure_unreserved, execute};

/// Creates an index.
///
/// Built with `CREATE INDEX CONCURRENTLY`, which cannot run inside a
/// transaction, so the whole Start runs autocommit. The index exists from
/// Start onwards; Complete has nothing left to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpCreateIndex {
    /// Index name.
    pub name: String,
    /// Table name.
    pub table: String,
    /// Columns to index.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
}

impl OpCreateIndex {
    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        ensure_unreserved(&self.name)?;
        let table = schema.table(&self.table).ok_or_else(|| RollError::TableDoesNotExist {
            name: self.table.clone(),
        })?;
        for column in &self.columns {
            if table.column(column).is_none() {
                return Err(RollError::ColumnDoesNotExist {
                    table: self.table.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        if let Some(table) = schema.table_mut(&self.table) {
            table.indexes.insert(
                self.name.clone(),
                Index {
                    name: self.name.clone(),
                    columns: self.columns.clone(),
                    unique: self.unique,
                },
            );
        }
    }

    pub(crate) async fn start(
        &self,
        conn: &mut PgConnection,
        _state_schema: &str,
        schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        let table = schema
            .table(&self.table)
            .ok_or_else(|| RollError::TableDoesNotExist {
                name: self.table.clone(),
            })?;

        // index the physical columns backing the visible names
        let columns = self
            .columns
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .map_or_else(|| quote_ident(name), |c| quote_ident(&c.name))
            })
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "CREATE {unique}INDEX CONCURRENTLY IF NOT EXISTS {name} ON {table} ({columns})",
            unique = if self.unique { "UNIQUE " } else { "" },
            name = quote_ident(&self.name),
            table = quote_qualified(&schema.name, &table.name),
        );
        execute(conn, "create index", &sql).await?;

        self.update_schema(schema);
        Ok(None)
    }

    pub(crate) async fn complete(&self, _conn: &mut PgConnection, _schema: &str) -> Result<()> {
        Ok(())
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let sql = format!(
            "DROP INDEX CONCURRENTLY IF EXISTS {name}",
            name = quote_qualified(schema, &self.name),
        );
        execute(conn, "drop index", &sql).await
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
            "email",
            Column {
                name: "email".to_string(),
                sql_type: "text".to_string(),
                ..Column::default()
            },
        );
        schema.add_table("users", table);
        schema
    }

    fn op() -> OpCreateIndex {
        OpCreateIndex {
            name: "idx_users_email".to_string(),
            table: "users".to_string(),
            columns: vec!["email".to_string()],
            unique: false,
        }
    }

    #[test]
    fn test_validate_requires_columns() {
        op().validate(&schema()).unwrap();

        let mut bad = op();
        bad.columns = vec!["missing".to_string()];
        let err = bad.validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::ColumnDoesNotExist { .. }));
    }

    #[test]
    fn test_update_schema_registers_index() {
        let mut schema = schema();
        op().update_schema(&mut schema);

        let index = &schema.table("users").unwrap().indexes["idx_users_email"];
        assert_eq!(index.columns, vec!["email".to_string()]);
        assert!(!index.unique);
    }
}

//! The `drop_constraint` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified};

use super::duplicate::{finalize_not_null_sql, Duplicator};
use super::triggers::{create_trigger, drop_trigger, TriggerConfig, TriggerDirection};
use super::{execute, temporary_name, trigger_name};

/// Drops a single-column constraint.
///
/// The constrained column is duplicated *without* the constraint, so writes
/// that the constraint would reject already succeed through the new view
/// during the transition. The old column, and with it the constraint, is
/// dropped at Complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpDropConstraint {
    /// Table name.
    pub table: String,
    /// Column the constraint covers.
    pub column: String,
    /// Constraint name.
    pub name: String,
    /// Old-shape to new-shape conversion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<String>,
    /// New-shape to old-shape conversion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<String>,
}

impl OpDropConstraint {
    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        let table = schema.table(&self.table).ok_or_else(|| RollError::TableDoesNotExist {
            name: self.table.clone(),
        })?;
        if table.column(&self.column).is_none() {
            return Err(RollError::ColumnDoesNotExist {
                table: self.table.clone(),
                column: self.column.clone(),
            });
        }
        if !table.constraints.contains_key(&self.name) {
            return Err(RollError::ConstraintDoesNotExist {
                table: self.table.clone(),
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        if let Some(table) = schema.table_mut(&self.table) {
            if let Some(column) = table.column_mut(&self.column) {
                column.name = temporary_name(&column.name);
                column.transient = true;
            }
            table.constraints.remove(&self.name);
        }
    }

    pub(crate) async fn start(
        &self,
        conn: &mut PgConnection,
        state_schema: &str,
        schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        let table = schema
            .table(&self.table)
            .ok_or_else(|| RollError::TableDoesNotExist {
                name: self.table.clone(),
            })?
            .clone();
        let column = table
            .column(&self.column)
            .ok_or_else(|| RollError::ColumnDoesNotExist {
                table: self.table.clone(),
                column: self.column.clone(),
            })?;
        let old_physical = column.name.clone();
        let temp = temporary_name(&old_physical);

        Duplicator::new(&schema.name, &table, column)
            .without_constraint(&self.name)
            .duplicate(conn)
            .await?;

        let up = self.up.clone().unwrap_or_else(|| quote_ident(&self.column));
        create_trigger(
            conn,
            &TriggerConfig {
                name: trigger_name(&self.table, &temp),
                direction: TriggerDirection::Up,
                schema: &schema.name,
                state_schema,
                table: &table.name,
                physical_column: &temp,
                expression: &up,
                columns: &table.columns,
            },
        )
        .await?;

        self.update_schema(schema);

        let new_table = schema
            .table(&self.table)
            .ok_or_else(|| RollError::TableDoesNotExist {
                name: self.table.clone(),
            })?
            .clone();
        let down = self.down.clone().unwrap_or_else(|| quote_ident(&self.column));
        create_trigger(
            conn,
            &TriggerConfig {
                name: trigger_name(&self.table, &old_physical),
                direction: TriggerDirection::Down,
                schema: &schema.name,
                state_schema,
                table: &new_table.name,
                physical_column: &old_physical,
                expression: &down,
                columns: &new_table.columns,
            },
        )
        .await?;

        Ok(Some(backfill::Task::new(&new_table, vec![temp])?))
    }

    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let temp = temporary_name(&self.column);
        drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &temp)).await?;
        drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &self.column)).await?;

        let qualified = quote_qualified(schema, &self.table);
        // the constraint is dropped together with the column it covers
        let sql = format!(
            "ALTER TABLE {qualified} DROP COLUMN IF EXISTS {column}",
            column = quote_ident(&self.column),
        );
        execute(conn, "drop old column", &sql).await?;

        let sql = format!(
            "ALTER TABLE {qualified} RENAME COLUMN {temp} TO {column}",
            temp = quote_ident(&temp),
            column = quote_ident(&self.column),
        );
        execute(conn, "promote column", &sql).await?;

        execute(
            conn,
            "set not null",
            &finalize_not_null_sql(schema, &self.table, &self.column),
        )
        .await
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let temp = temporary_name(&self.column);
        drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &temp)).await?;
        drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &self.column)).await?;

        let sql = format!(
            "ALTER TABLE {table} DROP COLUMN IF EXISTS {column}",
            table = quote_qualified(schema, &self.table),
            column = quote_ident(&temp),
        );
        execute(conn, "drop duplicated column", &sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Constraint, ConstraintKind, Table};

    fn schema() -> Schema {
        let mut schema = Schema::new("public");
        let mut table = Table::new("books");
        table.add_column(
            "pages",
            Column {
                name: "pages".to_string(),
                sql_type: "integer".to_string(),
                nullable: true,
                ..Column::default()
            },
        );
        table.constraints.insert(
            "books_pages_check".to_string(),
            Constraint {
                name: "books_pages_check".to_string(),
                kind: ConstraintKind::Check,
                columns: vec!["pages".to_string()],
                definition: Some("CHECK ((pages > 0))".to_string()),
            },
        );
        schema.add_table("books", table);
        schema
    }

    fn op() -> OpDropConstraint {
        OpDropConstraint {
            table: "books".to_string(),
            column: "pages".to_string(),
            name: "books_pages_check".to_string(),
            up: None,
            down: None,
        }
    }

    #[test]
    fn test_validate_requires_the_constraint() {
        op().validate(&schema()).unwrap();

        let mut bad = op();
        bad.name = "missing".to_string();
        let err = bad.validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::ConstraintDoesNotExist { .. }));
    }

    #[test]
    fn test_update_schema_removes_constraint_and_duplicates_column() {
        let mut schema = schema();
        op().update_schema(&mut schema);

        let table = schema.table("books").unwrap();
        assert!(table.constraints.is_empty());
        assert_eq!(table.column("pages").unwrap().name, "_pgroll_new_pages");
    }
}

//! Adding a CHECK constraint to a column (an `alter_column` facet).

use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified, rewrite_column_refs};

use super::duplicate::{finalize_not_null_sql, Duplicator};
use super::triggers::{create_trigger, drop_trigger, TriggerConfig, TriggerDirection};
use super::{execute, temporary_name, trigger_name};

/// Sets a CHECK constraint on a column via a duplicated physical column.
///
/// The constraint is created NOT VALID against the duplicate at Start so
/// existing rows are not scanned under lock; Complete validates it once the
/// backfill has converted every row.
#[derive(Debug, Clone, PartialEq)]
pub struct OpSetCheckConstraint {
    /// Table name.
    pub table: String,
    /// Column name.
    pub column: String,
    /// CHECK expression over the column's visible name.
    pub check: String,
    /// Old-shape to new-shape conversion.
    pub up: Option<String>,
    /// New-shape to old-shape conversion.
    pub down: Option<String>,
}

impl OpSetCheckConstraint {
    fn constraint_name(&self) -> String {
        format!("{}_{}_check", self.table, self.column)
    }

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
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        if let Some(column) = schema
            .table_mut(&self.table)
            .and_then(|t| t.column_mut(&self.column))
        {
            column.name = temporary_name(&column.name);
            column.transient = true;
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

        Duplicator::new(&schema.name, &table, column).duplicate(conn).await?;

        let check = rewrite_column_refs(&self.check, &self.column, &temp)?;
        let sql = format!(
            "ALTER TABLE {table} ADD CONSTRAINT {name} CHECK ({check}) NOT VALID",
            table = quote_qualified(&schema.name, &table.name),
            name = quote_ident(&self.constraint_name()),
        );
        execute(conn, "add check constraint", &sql).await?;

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
        let sql = format!(
            "ALTER TABLE {qualified} VALIDATE CONSTRAINT {name}",
            name = quote_ident(&self.constraint_name()),
        );
        execute(conn, "validate check constraint", &sql).await?;

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

//! Column type changes (an `alter_column` facet).

use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified};

use super::duplicate::{finalize_not_null_sql, Duplicator};
use super::triggers::{create_trigger, drop_trigger, TriggerConfig, TriggerDirection};
use super::{execute, temporary_name, trigger_name};

/// Changes the type of a column via a duplicated physical column.
///
/// Constructed by `alter_column`; not addressable from migration files on
/// its own.
#[derive(Debug, Clone, PartialEq)]
pub struct OpChangeType {
    /// Table name.
    pub table: String,
    /// Column name.
    pub column: String,
    /// New SQL type.
    pub sql_type: String,
    /// Old-shape to new-shape conversion.
    pub up: Option<String>,
    /// New-shape to old-shape conversion.
    pub down: Option<String>,
}

impl OpChangeType {
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
            column.sql_type = self.sql_type.clone();
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
        let old_type = column.sql_type.clone();
        let temp = temporary_name(&old_physical);

        Duplicator::new(&schema.name, &table, column)
            .with_type(&self.sql_type)
            .duplicate(conn)
            .await?;

        let up = self
            .up
            .clone()
            .unwrap_or_else(|| cast(&self.column, &self.sql_type));
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
        let down = self.down.clone().unwrap_or_else(|| cast(&self.column, &old_type));
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

fn cast(column: &str, sql_type: &str) -> String {
    format!("CAST({} AS {sql_type})", quote_ident(column))
}

//! The `drop_column` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified};

use super::triggers::{create_trigger, TriggerConfig, TriggerDirection};
use super::{execute, trigger_name};

/// Drops a column.
///
/// The column disappears from the new version view at Start but stays
/// physical until Complete. When a `down` expression is given, a down
/// trigger keeps the column populated for writes arriving through the new
/// view, so NOT NULL columns remain satisfiable during the transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpDropColumn {
    /// Table name.
    pub table: String,
    /// Column name.
    pub column: String,
    /// Expression computing the dropped column's value from the new row
    /// shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<String>,
}

impl OpDropColumn {
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
        if let Some(table) = schema.table_mut(&self.table) {
            table.remove_column(&self.column);
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

        self.update_schema(schema);

        if let Some(down) = &self.down {
            let physical = table
                .column(&self.column)
                .map_or_else(|| self.column.clone(), |c| c.name.clone());
            // expressions reference the remaining (new-shape) columns
            let remaining = &schema
                .table(&self.table)
                .ok_or_else(|| RollError::TableDoesNotExist {
                    name: self.table.clone(),
                })?
                .columns;
            create_trigger(
                conn,
                &TriggerConfig {
                    name: trigger_name(&self.table, &self.column),
                    direction: TriggerDirection::Down,
                    schema: &schema.name,
                    state_schema,
                    table: &table.name,
                    physical_column: &physical,
                    expression: down,
                    columns: remaining,
                },
            )
            .await?;
        }

        Ok(None)
    }

    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        super::triggers::drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &self.column))
            .await?;
        let sql = format!(
            "ALTER TABLE {table} DROP COLUMN IF EXISTS {column}",
            table = quote_qualified(schema, &self.table),
            column = quote_ident(&self.column),
        );
        execute(conn, "drop column", &sql).await
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        super::triggers::drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &self.column))
            .await
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
            "nickname",
            Column {
                name: "nickname".to_string(),
                sql_type: "text".to_string(),
                nullable: true,
                ..Column::default()
            },
        );
        schema.add_table("users", table);
        schema
    }

    #[test]
    fn test_update_schema_hides_the_column() {
        let mut schema = schema();
        let op = OpDropColumn {
            table: "users".to_string(),
            column: "nickname".to_string(),
            down: None,
        };
        op.validate(&schema).unwrap();
        op.update_schema(&mut schema);

        assert!(schema.table("users").unwrap().column("nickname").is_none());
    }

    #[test]
    fn test_validate_rejects_missing_column() {
        let op = OpDropColumn {
            table: "users".to_string(),
            column: "missing".to_string(),
            down: None,
        };
        let err = op.validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::ColumnDoesNotExist { .. }));
    }
}

//! The `drop_multicolumn_constraint` operation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified};

use super::duplicate::{finalize_not_null_sql, Duplicator};
use super::triggers::{create_trigger, drop_trigger, TriggerConfig, TriggerDirection};
use super::{execute, temporary_name, trigger_name};

/// Drops a constraint spanning several columns.
///
/// Works like `drop_constraint`, but duplicates every column the constraint
/// covers. The per-column up/down maps must provide a conversion for each
/// covered column; Complete derives the covered set from the map keys, so
/// the maps are required even for identity conversions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpDropMulticolumnConstraint {
    /// Table name.
    pub table: String,
    /// Constraint name.
    pub name: String,
    /// Per-column old-shape to new-shape conversions.
    pub up: HashMap<String, String>,
    /// Per-column new-shape to old-shape conversions.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub down: HashMap<String, String>,
}

impl OpDropMulticolumnConstraint {
    /// Covered columns in deterministic order.
    fn covered_columns(&self) -> Vec<&String> {
        let mut columns: Vec<&String> = self.up.keys().collect();
        columns.sort();
        columns
    }

    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        let table = schema.table(&self.table).ok_or_else(|| RollError::TableDoesNotExist {
            name: self.table.clone(),
        })?;
        let constraint =
            table
                .constraints
                .get(&self.name)
                .ok_or_else(|| RollError::ConstraintDoesNotExist {
                    table: self.table.clone(),
                    name: self.name.clone(),
                })?;
        for column in &constraint.columns {
            if !self.up.contains_key(column) {
                return Err(RollError::InvalidMigration(format!(
                    "missing up expression for covered column {column:?}",
                )));
            }
        }
        for column in self.up.keys().chain(self.down.keys()) {
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
            for name in self.up.keys() {
                if let Some(column) = table.column_mut(name) {
                    column.name = temporary_name(&column.name);
                    column.transient = true;
                }
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

        let mut temps = Vec::new();
        for visible in self.covered_columns() {
            let column = table
                .column(visible)
                .ok_or_else(|| RollError::ColumnDoesNotExist {
                    table: self.table.clone(),
                    column: visible.clone(),
                })?;
            Duplicator::new(&schema.name, &table, column)
                .without_constraint(&self.name)
                .duplicate(conn)
                .await?;
            temps.push((visible.clone(), column.name.clone(), temporary_name(&column.name)));
        }

        for (visible, _, temp) in &temps {
            let up = self
                .up
                .get(visible)
                .cloned()
                .unwrap_or_else(|| quote_ident(visible));
            create_trigger(
                conn,
                &TriggerConfig {
                    name: trigger_name(&self.table, temp),
                    direction: TriggerDirection::Up,
                    schema: &schema.name,
                    state_schema,
                    table: &table.name,
                    physical_column: temp,
                    expression: &up,
                    columns: &table.columns,
                },
            )
            .await?;
        }

        self.update_schema(schema);

        let new_table = schema
            .table(&self.table)
            .ok_or_else(|| RollError::TableDoesNotExist {
                name: self.table.clone(),
            })?
            .clone();
        for (visible, old_physical, _) in &temps {
            let down = self
                .down
                .get(visible)
                .cloned()
                .unwrap_or_else(|| quote_ident(visible));
            create_trigger(
                conn,
                &TriggerConfig {
                    name: trigger_name(&self.table, old_physical),
                    direction: TriggerDirection::Down,
                    schema: &schema.name,
                    state_schema,
                    table: &new_table.name,
                    physical_column: old_physical,
                    expression: &down,
                    columns: &new_table.columns,
                },
            )
            .await?;
        }

        let task_columns = temps.into_iter().map(|(_, _, temp)| temp).collect();
        Ok(Some(backfill::Task::new(&new_table, task_columns)?))
    }

    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let qualified = quote_qualified(schema, &self.table);
        for visible in self.covered_columns() {
            let temp = temporary_name(visible);
            drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &temp)).await?;
            drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, visible)).await?;

            // dropping the last covered column drops the constraint itself
            let sql = format!(
                "ALTER TABLE {qualified} DROP COLUMN IF EXISTS {column}",
                column = quote_ident(visible),
            );
            execute(conn, "drop old column", &sql).await?;

            let sql = format!(
                "ALTER TABLE {qualified} RENAME COLUMN {temp} TO {column}",
                temp = quote_ident(&temp),
                column = quote_ident(visible),
            );
            execute(conn, "promote column", &sql).await?;

            execute(conn, "set not null", &finalize_not_null_sql(schema, &self.table, visible)).await?;
        }
        Ok(())
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        for visible in self.covered_columns() {
            let temp = temporary_name(visible);
            drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &temp)).await?;
            drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, visible)).await?;

            let sql = format!(
                "ALTER TABLE {table} DROP COLUMN IF EXISTS {column}",
                table = quote_qualified(schema, &self.table),
                column = quote_ident(&temp),
            );
            execute(conn, "drop duplicated column", &sql).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Constraint, ConstraintKind, Table};

    fn schema() -> Schema {
        let mut schema = Schema::new("public");
        let mut table = Table::new("bookings");
        for name in ["room", "day"] {
            table.add_column(
                name,
                Column {
                    name: name.to_string(),
                    sql_type: "text".to_string(),
                    ..Column::default()
                },
            );
        }
        table.constraints.insert(
            "bookings_room_day_key".to_string(),
            Constraint {
                name: "bookings_room_day_key".to_string(),
                kind: ConstraintKind::Unique,
                columns: vec!["room".to_string(), "day".to_string()],
                definition: Some("UNIQUE (room, day)".to_string()),
            },
        );
        schema.add_table("bookings", table);
        schema
    }

    fn op() -> OpDropMulticolumnConstraint {
        let mut up = HashMap::new();
        up.insert("room".to_string(), "room".to_string());
        up.insert("day".to_string(), "day".to_string());
        OpDropMulticolumnConstraint {
            table: "bookings".to_string(),
            name: "bookings_room_day_key".to_string(),
            up,
            down: HashMap::new(),
        }
    }

    #[test]
    fn test_validate_requires_up_for_every_covered_column() {
        op().validate(&schema()).unwrap();

        let mut bad = op();
        bad.up.remove("day");
        let err = bad.validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::InvalidMigration(_)));
    }

    #[test]
    fn test_update_schema_duplicates_covered_columns() {
        let mut schema = schema();
        op().update_schema(&mut schema);

        let table = schema.table("bookings").unwrap();
        assert_eq!(table.column("room").unwrap().name, "_pgroll_new_room");
        assert_eq!(table.column("day").unwrap().name, "_pgroll_new_day");
        assert!(table.constraints.is_empty());
    }
}

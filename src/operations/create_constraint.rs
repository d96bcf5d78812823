//! The `create_constraint` operation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::{Constraint, ConstraintKind, Schema};
use crate::sql::{quote_ident, quote_qualified, rewrite_column_refs};

use super::duplicate::{finalize_not_null_sql, Duplicator};
use super::triggers::{create_trigger, drop_trigger, TriggerConfig, TriggerDirection};
use super::{ensure_unreserved, execute, temp_index_name, temporary_name, trigger_name};

/// Kind of constraint a `create_constraint` adds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintType {
    /// UNIQUE over the listed columns.
    Unique,
    /// CHECK over the listed columns.
    Check,
    /// FOREIGN KEY over the listed columns.
    ForeignKey,
}

/// Reference for a multi-column foreign key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableReference {
    /// Referenced table.
    pub table: String,
    /// Referenced columns, matching the constrained columns in order.
    pub columns: Vec<String>,
    /// ON DELETE action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
}

/// Adds a multi-column constraint.
///
/// Every covered column is duplicated and converted through per-column
/// up/down expressions, so rows that would violate the new constraint can
/// be rewritten on their way in. A UNIQUE constraint is built as a
/// concurrent unique index at Start and attached at Complete; CHECK and
/// FOREIGN KEY constraints go in NOT VALID and are validated at Complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpCreateConstraint {
    /// Table name.
    pub table: String,
    /// Constraint name.
    pub name: String,
    /// Constraint kind.
    #[serde(rename = "type")]
    pub kind: ConstraintType,
    /// Covered columns.
    pub columns: Vec<String>,
    /// CHECK expression, for check constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    /// Reference, for foreign keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<TableReference>,
    /// Per-column old-shape to new-shape conversions.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub up: HashMap<String, String>,
    /// Per-column new-shape to old-shape conversions.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub down: HashMap<String, String>,
}

impl OpCreateConstraint {
    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        ensure_unreserved(&self.name)?;
        let table = schema.table(&self.table).ok_or_else(|| RollError::TableDoesNotExist {
            name: self.table.clone(),
        })?;
        if table.constraints.contains_key(&self.name) {
            return Err(RollError::InvalidMigration(format!(
                "constraint {:?} already exists on table {:?}",
                self.name, self.table,
            )));
        }
        for column in &self.columns {
            if table.column(column).is_none() {
                return Err(RollError::ColumnDoesNotExist {
                    table: self.table.clone(),
                    column: column.clone(),
                });
            }
        }
        match self.kind {
            ConstraintType::Check if self.check.is_none() => {
                return Err(RollError::InvalidMigration(
                    "check constraint requires a check expression".to_string(),
                ));
            }
            ConstraintType::ForeignKey if self.references.is_none() => {
                return Err(RollError::InvalidMigration(
                    "foreign key constraint requires references".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        if let Some(table) = schema.table_mut(&self.table) {
            for name in &self.columns {
                if let Some(column) = table.column_mut(name) {
                    column.name = temporary_name(&column.name);
                    column.transient = true;
                }
            }
            table.constraints.insert(
                self.name.clone(),
                Constraint {
                    name: self.name.clone(),
                    kind: match self.kind {
                        ConstraintType::Unique => ConstraintKind::Unique,
                        ConstraintType::Check => ConstraintKind::Check,
                        ConstraintType::ForeignKey => ConstraintKind::ForeignKey,
                    },
                    columns: self.columns.clone(),
                    definition: None,
                },
            );
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

        let mut temps = Vec::with_capacity(self.columns.len());
        for name in &self.columns {
            let column = table
                .column(name)
                .ok_or_else(|| RollError::ColumnDoesNotExist {
                    table: self.table.clone(),
                    column: name.clone(),
                })?;
            Duplicator::new(&schema.name, &table, column).duplicate(conn).await?;
            temps.push((name.clone(), column.name.clone(), temporary_name(&column.name)));
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

        let qualified = quote_qualified(&schema.name, &table.name);
        let temp_columns = temps
            .iter()
            .map(|(_, _, temp)| quote_ident(temp))
            .collect::<Vec<_>>()
            .join(", ");

        match self.kind {
            ConstraintType::Unique => {
                let sql = format!(
                    "CREATE UNIQUE INDEX CONCURRENTLY IF NOT EXISTS {index} ON {qualified} ({temp_columns})",
                    index = quote_ident(&temp_index_name(&self.name)),
                );
                execute(conn, "create unique index", &sql).await?;
            }
            ConstraintType::Check => {
                // validated earlier
                let mut check = self.check.clone().unwrap_or_default();
                for (visible, _, temp) in &temps {
                    check = rewrite_column_refs(&check, visible, temp)?;
                }
                let sql = format!(
                    "ALTER TABLE {qualified} ADD CONSTRAINT {name} CHECK ({check}) NOT VALID",
                    name = quote_ident(&self.name),
                );
                execute(conn, "add check constraint", &sql).await?;
            }
            ConstraintType::ForeignKey => {
                let references = self.references.as_ref().ok_or_else(|| {
                    RollError::InvalidMigration(
                        "foreign key constraint requires references".to_string(),
                    )
                })?;
                let ref_physical = schema
                    .table(&references.table)
                    .map_or_else(|| references.table.clone(), |t| t.name.clone());
                let ref_columns = references
                    .columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut sql = format!(
                    "ALTER TABLE {qualified} ADD CONSTRAINT {name} FOREIGN KEY ({temp_columns}) REFERENCES {ref_table} ({ref_columns})",
                    name = quote_ident(&self.name),
                    ref_table = quote_qualified(&schema.name, &ref_physical),
                );
                if let Some(on_delete) = &references.on_delete {
                    sql.push_str(&format!(" ON DELETE {on_delete}"));
                }
                sql.push_str(" NOT VALID");
                execute(conn, "add foreign key", &sql).await?;
            }
        }

        let task_columns = temps.into_iter().map(|(_, _, temp)| temp).collect();
        Ok(Some(backfill::Task::new(&new_table, task_columns)?))
    }

    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let qualified = quote_qualified(schema, &self.table);

        for visible in &self.columns {
            let temp = temporary_name(visible);
            drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &temp)).await?;
            drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, visible)).await?;

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

        match self.kind {
            ConstraintType::Unique => {
                let sql = format!(
                    "ALTER TABLE {qualified} ADD CONSTRAINT {name} UNIQUE USING INDEX {index}",
                    name = quote_ident(&self.name),
                    index = quote_ident(&temp_index_name(&self.name)),
                );
                execute(conn, "attach unique constraint", &sql).await
            }
            ConstraintType::Check | ConstraintType::ForeignKey => {
                let sql = format!(
                    "ALTER TABLE {qualified} VALIDATE CONSTRAINT {name}",
                    name = quote_ident(&self.name),
                );
                execute(conn, "validate constraint", &sql).await
            }
        }
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        for visible in &self.columns {
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

        if self.kind == ConstraintType::Unique {
            let sql = format!(
                "DROP INDEX CONCURRENTLY IF EXISTS {index}",
                index = quote_qualified(schema, &temp_index_name(&self.name)),
            );
            execute(conn, "drop unique index", &sql).await?;
        }
        Ok(())
    }

    pub(crate) fn transactional(&self) -> bool {
        self.kind != ConstraintType::Unique
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Table};

    fn schema() -> Schema {
        let mut schema = Schema::new("public");
        let mut table = Table::new("users");
        for name in ["id", "first_name", "last_name"] {
            table.add_column(
                name,
                Column {
                    name: name.to_string(),
                    sql_type: "text".to_string(),
                    nullable: true,
                    ..Column::default()
                },
            );
        }
        table.primary_key = vec!["id".to_string()];
        schema.add_table("users", table);
        schema
    }

    fn op() -> OpCreateConstraint {
        OpCreateConstraint {
            table: "users".to_string(),
            name: "users_name_unique".to_string(),
            kind: ConstraintType::Unique,
            columns: vec!["first_name".to_string(), "last_name".to_string()],
            check: None,
            references: None,
            up: HashMap::new(),
            down: HashMap::new(),
        }
    }

    #[test]
    fn test_validate_kind_requirements() {
        op().validate(&schema()).unwrap();

        let mut check = op();
        check.kind = ConstraintType::Check;
        let err = check.validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::InvalidMigration(_)));

        let mut fk = op();
        fk.kind = ConstraintType::ForeignKey;
        let err = fk.validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::InvalidMigration(_)));
    }

    #[test]
    fn test_update_schema_duplicates_every_covered_column() {
        let mut schema = schema();
        op().update_schema(&mut schema);

        let table = schema.table("users").unwrap();
        assert_eq!(table.column("first_name").unwrap().name, "_pgroll_new_first_name");
        assert_eq!(table.column("last_name").unwrap().name, "_pgroll_new_last_name");
        assert_eq!(table.column("id").unwrap().name, "id");
        assert!(table.constraints.contains_key("users_name_unique"));
    }

    #[test]
    fn test_unique_constraints_start_outside_transactions() {
        assert!(!op().transactional());

        let mut check = op();
        check.kind = ConstraintType::Check;
        check.check = Some("first_name <> last_name".to_string());
        assert!(check.transactional());
    }
}

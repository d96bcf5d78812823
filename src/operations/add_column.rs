//! The `add_column` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::{Column, Schema};
use crate::sql::{quote_ident, quote_literal, quote_qualified, rewrite_column_refs};

use super::create_table::ColumnDef;
use super::triggers::{create_trigger, drop_trigger, TriggerConfig, TriggerDirection};
use super::{ensure_unreserved, execute, not_null_constraint_name, temporary_name, trigger_name};

/// Adds a column to an existing table.
///
/// The column is added under a transient physical name. A NOT NULL
/// requirement becomes a NOT VALID check until Complete so existing rows do
/// not block the Start. When an `up` expression is given, an up trigger
/// computes the value for writes arriving through older versions and a
/// backfill fills existing rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpAddColumn {
    /// Table name.
    pub table: String,
    /// Expression computing the new column's value from the old row shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<String>,
    /// Definition of the new column.
    pub column: ColumnDef,
}

impl OpAddColumn {
    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        ensure_unreserved(&self.column.name)?;
        let table = schema.table(&self.table).ok_or_else(|| RollError::TableDoesNotExist {
            name: self.table.clone(),
        })?;
        if table.column(&self.column.name).is_some() {
            return Err(RollError::ColumnAlreadyExists {
                table: self.table.clone(),
                column: self.column.name.clone(),
            });
        }
        if self.column.pk {
            return Err(RollError::InvalidMigration(
                "cannot add a primary key column to an existing table".to_string(),
            ));
        }
        if !self.column.nullable && self.column.default.is_none() && self.up.is_none() {
            return Err(RollError::InvalidMigration(format!(
                "adding NOT NULL column {:?} requires a default or an up expression",
                self.column.name,
            )));
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        if let Some(table) = schema.table_mut(&self.table) {
            table.add_column(
                self.column.name.clone(),
                Column {
                    name: temporary_name(&self.column.name),
                    sql_type: self.column.sql_type.clone(),
                    nullable: self.column.nullable,
                    default: self.column.default.clone(),
                    comment: self.column.comment.clone(),
                    transient: true,
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
        let temp = temporary_name(&self.column.name);
        let qualified = quote_qualified(&schema.name, &table.name);

        let mut sql = format!(
            "ALTER TABLE {qualified} ADD COLUMN IF NOT EXISTS {name} {sql_type}",
            name = quote_ident(&temp),
            sql_type = self.column.sql_type,
        );
        if let Some(default) = &self.column.default {
            sql.push_str(&format!(" DEFAULT {default}"));
        }
        if self.column.unique {
            sql.push_str(&format!(
                " CONSTRAINT {} UNIQUE",
                quote_ident(&format!("{}_{}_key", self.table, self.column.name)),
            ));
        }
        if let Some(check) = &self.column.check {
            let check = rewrite_column_refs(check, &self.column.name, &temp)?;
            sql.push_str(&format!(" CHECK ({check})"));
        }
        execute(conn, "add column", &sql).await?;

        if !self.column.nullable {
            let sql = format!(
                "ALTER TABLE {qualified} ADD CONSTRAINT {name} CHECK ({column} IS NOT NULL) NOT VALID",
                name = quote_ident(&not_null_constraint_name(&self.column.name)),
                column = quote_ident(&temp),
            );
            execute(conn, "add not null", &sql).await?;
        }

        if let Some(references) = &self.column.references {
            let physical = schema
                .table(&references.table)
                .map_or_else(|| references.table.clone(), |t| t.name.clone());
            let mut sql = format!(
                "ALTER TABLE {qualified} ADD CONSTRAINT {name} FOREIGN KEY ({column}) REFERENCES {ref_table} ({ref_column})",
                name = quote_ident(&references.constraint_name(&self.table, &self.column.name)),
                column = quote_ident(&temp),
                ref_table = quote_qualified(&schema.name, &physical),
                ref_column = quote_ident(&references.column),
            );
            if let Some(on_delete) = &references.on_delete {
                sql.push_str(&format!(" ON DELETE {on_delete}"));
            }
            sql.push_str(" NOT VALID");
            execute(conn, "add foreign key", &sql).await?;
        }

        if let Some(comment) = &self.column.comment {
            let sql = format!(
                "COMMENT ON COLUMN {qualified}.{column} IS {comment}",
                column = quote_ident(&temp),
                comment = quote_literal(comment),
            );
            execute(conn, "comment on column", &sql).await?;
        }

        let task = if let Some(up) = &self.up {
            create_trigger(
                conn,
                &TriggerConfig {
                    name: trigger_name(&self.table, &temp),
                    direction: TriggerDirection::Up,
                    schema: &schema.name,
                    state_schema,
                    table: &table.name,
                    physical_column: &temp,
                    expression: up,
                    columns: &table.columns,
                },
            )
            .await?;
            Some(backfill::Task::new(&table, vec![temp])?)
        } else {
            None
        };

        self.update_schema(schema);
        Ok(task)
    }

    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let temp = temporary_name(&self.column.name);
        if self.up.is_some() {
            drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &temp)).await?;
        }

        let qualified = quote_qualified(schema, &self.table);
        let sql = format!(
            "ALTER TABLE {qualified} RENAME COLUMN {temp} TO {name}",
            temp = quote_ident(&temp),
            name = quote_ident(&self.column.name),
        );
        execute(conn, "rename column", &sql).await?;

        if !self.column.nullable {
            let sql = super::duplicate::finalize_not_null_sql(schema, &self.table, &self.column.name);
            execute(conn, "set not null", &sql).await?;
        }

        if let Some(references) = &self.column.references {
            let sql = format!(
                "ALTER TABLE {qualified} VALIDATE CONSTRAINT {name}",
                name = quote_ident(&references.constraint_name(&self.table, &self.column.name)),
            );
            execute(conn, "validate foreign key", &sql).await?;
        }

        Ok(())
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let temp = temporary_name(&self.column.name);
        if self.up.is_some() {
            drop_trigger(conn, schema, &self.table, &trigger_name(&self.table, &temp)).await?;
        }
        let sql = format!(
            "ALTER TABLE {table} DROP COLUMN IF EXISTS {column}",
            table = quote_qualified(schema, &self.table),
            column = quote_ident(&temp),
        );
        execute(conn, "drop column", &sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Table;

    fn schema() -> Schema {
        let mut schema = Schema::new("public");
        let mut table = Table::new("users");
        table.add_column(
            "id",
            Column {
                name: "id".to_string(),
                sql_type: "bigint".to_string(),
                ..Column::default()
            },
        );
        table.primary_key = vec!["id".to_string()];
        schema.add_table("users", table);
        schema
    }

    fn op(nullable: bool, up: Option<&str>) -> OpAddColumn {
        OpAddColumn {
            table: "users".to_string(),
            up: up.map(str::to_string),
            column: ColumnDef {
                name: "email".to_string(),
                sql_type: "text".to_string(),
                pk: false,
                unique: false,
                nullable,
                default: None,
                check: None,
                references: None,
                comment: None,
            },
        }
    }

    #[test]
    fn test_validate_not_null_requires_fill_source() {
        let err = op(false, None).validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::InvalidMigration(_)));

        op(false, Some("''")).validate(&schema()).unwrap();
        op(true, None).validate(&schema()).unwrap();
    }

    #[test]
    fn test_update_schema_adds_transient_column() {
        let mut schema = schema();
        op(true, None).update_schema(&mut schema);

        let column = schema.table("users").unwrap().column("email").unwrap();
        assert_eq!(column.name, "_pgroll_new_email");
        assert!(column.transient);
    }

    #[test]
    fn test_validate_rejects_duplicate_column() {
        let mut schema = schema();
        op(true, None).update_schema(&mut schema);

        let err = op(true, None).validate(&schema).unwrap_err();
        assert!(matches!(err, RollError::ColumnAlreadyExists { .. }));
    }
}

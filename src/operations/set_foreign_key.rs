//! Adding a foreign key to a column (an `alter_column` facet).

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified};

use super::duplicate::{finalize_not_null_sql, Duplicator};
use super::triggers::{create_trigger, drop_trigger, TriggerConfig, TriggerDirection};
use super::{execute, temporary_name, trigger_name};

/// Reference from a column to a column of another table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnReference {
    /// Constraint name; derived from table and column when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Referenced table.
    pub table: String,
    /// Referenced column.
    pub column: String,
    /// ON DELETE action (CASCADE, RESTRICT, SET NULL, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
}

impl ColumnReference {
    /// The constraint name to use for this reference.
    #[must_use]
    pub fn constraint_name(&self, table: &str, column: &str) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{table}_{column}_fkey"))
    }
}

/// Sets a foreign key on a column via a duplicated physical column.
///
/// The constraint is created NOT VALID at Start and validated at Complete,
/// so existing rows are never scanned under an exclusive lock.
#[derive(Debug, Clone, PartialEq)]
pub struct OpSetForeignKey {
    /// Table name.
    pub table: String,
    /// Column name.
    pub column: String,
    /// The reference to add.
    pub references: ColumnReference,
    /// Old-shape to new-shape conversion.
    pub up: Option<String>,
    /// New-shape to old-shape conversion.
    pub down: Option<String>,
}

impl OpSetForeignKey {
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
        let referenced =
            schema
                .table(&self.references.table)
                .ok_or_else(|| RollError::TableDoesNotExist {
                    name: self.references.table.clone(),
                })?;
        if referenced.column(&self.references.column).is_none() {
            return Err(RollError::ColumnDoesNotExist {
                table: self.references.table.clone(),
                column: self.references.column.clone(),
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

        let ref_physical = schema
            .table(&self.references.table)
            .map_or_else(|| self.references.table.clone(), |t| t.name.clone());
        let mut sql = format!(
            "ALTER TABLE {table} ADD CONSTRAINT {name} FOREIGN KEY ({column}) REFERENCES {ref_table} ({ref_column})",
            table = quote_qualified(&schema.name, &table.name),
            name = quote_ident(&self.references.constraint_name(&self.table, &self.column)),
            column = quote_ident(&temp),
            ref_table = quote_qualified(&schema.name, &ref_physical),
            ref_column = quote_ident(&self.references.column),
        );
        if let Some(on_delete) = &self.references.on_delete {
            sql.push_str(&format!(" ON DELETE {on_delete}"));
        }
        sql.push_str(" NOT VALID");
        execute(conn, "add foreign key", &sql).await?;

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
            name = quote_ident(&self.references.constraint_name(&self.table, &self.column)),
        );
        execute(conn, "validate foreign key", &sql).await?;

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
    use crate::schema::{Column, Table};

    fn schema() -> Schema {
        let mut schema = Schema::new("public");
        let mut users = Table::new("users");
        users.add_column(
            "id",
            Column {
                name: "id".to_string(),
                sql_type: "bigint".to_string(),
                ..Column::default()
            },
        );
        users.primary_key = vec!["id".to_string()];
        schema.add_table("users", users);

        let mut posts = Table::new("posts");
        posts.add_column(
            "id",
            Column {
                name: "id".to_string(),
                sql_type: "bigint".to_string(),
                ..Column::default()
            },
        );
        posts.add_column(
            "author_id",
            Column {
                name: "author_id".to_string(),
                sql_type: "bigint".to_string(),
                nullable: true,
                ..Column::default()
            },
        );
        posts.primary_key = vec!["id".to_string()];
        schema.add_table("posts", posts);
        schema
    }

    fn op() -> OpSetForeignKey {
        OpSetForeignKey {
            table: "posts".to_string(),
            column: "author_id".to_string(),
            references: ColumnReference {
                name: None,
                table: "users".to_string(),
                column: "id".to_string(),
                on_delete: None,
            },
            up: None,
            down: None,
        }
    }

    #[test]
    fn test_validate_requires_referenced_column() {
        op().validate(&schema()).unwrap();

        let mut bad = op();
        bad.references.column = "missing".to_string();
        let err = bad.validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::ColumnDoesNotExist { .. }));
    }

    #[test]
    fn test_constraint_name_defaults_to_table_column() {
        let op = op();
        assert_eq!(
            op.references.constraint_name(&op.table, &op.column),
            "posts_author_id_fkey"
        );
    }
}

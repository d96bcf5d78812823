//! The `create_table` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::{Column, Schema, Table};
use crate::sql::{quote_ident, quote_literal, quote_qualified};

use super::{ensure_unreserved, execute, temporary_name};

/// A column definition inside `create_table` and `add_column`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// SQL type.
    #[serde(rename = "type")]
    pub sql_type: String,
    /// Part of the primary key.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pk: bool,
    /// Unique column.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
    /// Accepts NULL. Columns are NOT NULL unless this is set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub nullable: bool,
    /// Default expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// CHECK expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    /// Foreign key reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<super::set_foreign_key::ColumnReference>,
    /// Column comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Creates a new table.
///
/// The table is created under a transient physical name at Start so a failed
/// migration can be rolled back without touching user-visible names; Complete
/// renames it into place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpCreateTable {
    /// Table name.
    pub name: String,
    /// Column definitions, in order.
    pub columns: Vec<ColumnDef>,
}

impl OpCreateTable {
    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        ensure_unreserved(&self.name)?;
        if schema.table(&self.name).is_some() {
            return Err(RollError::TableAlreadyExists {
                name: self.name.clone(),
            });
        }
        for column in &self.columns {
            ensure_unreserved(&column.name)?;
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        let mut table = Table::new(temporary_name(&self.name));
        for column in &self.columns {
            if column.pk {
                table.primary_key.push(column.name.clone());
            }
            table.add_column(
                column.name.clone(),
                Column {
                    name: column.name.clone(),
                    sql_type: column.sql_type.clone(),
                    nullable: column.nullable && !column.pk,
                    default: column.default.clone(),
                    comment: column.comment.clone(),
                    transient: false,
                },
            );
        }
        schema.add_table(self.name.clone(), table);
    }

    pub(crate) async fn start(
        &self,
        conn: &mut PgConnection,
        _state_schema: &str,
        schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        let physical = quote_qualified(&schema.name, &temporary_name(&self.name));

        let mut clauses: Vec<String> = Vec::with_capacity(self.columns.len() + 1);
        let mut primary_key: Vec<String> = Vec::new();
        for column in &self.columns {
            clauses.push(self.column_clause(schema, column));
            if column.pk {
                primary_key.push(quote_ident(&column.name));
            }
        }
        if !primary_key.is_empty() {
            // name the constraint after the final table, not the transient one
            clauses.push(format!(
                "CONSTRAINT {name} PRIMARY KEY ({columns})",
                name = quote_ident(&format!("{}_pkey", self.name)),
                columns = primary_key.join(", "),
            ));
        }

        let sql = format!("CREATE TABLE {physical} ({})", clauses.join(", "));
        execute(conn, "create table", &sql).await?;

        for column in &self.columns {
            if let Some(comment) = &column.comment {
                let sql = format!(
                    "COMMENT ON COLUMN {physical}.{column} IS {comment}",
                    column = quote_ident(&column.name),
                    comment = quote_literal(comment),
                );
                execute(conn, "comment on column", &sql).await?;
            }
        }

        self.update_schema(schema);
        Ok(None)
    }

    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {physical} RENAME TO {name}",
            physical = quote_qualified(schema, &temporary_name(&self.name)),
            name = quote_ident(&self.name),
        );
        execute(conn, "rename table", &sql).await
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let sql = format!(
            "DROP TABLE IF EXISTS {physical}",
            physical = quote_qualified(schema, &temporary_name(&self.name)),
        );
        execute(conn, "drop table", &sql).await
    }

    fn column_clause(&self, schema: &Schema, column: &ColumnDef) -> String {
        let mut clause = format!("{} {}", quote_ident(&column.name), column.sql_type);
        if let Some(default) = &column.default {
            clause.push_str(&format!(" DEFAULT {default}"));
        }
        if !column.nullable && !column.pk {
            clause.push_str(" NOT NULL");
        }
        if column.unique {
            clause.push_str(&format!(
                " CONSTRAINT {} UNIQUE",
                quote_ident(&format!("{}_{}_key", self.name, column.name)),
            ));
        }
        if let Some(check) = &column.check {
            clause.push_str(&format!(
                " CONSTRAINT {} CHECK ({check})",
                quote_ident(&format!("{}_{}_check", self.name, column.name)),
            ));
        }
        if let Some(references) = &column.references {
            // resolve through the snapshot so a table created earlier in the
            // same migration is referenced by its transient physical name
            let physical = schema
                .table(&references.table)
                .map_or_else(|| references.table.clone(), |t| t.name.clone());
            clause.push_str(&format!(
                " CONSTRAINT {name} REFERENCES {table} ({ref_column})",
                name = quote_ident(&references.constraint_name(&self.name, &column.name)),
                table = quote_qualified(&schema.name, &physical),
                ref_column = quote_ident(&references.column),
            ));
            if let Some(on_delete) = &references.on_delete {
                clause.push_str(&format!(" ON DELETE {on_delete}"));
            }
        }
        clause
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op() -> OpCreateTable {
        OpCreateTable {
            name: "users".to_string(),
            columns: vec![
                ColumnDef {
                    name: "id".to_string(),
                    sql_type: "serial".to_string(),
                    pk: true,
                    unique: false,
                    nullable: false,
                    default: None,
                    check: None,
                    references: None,
                    comment: None,
                },
                ColumnDef {
                    name: "name".to_string(),
                    sql_type: "text".to_string(),
                    pk: false,
                    unique: true,
                    nullable: false,
                    default: None,
                    check: None,
                    references: None,
                    comment: None,
                },
            ],
        }
    }

    #[test]
    fn test_validate_rejects_existing_table() {
        let mut schema = Schema::new("public");
        schema.add_table("users", Table::new("users"));

        let err = op().validate(&schema).unwrap_err();
        assert!(matches!(err, RollError::TableAlreadyExists { name } if name == "users"));
    }

    #[test]
    fn test_validate_rejects_reserved_names() {
        let op = OpCreateTable {
            name: "_pgroll_new_users".to_string(),
            columns: Vec::new(),
        };
        let err = op.validate(&Schema::new("public")).unwrap_err();
        assert!(matches!(err, RollError::ReservedName { .. }));
    }

    #[test]
    fn test_update_schema_registers_transient_physical_name() {
        let mut schema = Schema::new("public");
        op().update_schema(&mut schema);

        let table = schema.table("users").unwrap();
        assert_eq!(table.name, "_pgroll_new_users");
        assert_eq!(table.primary_key, vec!["id".to_string()]);
        assert_eq!(table.column("name").unwrap().name, "name");
        assert!(!table.column("id").unwrap().nullable);
    }

    #[test]
    fn test_column_clause_names_constraints_after_the_final_table() {
        let schema = Schema::new("public");
        let op = op();
        let clause = op.column_clause(&schema, &op.columns[1]);
        assert_eq!(clause, "\"name\" text NOT NULL CONSTRAINT \"users_name_key\" UNIQUE");
    }
}

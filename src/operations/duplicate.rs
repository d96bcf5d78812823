//! Duplication of physical columns.
//!
//! Structural column changes never touch the original column in place.
//! Instead a `_pgroll_new_` duplicate is added next to it, carrying the new
//! type and (as NOT VALID constraints) the original's obligations, so the
//! table stays fully usable while the duplicate is backfilled and both
//! shapes are live. Complete later promotes the duplicate; Rollback drops
//! it.

use sqlx::postgres::PgConnection;

use crate::error::Result;
use crate::schema::{Column, ConstraintKind, Table};
use crate::sql::{quote_ident, quote_qualified, rewrite_column_refs};

use super::{execute, not_null_constraint_name, temporary_name};

/// Builder that duplicates one column of a table.
pub(crate) struct Duplicator<'a> {
    schema: &'a str,
    table: &'a Table,
    column: &'a Column,
    as_type: Option<String>,
    without_constraint: Option<String>,
}

impl<'a> Duplicator<'a> {
    /// Creates a duplicator for the given column.
    #[must_use]
    pub(crate) fn new(schema: &'a str, table: &'a Table, column: &'a Column) -> Self {
        Self {
            schema,
            table,
            column,
            as_type: None,
            without_constraint: None,
        }
    }

    /// Gives the duplicate a different SQL type.
    #[must_use]
    pub(crate) fn with_type(mut self, sql_type: impl Into<String>) -> Self {
        self.as_type = Some(sql_type.into());
        self
    }

    /// Skips one named constraint when carrying constraints over.
    #[must_use]
    pub(crate) fn without_constraint(mut self, name: impl Into<String>) -> Self {
        self.without_constraint = Some(name.into());
        self
    }

    /// Creates the duplicate column and its carried-over constraints.
    pub(crate) async fn duplicate(&self, conn: &mut PgConnection) -> Result<()> {
        let duplicate = temporary_name(&self.column.name);
        let sql_type = self.as_type.as_deref().unwrap_or(&self.column.sql_type);
        let table = quote_qualified(self.schema, &self.table.name);

        let mut sql = format!(
            "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {name} {sql_type}",
            name = quote_ident(&duplicate),
        );
        if let Some(default) = &self.column.default {
            sql.push_str(&format!(" DEFAULT {default}"));
        }
        execute(conn, "duplicate column", &sql).await?;

        // A NOT NULL original becomes a NOT VALID check on the duplicate;
        // Complete validates it and swaps it for a real NOT NULL once the
        // backfill has filled every row.
        if !self.column.nullable {
            let sql = format!(
                "ALTER TABLE {table} ADD CONSTRAINT {name} CHECK ({column} IS NOT NULL) NOT VALID",
                name = quote_ident(&not_null_constraint_name(&self.column.name)),
                column = quote_ident(&duplicate),
            );
            execute(conn, "duplicate not null", &sql).await?;
        }

        // Carry over single-column CHECK and FOREIGN KEY constraints, each
        // rewritten onto the duplicate and added NOT VALID.
        for (name, constraint) in &self.table.constraints {
            if Some(name.as_str()) == self.without_constraint.as_deref() {
                continue;
            }
            if !matches!(constraint.kind, ConstraintKind::Check | ConstraintKind::ForeignKey) {
                continue;
            }
            if constraint.columns.len() != 1 || constraint.columns[0] != self.column.name {
                continue;
            }
            let Some(definition) = &constraint.definition else {
                continue;
            };

            let definition = rewrite_column_refs(definition, &self.column.name, &duplicate)?;
            let sql = format!(
                "ALTER TABLE {table} ADD CONSTRAINT {name} {definition} NOT VALID",
                name = quote_ident(&temporary_name(name)),
            );
            execute(conn, "duplicate constraint", &sql).await?;
        }

        Ok(())
    }
}

/// SQL that promotes a duplicate's NOT VALID not-null check into a real NOT
/// NULL on the renamed column, when the original column carried one. Runs
/// inside Complete's transaction; a DO block keeps it a no-op for columns
/// that were nullable to begin with.
#[must_use]
pub(crate) fn finalize_not_null_sql(schema: &str, table: &str, column: &str) -> String {
    let constraint = not_null_constraint_name(column);
    let alter = quote_qualified(schema, table).replace('\'', "''");
    format!(
        "DO $$\n\
         BEGIN\n\
         \x20 IF EXISTS (\n\
         \x20   SELECT 1 FROM pg_constraint c\n\
         \x20   JOIN pg_class t ON t.oid = c.conrelid\n\
         \x20   JOIN pg_namespace n ON n.oid = t.relnamespace\n\
         \x20   WHERE n.nspname = {schema_lit} AND t.relname = {table_lit} AND c.conname = {constraint_lit}\n\
         \x20 ) THEN\n\
         \x20   EXECUTE 'ALTER TABLE {alter} VALIDATE CONSTRAINT {constraint_q}';\n\
         \x20   EXECUTE 'ALTER TABLE {alter} ALTER COLUMN {column_q} SET NOT NULL';\n\
         \x20   EXECUTE 'ALTER TABLE {alter} DROP CONSTRAINT {constraint_q}';\n\
         \x20 END IF;\n\
         END $$",
        schema_lit = crate::sql::quote_literal(schema),
        table_lit = crate::sql::quote_literal(table),
        constraint_lit = crate::sql::quote_literal(&constraint),
        constraint_q = quote_ident(&constraint).replace('\'', "''"),
        column_q = quote_ident(column).replace('\'', "''"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_not_null_checks_for_the_marker_constraint() {
        let sql = finalize_not_null_sql("public", "users", "age");
        assert!(sql.contains("c.conname = '_pgroll_check_not_null_age'"));
        assert!(sql.contains("VALIDATE CONSTRAINT \"_pgroll_check_not_null_age\""));
        assert!(sql.contains("ALTER COLUMN \"age\" SET NOT NULL"));
    }
}

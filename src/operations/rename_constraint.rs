//! The `rename_constraint` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified};

use super::{ensure_unreserved, execute};

/// Renames a table constraint.
///
/// Virtual at Start (constraint names are not exposed through views), the
/// physical rename happens at Complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpRenameConstraint {
    /// Table name.
    pub table: String,
    /// Current constraint name.
    pub from: String,
    /// New constraint name.
    pub to: String,
}

impl OpRenameConstraint {
    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        ensure_unreserved(&self.to)?;
        let table = schema.table(&self.table).ok_or_else(|| RollError::TableDoesNotExist {
            name: self.table.clone(),
        })?;
        if !table.constraints.contains_key(&self.from) {
            return Err(RollError::ConstraintDoesNotExist {
                table: self.table.clone(),
                name: self.from.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        if let Some(table) = schema.table_mut(&self.table) {
            if let Some(mut constraint) = table.constraints.remove(&self.from) {
                constraint.name = self.to.clone();
                table.constraints.insert(self.to.clone(), constraint);
            }
        }
    }

    pub(crate) async fn start(
        &self,
        _conn: &mut PgConnection,
        _state_schema: &str,
        schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        self.update_schema(schema);
        Ok(None)
    }

    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {table} RENAME CONSTRAINT {from} TO {to}",
            table = quote_qualified(schema, &self.table),
            from = quote_ident(&self.from),
            to = quote_ident(&self.to),
        );
        execute(conn, "rename constraint", &sql).await
    }

    pub(crate) async fn rollback(&self, _conn: &mut PgConnection, _schema: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Constraint, ConstraintKind, Table};

    #[test]
    fn test_rename_updates_snapshot() {
        let mut schema = Schema::new("public");
        let mut table = Table::new("users");
        table.constraints.insert(
            "users_age_check".to_string(),
            Constraint {
                name: "users_age_check".to_string(),
                kind: ConstraintKind::Check,
                columns: vec!["age".to_string()],
                definition: Some("CHECK (age > 0)".to_string()),
            },
        );
        schema.add_table("users", table);

        let op = OpRenameConstraint {
            table: "users".to_string(),
            from: "users_age_check".to_string(),
            to: "age_is_positive".to_string(),
        };
        op.validate(&schema).unwrap();
        op.update_schema(&mut schema);

        let constraints = &schema.table("users").unwrap().constraints;
        assert!(!constraints.contains_key("users_age_check"));
        assert_eq!(constraints["age_is_positive"].name, "age_is_positive");
    }

    #[test]
    fn test_validate_rejects_missing_constraint() {
        let mut schema = Schema::new("public");
        schema.add_table("users", Table::new("users"));

        let op = OpRenameConstraint {
            table: "users".to_string(),
            from: "missing".to_string(),
            to: "renamed".to_string(),
        };
        let err = op.validate(&schema).unwrap_err();
        assert!(matches!(err, RollError::ConstraintDoesNotExist { .. }));
    }
}

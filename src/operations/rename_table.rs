//! The `rename_table` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified};

use super::{ensure_unreserved, execute};

/// Renames a table.
///
/// The rename is virtual during the transition window: only the per-version
/// views expose the new name. The physical table is renamed at Complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpRenameTable {
    /// Current table name.
    pub from: String,
    /// New table name.
    pub to: String,
}

impl OpRenameTable {
    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        ensure_unreserved(&self.to)?;
        if schema.table(&self.from).is_none() {
            return Err(RollError::TableDoesNotExist {
                name: self.from.clone(),
            });
        }
        if schema.table(&self.to).is_some() {
            return Err(RollError::TableAlreadyExists {
                name: self.to.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        schema.rename_table(&self.from, &self.to);
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
            "ALTER TABLE {from} RENAME TO {to}",
            from = quote_qualified(schema, &self.from),
            to = quote_ident(&self.to),
        );
        execute(conn, "rename table", &sql).await
    }

    pub(crate) async fn rollback(&self, _conn: &mut PgConnection, _schema: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Table;

    #[test]
    fn test_rename_is_virtual_until_complete() {
        let mut schema = Schema::new("public");
        schema.add_table("users", Table::new("users"));

        let op = OpRenameTable {
            from: "users".to_string(),
            to: "accounts".to_string(),
        };
        op.validate(&schema).unwrap();
        op.update_schema(&mut schema);

        // visible name changed, physical name untouched
        assert!(schema.table("users").is_none());
        assert_eq!(schema.table("accounts").unwrap().name, "users");
    }

    #[test]
    fn test_validate_rejects_missing_source() {
        let op = OpRenameTable {
            from: "missing".to_string(),
            to: "accounts".to_string(),
        };
        let err = op.validate(&Schema::new("public")).unwrap_err();
        assert!(matches!(err, RollError::TableDoesNotExist { .. }));
    }
}

//! The `drop_table` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified};

use super::{deletion_name, execute};

/// Drops a table.
///
/// Start renames the physical table to its deletion name and removes it from
/// the snapshot; writers on older versions keep reaching it through their
/// views (views follow renames). The table is only destroyed at Complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpDropTable {
    /// Table name.
    pub name: String,
}

impl OpDropTable {
    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        if schema.table(&self.name).is_none() {
            return Err(RollError::TableDoesNotExist {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        schema.remove_table(&self.name);
    }

    pub(crate) async fn start(
        &self,
        conn: &mut PgConnection,
        _state_schema: &str,
        schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        let physical = schema
            .table(&self.name)
            .map_or_else(|| self.name.clone(), |t| t.name.clone());

        let sql = format!(
            "ALTER TABLE {table} RENAME TO {deleted}",
            table = quote_qualified(&schema.name, &physical),
            deleted = quote_ident(&deletion_name(&self.name)),
        );
        execute(conn, "schedule table deletion", &sql).await?;

        self.update_schema(schema);
        Ok(None)
    }

    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let sql = format!(
            "DROP TABLE IF EXISTS {table}",
            table = quote_qualified(schema, &deletion_name(&self.name)),
        );
        execute(conn, "drop table", &sql).await
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {deleted} RENAME TO {table}",
            deleted = quote_qualified(schema, &deletion_name(&self.name)),
            table = quote_ident(&self.name),
        );
        execute(conn, "restore table", &sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Table;

    #[test]
    fn test_update_schema_hides_the_table() {
        let mut schema = Schema::new("public");
        schema.add_table("users", Table::new("users"));

        let op = OpDropTable {
            name: "users".to_string(),
        };
        op.validate(&schema).unwrap();
        op.update_schema(&mut schema);

        assert!(schema.table("users").is_none());
    }

    #[test]
    fn test_validate_rejects_missing_table() {
        let op = OpDropTable {
            name: "missing".to_string(),
        };
        let err = op.validate(&Schema::new("public")).unwrap_err();
        assert!(matches!(err, RollError::TableDoesNotExist { .. }));
    }
}

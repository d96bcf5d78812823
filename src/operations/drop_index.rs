//! The `drop_index` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::quote_qualified;

use super::execute;

/// Drops an index.
///
/// The index vanishes from the snapshot at Start but is only removed at
/// Complete, with `DROP INDEX CONCURRENTLY`. That statement cannot run
/// inside a transaction, so it is the operation's concurrent Complete half.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpDropIndex {
    /// Index name.
    pub name: String,
}

impl OpDropIndex {
    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        let known = schema
            .tables
            .values()
            .any(|table| table.indexes.contains_key(&self.name));
        if !known {
            return Err(RollError::IndexDoesNotExist {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        for table in schema.tables.values_mut() {
            table.indexes.remove(&self.name);
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

    pub(crate) async fn complete_concurrent(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        let sql = format!(
            "DROP INDEX CONCURRENTLY IF EXISTS {name}",
            name = quote_qualified(schema, &self.name),
        );
        execute(conn, "drop index", &sql).await
    }

    pub(crate) async fn complete(&self, _conn: &mut PgConnection, _schema: &str) -> Result<()> {
        Ok(())
    }

    pub(crate) async fn rollback(&self, _conn: &mut PgConnection, _schema: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Index, Table};

    #[test]
    fn test_validate_and_update() {
        let mut schema = Schema::new("public");
        let mut table = Table::new("users");
        table.indexes.insert(
            "idx_users_email".to_string(),
            Index {
                name: "idx_users_email".to_string(),
                columns: vec!["email".to_string()],
                unique: false,
            },
        );
        schema.add_table("users", table);

        let op = OpDropIndex {
            name: "idx_users_email".to_string(),
        };
        op.validate(&schema).unwrap();
        op.update_schema(&mut schema);
        assert!(schema.table("users").unwrap().indexes.is_empty());

        let err = op.validate(&schema).unwrap_err();
        assert!(matches!(err, RollError::IndexDoesNotExist { .. }));
    }
}

//! The `sql` and `sql_in_transaction` operations.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;

use super::execute;

/// Runs user SQL outside any engine transaction.
///
/// The statements run autocommit, which permits things the engine cannot
/// wrap in a transaction (`CREATE INDEX CONCURRENTLY`, `VACUUM`). The
/// snapshot is not updated; raw SQL is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpRawSql {
    /// SQL to run at Start.
    pub up: String,
    /// SQL to run at Rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<String>,
}

impl OpRawSql {
    pub(crate) fn validate(&self, _schema: &Schema) -> Result<()> {
        if self.up.trim().is_empty() {
            return Err(RollError::InvalidMigration(
                "sql operation requires a non-empty up".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, _schema: &mut Schema) {}

    pub(crate) async fn start(
        &self,
        conn: &mut PgConnection,
        _state_schema: &str,
        _schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        execute(conn, "run sql", &self.up).await?;
        Ok(None)
    }

    pub(crate) async fn complete(&self, _conn: &mut PgConnection, _schema: &str) -> Result<()> {
        Ok(())
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, _schema: &str) -> Result<()> {
        if let Some(down) = &self.down {
            execute(conn, "run down sql", down).await?;
        }
        Ok(())
    }
}

/// Runs user SQL inside the operation's own transaction.
///
/// A failure anywhere in the statements rolls back everything the
/// operation did, leaving no partial effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpSqlInTransaction {
    /// SQL to run at Start.
    pub up: String,
    /// SQL to run at Rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<String>,
}

impl OpSqlInTransaction {
    pub(crate) fn validate(&self, _schema: &Schema) -> Result<()> {
        if self.up.trim().is_empty() {
            return Err(RollError::InvalidMigration(
                "sql_in_transaction operation requires a non-empty up".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, _schema: &mut Schema) {}

    pub(crate) async fn start(
        &self,
        conn: &mut PgConnection,
        _state_schema: &str,
        _schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        execute(conn, "run sql", &self.up).await?;
        Ok(None)
    }

    pub(crate) async fn complete(&self, _conn: &mut PgConnection, _schema: &str) -> Result<()> {
        Ok(())
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, _schema: &str) -> Result<()> {
        if let Some(down) = &self.down {
            execute(conn, "run down sql", down).await?;
        }
        Ok(())
    }
}

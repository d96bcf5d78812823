//! The operation catalog.
//!
//! Every schema change a migration can express is one of the variants below.
//! Operations share a common life cycle driven by the controller:
//!
//! - `validate` — pure check against the snapshot, no database access.
//! - `update_schema` — pure snapshot mutation, shared by the validation
//!   pass and by `start`.
//! - `start` — the non-blocking half of the change: transient columns and
//!   tables, up/down triggers, NOT VALID constraints, concurrent indexes.
//!   Returns a backfill task when a duplicated column needs filling.
//! - `complete` — finalizes the change: drops old columns, promotes
//!   transient names, validates deferred constraints, removes triggers.
//! - `rollback` — undoes `start`, leaving the original schema intact.
//!
//! On the wire an operation is a single-key JSON object whose key names the
//! variant; the closed set of keys is matched in [`Operation::from_value`].

mod add_column;
mod alter_column;
mod change_type;
mod create_constraint;
mod create_index;
mod create_table;
mod drop_column;
mod drop_constraint;
mod drop_index;
mod drop_multicolumn_constraint;
mod drop_table;
mod raw_sql;
mod rename_column;
mod rename_constraint;
mod rename_table;
mod set_check;
mod set_foreign_key;
mod set_replica_identity;

pub(crate) mod duplicate;
pub(crate) mod triggers;

pub use add_column::OpAddColumn;
pub use alter_column::OpAlterColumn;
pub use change_type::OpChangeType;
pub use create_constraint::{ConstraintType, OpCreateConstraint, TableReference};
pub use create_index::OpCreateIndex;
pub use create_table::{ColumnDef, OpCreateTable};
pub use drop_column::OpDropColumn;
pub use drop_constraint::OpDropConstraint;
pub use drop_index::OpDropIndex;
pub use drop_multicolumn_constraint::OpDropMulticolumnConstraint;
pub use drop_table::OpDropTable;
pub use raw_sql::{OpRawSql, OpSqlInTransaction};
pub use rename_column::OpRenameColumn;
pub use rename_constraint::OpRenameConstraint;
pub use rename_table::OpRenameTable;
pub use set_check::OpSetCheckConstraint;
pub use set_foreign_key::{ColumnReference, OpSetForeignKey};
pub use set_replica_identity::{OpSetReplicaIdentity, ReplicaIdentity};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::postgres::PgConnection;
use tracing::debug;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;

/// Prefix of transient objects created at Start and promoted at Complete.
pub const TEMPORARY_PREFIX: &str = "_pgroll_new_";

/// Prefix of objects scheduled for deletion at Complete.
pub const DELETION_PREFIX: &str = "_pgroll_del_";

const TRIGGER_PREFIX: &str = "_pgroll_trigger_";
const CHECK_PREFIX: &str = "_pgroll_check_";
const INDEX_PREFIX: &str = "_pgroll_idx_";

/// The transient name for an object being created or duplicated.
#[must_use]
pub fn temporary_name(name: &str) -> String {
    format!("{TEMPORARY_PREFIX}{name}")
}

/// The name of an object scheduled for deletion.
#[must_use]
pub fn deletion_name(name: &str) -> String {
    format!("{DELETION_PREFIX}{name}")
}

pub(crate) fn trigger_name(table: &str, column: &str) -> String {
    format!("{TRIGGER_PREFIX}{table}_{column}")
}

pub(crate) fn not_null_constraint_name(column: &str) -> String {
    format!("{CHECK_PREFIX}not_null_{column}")
}

pub(crate) fn temp_index_name(constraint: &str) -> String {
    format!("{INDEX_PREFIX}{constraint}")
}

/// Rejects user-supplied names that collide with reserved engine prefixes.
pub(crate) fn ensure_unreserved(name: &str) -> Result<()> {
    for prefix in [TEMPORARY_PREFIX, DELETION_PREFIX, TRIGGER_PREFIX, CHECK_PREFIX, INDEX_PREFIX] {
        if name.starts_with(prefix) {
            return Err(RollError::ReservedName {
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Runs one SQL step, attaching the step description to any failure.
pub(crate) async fn execute(conn: &mut PgConnection, step: &str, sql: &str) -> Result<()> {
    use sqlx::Executor as _;

    debug!(sql = %sql, "executing");
    (&mut *conn)
        .execute(sql)
        .await
        .map_err(|source| RollError::SqlFailed {
            step: step.to_string(),
            source,
        })?;
    Ok(())
}

/// One schema change. The closed set of variants the engine understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// `create_table`
    CreateTable(OpCreateTable),
    /// `rename_table`
    RenameTable(OpRenameTable),
    /// `drop_table`
    DropTable(OpDropTable),
    /// `add_column`
    AddColumn(OpAddColumn),
    /// `drop_column`
    DropColumn(OpDropColumn),
    /// `rename_column`
    RenameColumn(OpRenameColumn),
    /// `alter_column`
    AlterColumn(OpAlterColumn),
    /// `create_index`
    CreateIndex(OpCreateIndex),
    /// `drop_index`
    DropIndex(OpDropIndex),
    /// `create_constraint`
    CreateConstraint(OpCreateConstraint),
    /// `drop_constraint`
    DropConstraint(OpDropConstraint),
    /// `rename_constraint`
    RenameConstraint(OpRenameConstraint),
    /// `drop_multicolumn_constraint`
    DropMulticolumnConstraint(OpDropMulticolumnConstraint),
    /// `set_replica_identity`
    SetReplicaIdentity(OpSetReplicaIdentity),
    /// `sql`
    RawSql(OpRawSql),
    /// `sql_in_transaction`
    SqlInTransaction(OpSqlInTransaction),
}

impl Operation {
    /// The wire name of this operation.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateTable(_) => "create_table",
            Self::RenameTable(_) => "rename_table",
            Self::DropTable(_) => "drop_table",
            Self::AddColumn(_) => "add_column",
            Self::DropColumn(_) => "drop_column",
            Self::RenameColumn(_) => "rename_column",
            Self::AlterColumn(_) => "alter_column",
            Self::CreateIndex(_) => "create_index",
            Self::DropIndex(_) => "drop_index",
            Self::CreateConstraint(_) => "create_constraint",
            Self::DropConstraint(_) => "drop_constraint",
            Self::RenameConstraint(_) => "rename_constraint",
            Self::DropMulticolumnConstraint(_) => "drop_multicolumn_constraint",
            Self::SetReplicaIdentity(_) => "set_replica_identity",
            Self::RawSql(_) => "sql",
            Self::SqlInTransaction(_) => "sql_in_transaction",
        }
    }

    /// Decodes a single-key operation object.
    ///
    /// `index` is the operation's position within the migration, used in
    /// error messages only.
    pub fn from_value(index: usize, value: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(mut object) = value else {
            return Err(RollError::InvalidMigration(format!(
                "operation at index {index} is not an object",
            )));
        };
        if object.len() != 1 {
            return Err(RollError::MultipleOpKeys {
                index,
                found: object.len(),
            });
        }
        // single entry, checked above
        let (name, body) = object
            .iter_mut()
            .map(|(k, v)| (k.clone(), v.take()))
            .next()
            .ok_or(RollError::MultipleOpKeys { index, found: 0 })?;

        match name.as_str() {
            "create_table" => Ok(Self::CreateTable(decode(&name, body)?)),
            "rename_table" => Ok(Self::RenameTable(decode(&name, body)?)),
            "drop_table" => Ok(Self::DropTable(decode(&name, body)?)),
            "add_column" => Ok(Self::AddColumn(decode(&name, body)?)),
            "drop_column" => Ok(Self::DropColumn(decode(&name, body)?)),
            "rename_column" => Ok(Self::RenameColumn(decode(&name, body)?)),
            "alter_column" => Ok(Self::AlterColumn(decode(&name, body)?)),
            "create_index" => Ok(Self::CreateIndex(decode(&name, body)?)),
            "drop_index" => Ok(Self::DropIndex(decode(&name, body)?)),
            "create_constraint" => Ok(Self::CreateConstraint(decode(&name, body)?)),
            "drop_constraint" => Ok(Self::DropConstraint(decode(&name, body)?)),
            "rename_constraint" => Ok(Self::RenameConstraint(decode(&name, body)?)),
            "drop_multicolumn_constraint" => {
                Ok(Self::DropMulticolumnConstraint(decode(&name, body)?))
            }
            "set_replica_identity" => Ok(Self::SetReplicaIdentity(decode(&name, body)?)),
            "sql" => Ok(Self::RawSql(decode(&name, body)?)),
            "sql_in_transaction" => Ok(Self::SqlInTransaction(decode(&name, body)?)),
            other => Err(RollError::UnknownOperation(other.to_string())),
        }
    }

    fn body_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::CreateTable(op) => serde_json::to_value(op),
            Self::RenameTable(op) => serde_json::to_value(op),
            Self::DropTable(op) => serde_json::to_value(op),
            Self::AddColumn(op) => serde_json::to_value(op),
            Self::DropColumn(op) => serde_json::to_value(op),
            Self::RenameColumn(op) => serde_json::to_value(op),
            Self::AlterColumn(op) => serde_json::to_value(op),
            Self::CreateIndex(op) => serde_json::to_value(op),
            Self::DropIndex(op) => serde_json::to_value(op),
            Self::CreateConstraint(op) => serde_json::to_value(op),
            Self::DropConstraint(op) => serde_json::to_value(op),
            Self::RenameConstraint(op) => serde_json::to_value(op),
            Self::DropMulticolumnConstraint(op) => serde_json::to_value(op),
            Self::SetReplicaIdentity(op) => serde_json::to_value(op),
            Self::RawSql(op) => serde_json::to_value(op),
            Self::SqlInTransaction(op) => serde_json::to_value(op),
        }
    }

    /// Pure validation against the snapshot.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        match self {
            Self::CreateTable(op) => op.validate(schema),
            Self::RenameTable(op) => op.validate(schema),
            Self::DropTable(op) => op.validate(schema),
            Self::AddColumn(op) => op.validate(schema),
            Self::DropColumn(op) => op.validate(schema),
            Self::RenameColumn(op) => op.validate(schema),
            Self::AlterColumn(op) => op.validate(schema),
            Self::CreateIndex(op) => op.validate(schema),
            Self::DropIndex(op) => op.validate(schema),
            Self::CreateConstraint(op) => op.validate(schema),
            Self::DropConstraint(op) => op.validate(schema),
            Self::RenameConstraint(op) => op.validate(schema),
            Self::DropMulticolumnConstraint(op) => op.validate(schema),
            Self::SetReplicaIdentity(op) => op.validate(schema),
            Self::RawSql(op) => op.validate(schema),
            Self::SqlInTransaction(op) => op.validate(schema),
        }
    }

    /// Applies this operation's effect to the snapshot without touching the
    /// database. Used by the validation pass so later operations observe
    /// earlier ones; `start` applies the same mutation itself.
    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        match self {
            Self::CreateTable(op) => op.update_schema(schema),
            Self::RenameTable(op) => op.update_schema(schema),
            Self::DropTable(op) => op.update_schema(schema),
            Self::AddColumn(op) => op.update_schema(schema),
            Self::DropColumn(op) => op.update_schema(schema),
            Self::RenameColumn(op) => op.update_schema(schema),
            Self::AlterColumn(op) => op.update_schema(schema),
            Self::CreateIndex(op) => op.update_schema(schema),
            Self::DropIndex(op) => op.update_schema(schema),
            Self::CreateConstraint(op) => op.update_schema(schema),
            Self::DropConstraint(op) => op.update_schema(schema),
            Self::RenameConstraint(op) => op.update_schema(schema),
            Self::DropMulticolumnConstraint(op) => op.update_schema(schema),
            Self::SetReplicaIdentity(op) => op.update_schema(schema),
            Self::RawSql(op) => op.update_schema(schema),
            Self::SqlInTransaction(op) => op.update_schema(schema),
        }
    }

    /// Runs the non-blocking half of the change and mutates the snapshot.
    pub(crate) async fn start(
        &self,
        conn: &mut PgConnection,
        state_schema: &str,
        schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        match self {
            Self::CreateTable(op) => op.start(conn, state_schema, schema).await,
            Self::RenameTable(op) => op.start(conn, state_schema, schema).await,
            Self::DropTable(op) => op.start(conn, state_schema, schema).await,
            Self::AddColumn(op) => op.start(conn, state_schema, schema).await,
            Self::DropColumn(op) => op.start(conn, state_schema, schema).await,
            Self::RenameColumn(op) => op.start(conn, state_schema, schema).await,
            Self::AlterColumn(op) => op.start(conn, state_schema, schema).await,
            Self::CreateIndex(op) => op.start(conn, state_schema, schema).await,
            Self::DropIndex(op) => op.start(conn, state_schema, schema).await,
            Self::CreateConstraint(op) => op.start(conn, state_schema, schema).await,
            Self::DropConstraint(op) => op.start(conn, state_schema, schema).await,
            Self::RenameConstraint(op) => op.start(conn, state_schema, schema).await,
            Self::DropMulticolumnConstraint(op) => op.start(conn, state_schema, schema).await,
            Self::SetReplicaIdentity(op) => op.start(conn, state_schema, schema).await,
            Self::RawSql(op) => op.start(conn, state_schema, schema).await,
            Self::SqlInTransaction(op) => op.start(conn, state_schema, schema).await,
        }
    }

    /// Finalizes the change inside Complete's shared transaction.
    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        match self {
            Self::CreateTable(op) => op.complete(conn, schema).await,
            Self::RenameTable(op) => op.complete(conn, schema).await,
            Self::DropTable(op) => op.complete(conn, schema).await,
            Self::AddColumn(op) => op.complete(conn, schema).await,
            Self::DropColumn(op) => op.complete(conn, schema).await,
            Self::RenameColumn(op) => op.complete(conn, schema).await,
            Self::AlterColumn(op) => op.complete(conn, schema).await,
            Self::CreateIndex(op) => op.complete(conn, schema).await,
            Self::DropIndex(op) => op.complete(conn, schema).await,
            Self::CreateConstraint(op) => op.complete(conn, schema).await,
            Self::DropConstraint(op) => op.complete(conn, schema).await,
            Self::RenameConstraint(op) => op.complete(conn, schema).await,
            Self::DropMulticolumnConstraint(op) => op.complete(conn, schema).await,
            Self::SetReplicaIdentity(op) => op.complete(conn, schema).await,
            Self::RawSql(op) => op.complete(conn, schema).await,
            Self::SqlInTransaction(op) => op.complete(conn, schema).await,
        }
    }

    /// The non-transactional part of Complete, if this operation has one.
    /// Runs before the shared Complete transaction opens.
    pub(crate) async fn complete_concurrent(
        &self,
        conn: &mut PgConnection,
        schema: &str,
    ) -> Result<()> {
        match self {
            Self::DropIndex(op) => op.complete_concurrent(conn, schema).await,
            _ => Ok(()),
        }
    }

    /// Undoes Start, best-effort.
    pub(crate) async fn rollback(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        match self {
            Self::CreateTable(op) => op.rollback(conn, schema).await,
            Self::RenameTable(op) => op.rollback(conn, schema).await,
            Self::DropTable(op) => op.rollback(conn, schema).await,
            Self::AddColumn(op) => op.rollback(conn, schema).await,
            Self::DropColumn(op) => op.rollback(conn, schema).await,
            Self::RenameColumn(op) => op.rollback(conn, schema).await,
            Self::AlterColumn(op) => op.rollback(conn, schema).await,
            Self::CreateIndex(op) => op.rollback(conn, schema).await,
            Self::DropIndex(op) => op.rollback(conn, schema).await,
            Self::CreateConstraint(op) => op.rollback(conn, schema).await,
            Self::DropConstraint(op) => op.rollback(conn, schema).await,
            Self::RenameConstraint(op) => op.rollback(conn, schema).await,
            Self::DropMulticolumnConstraint(op) => op.rollback(conn, schema).await,
            Self::SetReplicaIdentity(op) => op.rollback(conn, schema).await,
            Self::RawSql(op) => op.rollback(conn, schema).await,
            Self::SqlInTransaction(op) => op.rollback(conn, schema).await,
        }
    }

    /// Whether Start may run inside a transaction. Operations that issue
    /// `CREATE INDEX CONCURRENTLY` (or deliberately autocommit user SQL)
    /// cannot.
    pub(crate) fn transactional(&self) -> bool {
        match self {
            Self::CreateIndex(_) | Self::RawSql(_) => false,
            Self::CreateConstraint(op) => op.transactional(),
            _ => true,
        }
    }
}

fn decode<T: DeserializeOwned>(op: &str, body: serde_json::Value) -> Result<T> {
    serde_json::from_value(body).map_err(|source| {
        let message = source.to_string();
        if message.starts_with("unknown field") {
            RollError::UnknownField {
                op: op.to_string(),
                message,
            }
        } else {
            RollError::OperationDecode {
                op: op.to_string(),
                source,
            }
        }
    })
}

impl Serialize for Operation {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;

        let body = self.body_value().map_err(serde::ser::Error::custom)?;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.name(), &body)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_value(0, value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_known_operation() {
        let value = json!({
            "rename_column": {"table": "users", "from": "fullname", "to": "name"}
        });
        let op = Operation::from_value(0, value).unwrap();
        assert_eq!(op.name(), "rename_column");
        assert!(matches!(op, Operation::RenameColumn(_)));
    }

    #[test]
    fn test_decode_unknown_operation() {
        let value = json!({"explode_table": {"table": "users"}});
        let err = Operation::from_value(0, value).unwrap_err();
        assert!(matches!(err, RollError::UnknownOperation(name) if name == "explode_table"));
    }

    #[test]
    fn test_decode_rejects_multiple_keys() {
        let value = json!({
            "drop_table": {"name": "users"},
            "drop_index": {"name": "idx"},
        });
        let err = Operation::from_value(3, value).unwrap_err();
        assert!(matches!(err, RollError::MultipleOpKeys { index: 3, found: 2 }));
    }

    #[test]
    fn test_decode_rejects_empty_object() {
        let err = Operation::from_value(0, json!({})).unwrap_err();
        assert!(matches!(err, RollError::MultipleOpKeys { found: 0, .. }));
    }

    #[test]
    fn test_decode_rejects_unknown_fields() {
        let value = json!({
            "rename_column": {"table": "users", "from": "a", "to": "b", "color": "red"}
        });
        let err = Operation::from_value(0, value).unwrap_err();
        assert!(matches!(err, RollError::UnknownField { op, .. } if op == "rename_column"));
    }

    #[test]
    fn test_missing_field_is_not_an_unknown_field() {
        let value = json!({"rename_column": {"table": "users"}});
        let err = Operation::from_value(0, value).unwrap_err();
        assert!(matches!(err, RollError::OperationDecode { .. }));
    }

    #[test]
    fn test_serialize_is_a_single_key_object() {
        let op = Operation::DropTable(OpDropTable {
            name: "users".to_string(),
        });
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value, json!({"drop_table": {"name": "users"}}));
    }

    #[test]
    fn test_round_trip_alter_column() {
        let value = json!({
            "alter_column": {
                "table": "t",
                "column": "age",
                "type": "integer",
                "up": "CAST(age AS integer)",
                "down": "CAST(age AS text)",
            }
        });
        let op = Operation::from_value(0, value.clone()).unwrap();
        assert_eq!(serde_json::to_value(&op).unwrap(), value);
    }

    #[test]
    fn test_reserved_names_rejected() {
        assert!(ensure_unreserved("users").is_ok());
        assert!(ensure_unreserved("_pgroll_new_users").is_err());
        assert!(ensure_unreserved("_pgroll_del_users").is_err());
        assert!(ensure_unreserved("_pgroll_trigger_users_age").is_err());
    }

    #[test]
    fn test_naming_helpers() {
        assert_eq!(temporary_name("age"), "_pgroll_new_age");
        assert_eq!(deletion_name("users"), "_pgroll_del_users");
        assert_eq!(trigger_name("users", "age"), "_pgroll_trigger_users_age");
        assert_eq!(not_null_constraint_name("age"), "_pgroll_check_not_null_age");
    }
}

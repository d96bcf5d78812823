//! The `set_replica_identity` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_qualified};

use super::execute;

/// Replica identity setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaIdentity {
    /// One of `nothing`, `full`, `default` or `index` (case-insensitive).
    #[serde(rename = "type")]
    pub kind: String,
    /// Index name, required when `type` is `index`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

/// Sets a table's replica identity.
///
/// Applied immediately at Start. Replica identity is not captured by the
/// snapshot and the change is not transparently reversible, so Complete and
/// Rollback are no-ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpSetReplicaIdentity {
    /// Table name.
    pub table: String,
    /// Identity to set.
    pub identity: ReplicaIdentity,
}

impl OpSetReplicaIdentity {
    fn identity_clause(&self) -> Result<String> {
        match self.identity.kind.to_lowercase().as_str() {
            "nothing" => Ok("NOTHING".to_string()),
            "full" => Ok("FULL".to_string()),
            "default" => Ok("DEFAULT".to_string()),
            "index" => {
                let index = self.identity.index.as_deref().ok_or_else(|| {
                    RollError::InvalidReplicaIdentity("index identity requires an index name".to_string())
                })?;
                Ok(format!("USING INDEX {}", quote_ident(index)))
            }
            other => Err(RollError::InvalidReplicaIdentity(other.to_string())),
        }
    }

    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        let table = schema.table(&self.table).ok_or_else(|| RollError::TableDoesNotExist {
            name: self.table.clone(),
        })?;
        self.identity_clause()?;
        if let Some(index) = &self.identity.index {
            if self.identity.kind.eq_ignore_ascii_case("index") && !table.indexes.contains_key(index) {
                return Err(RollError::IndexDoesNotExist {
                    name: index.clone(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn update_schema(&self, _schema: &mut Schema) {}

    pub(crate) async fn start(
        &self,
        conn: &mut PgConnection,
        _state_schema: &str,
        schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        let physical = schema
            .table(&self.table)
            .map_or_else(|| self.table.clone(), |t| t.name.clone());
        let sql = format!(
            "ALTER TABLE {table} REPLICA IDENTITY {identity}",
            table = quote_qualified(&schema.name, &physical),
            identity = self.identity_clause()?,
        );
        execute(conn, "set replica identity", &sql).await?;
        Ok(None)
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

    fn schema() -> Schema {
        let mut schema = Schema::new("public");
        let mut table = Table::new("users");
        table.indexes.insert(
            "users_pkey_idx".to_string(),
            Index {
                name: "users_pkey_idx".to_string(),
                columns: vec!["id".to_string()],
                unique: true,
            },
        );
        schema.add_table("users", table);
        schema
    }

    fn op(kind: &str, index: Option<&str>) -> OpSetReplicaIdentity {
        OpSetReplicaIdentity {
            table: "users".to_string(),
            identity: ReplicaIdentity {
                kind: kind.to_string(),
                index: index.map(str::to_string),
            },
        }
    }

    #[test]
    fn test_identity_clauses() {
        assert_eq!(op("full", None).identity_clause().unwrap(), "FULL");
        assert_eq!(op("NOTHING", None).identity_clause().unwrap(), "NOTHING");
        assert_eq!(
            op("index", Some("users_pkey_idx")).identity_clause().unwrap(),
            "USING INDEX \"users_pkey_idx\""
        );
    }

    #[test]
    fn test_validate_rejects_unknown_identity() {
        let err = op("sideways", None).validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::InvalidReplicaIdentity(_)));
    }

    #[test]
    fn test_validate_requires_known_index() {
        op("index", Some("users_pkey_idx")).validate(&schema()).unwrap();

        let err = op("index", Some("missing")).validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::IndexDoesNotExist { .. }));
    }
}

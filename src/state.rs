//! The migration state store.
//!
//! The engine owns one schema inside the target database (default `pgroll`)
//! holding the migration history, the derived schema snapshots and a set of
//! SQL functions exposing derived facts. The `latest_version` function is
//! also called from inside up/down trigger bodies, which is why these live
//! in the database rather than in the engine.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool};

use crate::error::{Result, RollError};
use crate::migration::Migration;
use crate::schema::Schema;
use crate::sql::quote_ident;

/// Default name of the engine-owned schema.
pub const DEFAULT_STATE_SCHEMA: &str = "pgroll";

const UNIQUE_VIOLATION: &str = "23505";

/// One row of the migration history.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    /// Target schema the migration applies to.
    pub schema: String,
    /// Migration name.
    pub name: String,
    /// Name of the previous migration, if any.
    pub parent: Option<String>,
    /// The migration itself.
    pub migration: Migration,
    /// Whether the migration has been completed.
    pub done: bool,
    /// Snapshot after Complete; empty while the migration is active.
    pub resulting_schema: Schema,
    /// When the migration was started.
    pub created_at: DateTime<Utc>,
}

/// Access to the engine-owned state schema.
#[derive(Debug, Clone)]
pub struct State {
    pool: PgPool,
    schema: String,
}

impl State {
    /// Creates a state store handle.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Name of the engine-owned schema.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Whether the state schema exists at all.
    pub async fn is_initialized(&self) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
                .bind(&self.schema)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Creates or upgrades the state schema. Idempotent: the DDL only adds
    /// missing objects and re-creates functions, and is skipped entirely
    /// when the recorded engine version already matches.
    pub async fn init(&self) -> Result<()> {
        use sqlx::Executor as _;

        let version = env!("CARGO_PKG_VERSION");
        if self.is_initialized().await? {
            let recorded: Option<String> = sqlx::query_scalar(&format!(
                "SELECT version FROM {}.pgroll_version LIMIT 1",
                quote_ident(&self.schema),
            ))
            .fetch_optional(&self.pool)
            .await
            .unwrap_or_default();
            if recorded.as_deref() == Some(version) {
                return Ok(());
            }
        }

        self.pool.execute(init_sql(&self.schema).as_str()).await?;

        sqlx::query(&format!(
            "DELETE FROM {}.pgroll_version",
            quote_ident(&self.schema),
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "INSERT INTO {}.pgroll_version (version) VALUES ($1)",
            quote_ident(&self.schema),
        ))
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Latest version of a schema: the migration with no child, whether or
    /// not it is done.
    pub async fn latest_version(&self, schema: &str) -> Result<Option<String>> {
        let version = sqlx::query_scalar(&format!(
            "SELECT {}.latest_version($1)",
            quote_ident(&self.schema),
        ))
        .bind(schema)
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }

    /// The version before the latest, if any.
    pub async fn previous_version(&self, schema: &str) -> Result<Option<String>> {
        let version = sqlx::query_scalar(&format!(
            "SELECT {}.previous_version($1)",
            quote_ident(&self.schema),
        ))
        .bind(schema)
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }

    /// Whether a migration is currently active on the schema.
    pub async fn is_active_migration_period(&self, schema: &str) -> Result<bool> {
        let active = sqlx::query_scalar(&format!(
            "SELECT {}.is_active_migration_period($1)",
            quote_ident(&self.schema),
        ))
        .bind(schema)
        .fetch_one(&self.pool)
        .await?;
        Ok(active)
    }

    /// The active migration record for a schema, if any.
    pub async fn active_migration(&self, schema: &str) -> Result<Option<MigrationRecord>> {
        type Row = (
            String,
            String,
            Option<String>,
            serde_json::Value,
            bool,
            serde_json::Value,
            DateTime<Utc>,
        );

        let row: Option<Row> = sqlx::query_as(&format!(
            "SELECT schema, name, parent, migration, done, resulting_schema, created_at \
             FROM {}.migrations WHERE schema = $1 AND NOT done",
            quote_ident(&self.schema),
        ))
        .bind(schema)
        .fetch_optional(&self.pool)
        .await?;

        let Some((schema, name, parent, migration, done, resulting_schema, created_at)) = row else {
            return Ok(None);
        };

        Ok(Some(MigrationRecord {
            migration: Migration::from_value(migration, Some(&name))?,
            resulting_schema: serde_json::from_value(resulting_schema)?,
            schema,
            name,
            parent,
            done,
            created_at,
        }))
    }

    /// Records a new active migration. The parent is the current latest
    /// version; a partial unique index guarantees at most one active
    /// migration per schema even across racing engines.
    pub async fn start_migration(&self, schema: &str, migration: &Migration) -> Result<()> {
        let existing: Option<bool> = sqlx::query_scalar(&format!(
            "SELECT done FROM {}.migrations WHERE schema = $1 AND name = $2",
            quote_ident(&self.schema),
        ))
        .bind(schema)
        .bind(&migration.name)
        .fetch_optional(&self.pool)
        .await?;
        match existing {
            Some(true) => {
                return Err(RollError::AlreadyApplied {
                    name: migration.name.clone(),
                });
            }
            Some(false) => {
                return Err(RollError::MigrationInProgress {
                    schema: schema.to_string(),
                });
            }
            None => {}
        }

        let result = sqlx::query(&format!(
            "INSERT INTO {schema_q}.migrations (schema, name, parent, migration) \
             VALUES ($1, $2, {schema_q}.latest_version($1), $3)",
            schema_q = quote_ident(&self.schema),
        ))
        .bind(schema)
        .bind(&migration.name)
        .bind(serde_json::to_value(migration)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(RollError::MigrationInProgress {
                    schema: schema.to_string(),
                })
            }
            Err(source) => Err(source.into()),
        }
    }

    /// Marks the active migration done and stores its resulting snapshot.
    /// Runs on the caller's connection so it can join Complete's
    /// transaction.
    pub(crate) async fn complete_migration(
        &self,
        conn: &mut PgConnection,
        schema: &str,
        name: &str,
        resulting: &Schema,
    ) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {}.migrations SET done = true, resulting_schema = $3 \
             WHERE schema = $1 AND name = $2 AND NOT done",
            quote_ident(&self.schema),
        ))
        .bind(schema)
        .bind(name)
        .bind(serde_json::to_value(resulting)?)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RollError::NoActiveMigration {
                schema: schema.to_string(),
            });
        }
        Ok(())
    }

    /// Deletes a migration record (Rollback).
    pub async fn delete_migration(&self, schema: &str, name: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {}.migrations WHERE schema = $1 AND name = $2",
            quote_ident(&self.schema),
        ))
        .bind(schema)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads the live schema from the PostgreSQL catalogs.
    pub async fn read_schema(&self, schema: &str) -> Result<Schema> {
        let mut conn = self.pool.acquire().await?;
        Self::read_schema_with(&mut conn, &self.schema, schema).await
    }

    /// Catalog read on an existing connection, usable inside a transaction
    /// to observe its own uncommitted DDL.
    pub(crate) async fn read_schema_with(
        conn: &mut PgConnection,
        state_schema: &str,
        schema: &str,
    ) -> Result<Schema> {
        let value: serde_json::Value =
            sqlx::query_scalar(&format!("SELECT {}.read_schema($1)", quote_ident(state_schema)))
                .bind(schema)
                .fetch_one(&mut *conn)
                .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// The snapshot recorded when the given version completed.
    pub async fn schema_after(&self, schema: &str, version: &str) -> Result<Schema> {
        let value: serde_json::Value = sqlx::query_scalar(&format!(
            "SELECT resulting_schema FROM {}.migrations WHERE schema = $1 AND name = $2",
            quote_ident(&self.schema),
        ))
        .bind(schema)
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// DDL for the state schema: history table, engine version row and the
/// derived-fact functions.
fn init_sql(schema: &str) -> String {
    let q = quote_ident(schema);
    format!(
        r#"
CREATE SCHEMA IF NOT EXISTS {q};

CREATE TABLE IF NOT EXISTS {q}.migrations (
    schema NAME NOT NULL,
    name TEXT NOT NULL,
    migration JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    parent TEXT,
    done BOOLEAN NOT NULL DEFAULT false,
    resulting_schema JSONB NOT NULL DEFAULT '{{}}'::jsonb,
    PRIMARY KEY (schema, name),
    FOREIGN KEY (schema, parent) REFERENCES {q}.migrations (schema, name)
);

CREATE UNIQUE INDEX IF NOT EXISTS only_one_active_migration ON {q}.migrations (schema) WHERE NOT done;

CREATE TABLE IF NOT EXISTS {q}.pgroll_version (
    version TEXT NOT NULL PRIMARY KEY,
    initialized_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE OR REPLACE FUNCTION {q}.is_active_migration_period(schemaname NAME) RETURNS boolean
AS $$
  SELECT EXISTS (SELECT 1 FROM {q}.migrations WHERE schema = schemaname AND NOT done)
$$ LANGUAGE SQL STABLE;

CREATE OR REPLACE FUNCTION {q}.latest_version(schemaname NAME) RETURNS text
AS $$
  SELECT p.name
  FROM {q}.migrations p
  WHERE p.schema = schemaname
    AND NOT EXISTS (
      SELECT 1 FROM {q}.migrations c WHERE c.schema = schemaname AND c.parent = p.name
    )
$$ LANGUAGE SQL STABLE;

CREATE OR REPLACE FUNCTION {q}.previous_version(schemaname NAME) RETURNS text
AS $$
  SELECT parent
  FROM {q}.migrations
  WHERE schema = schemaname AND name = {q}.latest_version(schemaname)
$$ LANGUAGE SQL STABLE;

CREATE OR REPLACE FUNCTION {q}.read_schema(schemaname TEXT) RETURNS jsonb
LANGUAGE plpgsql STABLE AS $$
DECLARE
  tables jsonb;
BEGIN
  SELECT COALESCE(jsonb_object_agg(t.relname, jsonb_build_object(
      'name', t.relname,
      'columns', (
        SELECT COALESCE(jsonb_object_agg(a.attname, jsonb_build_object(
            'name', a.attname,
            'type', format_type(a.atttypid, a.atttypmod),
            'nullable', NOT a.attnotnull,
            'default', pg_get_expr(d.adbin, d.adrelid),
            'comment', col_description(t.oid, a.attnum)
          )), '{{}}'::jsonb)
        FROM pg_attribute a
        LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
        WHERE a.attrelid = t.oid AND a.attnum > 0 AND NOT a.attisdropped
      ),
      'primary_key', (
        SELECT COALESCE(jsonb_agg(a.attname ORDER BY array_position(c.conkey, a.attnum)), '[]'::jsonb)
        FROM pg_constraint c
        JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = ANY (c.conkey)
        WHERE c.conrelid = t.oid AND c.contype = 'p'
      ),
      'indexes', (
        SELECT COALESCE(jsonb_object_agg(ic.relname, jsonb_build_object(
            'name', ic.relname,
            'unique', i.indisunique,
            'columns', (
              SELECT COALESCE(jsonb_agg(a2.attname), '[]'::jsonb)
              FROM pg_attribute a2
              WHERE a2.attrelid = t.oid AND a2.attnum = ANY (i.indkey)
            )
          )), '{{}}'::jsonb)
        FROM pg_index i
        JOIN pg_class ic ON ic.oid = i.indexrelid
        WHERE i.indrelid = t.oid
      ),
      'constraints', (
        SELECT COALESCE(jsonb_object_agg(c.conname, jsonb_build_object(
            'name', c.conname,
            'type', CASE c.contype
              WHEN 'c' THEN 'check'
              WHEN 'u' THEN 'unique'
              WHEN 'f' THEN 'foreign_key'
              ELSE 'other'
            END,
            'columns', (
              SELECT COALESCE(jsonb_agg(a3.attname ORDER BY array_position(c.conkey, a3.attnum)), '[]'::jsonb)
              FROM pg_attribute a3
              WHERE a3.attrelid = t.oid AND a3.attnum = ANY (c.conkey)
            ),
            'definition', pg_get_constraintdef(c.oid)
          )), '{{}}'::jsonb)
        FROM pg_constraint c
        WHERE c.conrelid = t.oid AND c.contype IN ('c', 'u', 'f')
      )
    )), '{{}}'::jsonb)
  INTO tables
  FROM pg_class t
  JOIN pg_namespace n ON n.oid = t.relnamespace
  WHERE n.nspname = schemaname AND t.relkind = 'r';

  RETURN jsonb_build_object('name', schemaname, 'tables', tables);
END;
$$;
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_sql_enforces_single_active_migration() {
        let sql = init_sql("pgroll");
        assert!(sql.contains(
            "CREATE UNIQUE INDEX IF NOT EXISTS only_one_active_migration ON \"pgroll\".migrations (schema) WHERE NOT done"
        ));
    }

    #[test]
    fn test_init_sql_defines_derived_fact_functions() {
        let sql = init_sql("pgroll");
        for function in [
            "\"pgroll\".is_active_migration_period",
            "\"pgroll\".latest_version",
            "\"pgroll\".previous_version",
            "\"pgroll\".read_schema",
        ] {
            assert!(sql.contains(&format!("CREATE OR REPLACE FUNCTION {function}")));
        }
    }

    #[test]
    fn test_init_sql_quotes_the_state_schema() {
        let sql = init_sql("custom_state");
        assert!(sql.contains("CREATE SCHEMA IF NOT EXISTS \"custom_state\""));
        assert!(!sql.contains("\"pgroll\""));
    }

    #[test]
    fn test_read_schema_output_matches_snapshot_shape() {
        // the function must emit the field names the serde model expects
        let sql = init_sql("pgroll");
        for key in ["'name'", "'columns'", "'primary_key'", "'indexes'", "'constraints'", "'type'", "'nullable'", "'default'", "'comment'", "'definition'"] {
            assert!(sql.contains(key), "missing {key} in read_schema");
        }
    }
}

//! The migration controller.
//!
//! [`Roll`] drives whole migrations through their three phases. Start
//! validates and runs every operation's non-blocking half, backfills
//! duplicated columns and publishes a new version schema of views; Complete
//! promotes the new shape atomically; Rollback removes it again. A
//! per-schema advisory lock serializes engines targeting the same schema
//! without ever blocking application traffic.

use std::path::{Path, PathBuf};

use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Connection as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backfill;
use crate::error::{Result, RollError};
use crate::migration::{self, Format, Migration};
use crate::operations::{execute, Operation};
use crate::schema::Schema;
use crate::sql::{advisory_lock_key, quote_ident, quote_qualified};
use crate::state::State;

/// Default target schema.
pub const DEFAULT_SCHEMA: &str = "public";

/// Orchestrates Start, Complete and Rollback of migrations on one schema.
pub struct Roll {
    pool: PgPool,
    schema: String,
    state: State,
    backfill: backfill::Config,
    cancel: CancellationToken,
}

impl Roll {
    /// Creates a controller over an existing pool.
    pub fn new(pool: PgPool, schema: impl Into<String>, state: State) -> Self {
        Self {
            pool,
            schema: schema.into(),
            state,
            backfill: backfill::Config::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Connects to the database and creates a controller.
    pub async fn connect(
        url: &str,
        schema: impl Into<String>,
        state_schema: impl Into<String>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        let state = State::new(pool.clone(), state_schema);
        Ok(Self::new(pool, schema, state))
    }

    /// Sets the backfill tuning knobs.
    #[must_use]
    pub fn with_backfill_config(mut self, config: backfill::Config) -> Self {
        self.backfill = config;
        self
    }

    /// Sets a cancellation token, honored between operations and between
    /// backfill batches.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The target schema.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// The state store.
    #[must_use]
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Creates or upgrades the state store.
    pub async fn init(&self) -> Result<()> {
        self.state.init().await
    }

    /// Latest applied (or active) version of the target schema.
    pub async fn latest_version(&self) -> Result<Option<String>> {
        self.state.latest_version(&self.schema).await
    }

    /// Starts a migration: validates, runs every operation's Start in
    /// order, backfills, and publishes the new version's views. On failure
    /// every already-started operation is rolled back in reverse order and
    /// the migration record is removed.
    pub async fn start(&self, migration: &Migration) -> Result<()> {
        migration.validate_name()?;

        let mut conn = self.pool.acquire().await?;
        if !self.try_lock(&mut conn).await? {
            // an in-flight Start on another engine holds the lock
            return Err(RollError::MigrationInProgress {
                schema: self.schema.clone(),
            });
        }
        let result = self.start_locked(&mut conn, migration).await;
        self.unlock(&mut conn).await;
        result
    }

    async fn start_locked(&self, conn: &mut PgConnection, migration: &Migration) -> Result<()> {
        info!(name = %migration.name, schema = %self.schema, "starting migration");

        if let Some(active) = self.state.active_migration(&self.schema).await? {
            // retrying the already-active migration is a no-op; a different
            // name, or the same name with different operations, must wait
            // for the active one to complete or roll back
            if active.name == migration.name && active.migration == *migration {
                info!(name = %migration.name, "migration is already started");
                return Ok(());
            }
            return Err(RollError::MigrationInProgress {
                schema: self.schema.clone(),
            });
        }

        let mut schema = self.load_snapshot().await?;

        // Validate against a probe copy, applying each operation's snapshot
        // effect so later operations observe earlier ones. Nothing has
        // touched the database if any of these fail.
        let mut probe = schema.clone();
        for op in &migration.operations {
            op.validate(&probe)?;
            op.update_schema(&mut probe);
        }

        self.state.start_migration(&self.schema, migration).await?;

        let mut started: Vec<&Operation> = Vec::new();
        let mut tasks = Vec::new();
        for op in &migration.operations {
            if self.cancel.is_cancelled() {
                return self
                    .abort_start(conn, migration, &started, RollError::Cancelled)
                    .await;
            }
            debug!(op = op.name(), "starting operation");

            let result = if op.transactional() {
                self.start_in_transaction(conn, op, &mut schema).await
            } else {
                op.start(conn, self.state.schema(), &mut schema).await
            };

            match result {
                Ok(task) => {
                    started.push(op);
                    tasks.extend(task);
                }
                Err(err) => return self.abort_start(conn, migration, &started, err).await,
            }
        }

        for task in &tasks {
            if let Err(err) =
                backfill::run(&self.pool, &self.schema, task, &self.backfill, &self.cancel).await
            {
                return self.abort_start(conn, migration, &started, err).await;
            }
        }

        let version_schema = self.version_schema(&migration.name);
        if let Err(err) = self.create_version_views(conn, &version_schema, &schema).await {
            return self.abort_start(conn, migration, &started, err).await;
        }

        info!(name = %migration.name, views = %version_schema, "migration started");
        Ok(())
    }

    async fn start_in_transaction(
        &self,
        conn: &mut PgConnection,
        op: &Operation,
        schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        let mut tx = conn.begin().await?;
        match op.start(&mut tx, self.state.schema(), schema).await {
            Ok(task) => {
                tx.commit().await?;
                Ok(task)
            }
            // dropping the transaction rolls it back
            Err(err) => Err(err),
        }
    }

    async fn abort_start(
        &self,
        conn: &mut PgConnection,
        migration: &Migration,
        started: &[&Operation],
        cause: RollError,
    ) -> Result<()> {
        warn!(name = %migration.name, error = %cause, "start failed, rolling back");

        let mut residue = Vec::new();
        for op in started.iter().rev() {
            if let Err(err) = op.rollback(conn, &self.schema).await {
                warn!(op = op.name(), error = %err, "rollback step failed");
                residue.push(format!("{}: {err}", op.name()));
            }
        }
        if let Err(err) = self
            .state
            .delete_migration(&self.schema, &migration.name)
            .await
        {
            residue.push(format!("migration record: {err}"));
        }

        Err(RollError::StartFailed {
            source: Box::new(cause),
            residue,
        })
    }

    /// Completes the active migration: old columns dropped, transient names
    /// promoted, deferred constraints validated, previous version views
    /// removed, all in one transaction. On failure the migration stays
    /// active; the operator may retry or roll back.
    pub async fn complete(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if !self.try_lock(&mut conn).await? {
            return Err(RollError::LockAcquisitionFailed {
                schema: self.schema.clone(),
            });
        }
        let result = self.complete_locked(&mut conn).await;
        self.unlock(&mut conn).await;
        result
    }

    async fn complete_locked(&self, conn: &mut PgConnection) -> Result<()> {
        let record = self
            .state
            .active_migration(&self.schema)
            .await?
            .ok_or_else(|| RollError::NoActiveMigration {
                schema: self.schema.clone(),
            })?;
        info!(name = %record.name, schema = %self.schema, "completing migration");

        // steps that cannot run inside a transaction go first
        for op in &record.migration.operations {
            op.complete_concurrent(conn, &self.schema).await?;
        }

        let mut tx = conn.begin().await?;

        // the previous version's views still reference old physical
        // columns; drop them before the operations do
        if let Some(parent) = &record.parent {
            let sql = format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                quote_ident(&self.version_schema(parent)),
            );
            execute(&mut tx, "drop previous version views", &sql).await?;
        }

        for op in &record.migration.operations {
            debug!(op = op.name(), "completing operation");
            op.complete(&mut tx, &self.schema).await?;
        }

        // rebuild this version's views over the final physical names
        let version_schema = self.version_schema(&record.name);
        let sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(&version_schema));
        execute(&mut tx, "drop version views", &sql).await?;

        let resulting = State::read_schema_with(&mut tx, self.state.schema(), &self.schema).await?;
        self.create_version_views(&mut tx, &version_schema, &resulting).await?;

        self.state
            .complete_migration(&mut tx, &self.schema, &record.name, &resulting)
            .await?;
        tx.commit().await?;

        info!(name = %record.name, "migration complete");
        Ok(())
    }

    /// Rolls back the active migration: every operation undone in reverse
    /// order, best-effort. The migration record is only removed when no
    /// residue is left behind.
    pub async fn rollback(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if !self.try_lock(&mut conn).await? {
            return Err(RollError::LockAcquisitionFailed {
                schema: self.schema.clone(),
            });
        }
        let result = self.rollback_locked(&mut conn).await;
        self.unlock(&mut conn).await;
        result
    }

    async fn rollback_locked(&self, conn: &mut PgConnection) -> Result<()> {
        let record = self
            .state
            .active_migration(&self.schema)
            .await?
            .ok_or_else(|| RollError::NoActiveMigration {
                schema: self.schema.clone(),
            })?;
        info!(name = %record.name, schema = %self.schema, "rolling back migration");

        let mut residue = Vec::new();

        // this version's views reference the transient columns; they must
        // go before the operations drop those columns
        let sql = format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            quote_ident(&self.version_schema(&record.name)),
        );
        if let Err(err) = execute(conn, "drop version views", &sql).await {
            residue.push(format!("version views: {err}"));
        }

        for op in record.migration.operations.iter().rev() {
            if let Err(err) = op.rollback(conn, &self.schema).await {
                warn!(op = op.name(), error = %err, "rollback step failed");
                residue.push(format!("{}: {err}", op.name()));
            }
        }

        if !residue.is_empty() {
            return Err(RollError::RollbackResidue { residue });
        }

        self.state.delete_migration(&self.schema, &record.name).await?;
        info!(name = %record.name, "migration rolled back");
        Ok(())
    }

    /// Migrations from a directory that are not yet applied, in
    /// lexicographic filename order, starting after the latest applied
    /// version.
    pub async fn unapplied_migrations(&self, dir: &Path) -> Result<Vec<Migration>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| Format::from_path(path).is_some())
            .collect();
        paths.sort();

        let mut migrations = Vec::with_capacity(paths.len());
        for path in &paths {
            migrations.push(migration::read_migration_file(path)?);
        }

        let latest = self.state.latest_version(&self.schema).await?;
        select_unapplied(migrations, latest.as_deref())
    }

    /// Name of the schema holding a version's views.
    #[must_use]
    pub fn version_schema(&self, version: &str) -> String {
        format!("{}_{}", self.schema, version)
    }

    async fn load_snapshot(&self) -> Result<Schema> {
        let mut snapshot = match self.state.latest_version(&self.schema).await? {
            Some(version) => self.state.schema_after(&self.schema, &version).await?,
            None => self.state.read_schema(&self.schema).await?,
        };
        snapshot.name = self.schema.clone();
        Ok(snapshot)
    }

    async fn create_version_views(
        &self,
        conn: &mut PgConnection,
        version_schema: &str,
        schema: &Schema,
    ) -> Result<()> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(version_schema));
        execute(conn, "create version schema", &sql).await?;

        for visible in schema.table_names() {
            let table = &schema.tables[visible];
            if table.columns.is_empty() {
                continue;
            }
            let columns = table
                .column_names()
                .iter()
                .map(|name| {
                    format!(
                        "{physical} AS {visible}",
                        physical = quote_ident(&table.columns[*name].name),
                        visible = quote_ident(name),
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "CREATE OR REPLACE VIEW {view} AS SELECT {columns} FROM {table}",
                view = quote_qualified(version_schema, visible),
                table = quote_qualified(&self.schema, &table.name),
            );
            execute(conn, "create version view", &sql).await?;
        }
        Ok(())
    }

    async fn try_lock(&self, conn: &mut PgConnection) -> Result<bool> {
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(advisory_lock_key(&self.schema))
            .fetch_one(&mut *conn)
            .await?;
        Ok(locked)
    }

    async fn unlock(&self, conn: &mut PgConnection) {
        let released: sqlx::Result<bool> = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(advisory_lock_key(&self.schema))
            .fetch_one(&mut *conn)
            .await;
        match released {
            Ok(true) => {}
            Ok(false) => warn!(schema = %self.schema, "advisory lock was not held"),
            Err(err) => warn!(schema = %self.schema, error = %err, "failed to release advisory lock"),
        }
    }
}

/// The suffix of `migrations` that follows `latest`. The files must contain
/// the latest applied version or sort strictly after it.
fn select_unapplied(migrations: Vec<Migration>, latest: Option<&str>) -> Result<Vec<Migration>> {
    let Some(latest) = latest else {
        return Ok(migrations);
    };

    if let Some(position) = migrations.iter().position(|m| m.name == latest) {
        return Ok(migrations.into_iter().skip(position + 1).collect());
    }

    if let Some(first) = migrations.first() {
        if first.name.as_str() <= latest {
            return Err(RollError::MigrationOutOfOrder {
                name: first.name.clone(),
                latest: latest.to_string(),
            });
        }
    }
    Ok(migrations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(names: &[&str]) -> Vec<Migration> {
        names
            .iter()
            .map(|name| Migration::new(*name, Vec::new()))
            .collect()
    }

    #[test]
    fn test_no_history_applies_everything() {
        let result = select_unapplied(named(&["01_a", "02_b"]), None).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_suffix_after_latest() {
        let result = select_unapplied(named(&["01_a", "02_b", "03_c"]), Some("02_b")).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "03_c");
    }

    #[test]
    fn test_everything_applied() {
        let result = select_unapplied(named(&["01_a", "02_b"]), Some("02_b")).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_out_of_order_rejected() {
        // the directory starts before the latest applied version without
        // ever containing it
        let err = select_unapplied(named(&["01_a", "03_c"]), Some("02_b")).unwrap_err();
        assert!(matches!(
            err,
            RollError::MigrationOutOfOrder { name, latest } if name == "01_a" && latest == "02_b"
        ));
    }

    #[test]
    fn test_fresh_directory_after_latest() {
        let result = select_unapplied(named(&["03_c", "04_d"]), Some("02_b")).unwrap();
        assert_eq!(result.len(), 2);
    }
}

//! Batched backfill of duplicated columns.
//!
//! A backfill walks a table in primary-key order and self-assigns the target
//! columns in bounded batches. The assignment itself is a no-op; the point is
//! that every touched row fires the table's up trigger, which computes the
//! new-shape value into the duplicated column. Batches run in their own
//! implicit transactions, so an interrupted backfill never holds a long
//! lock and can safely be re-run from the start.

use std::time::Duration;

use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, RollError};
use crate::schema::Table;
use crate::sql::{quote_ident, quote_qualified};

/// Default number of rows per batch.
pub const DEFAULT_BATCH_SIZE: i64 = 1000;

/// Default delay between batches.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::ZERO;

/// Backfill tuning knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Rows per batch.
    pub batch_size: i64,
    /// Sleep between batches.
    pub batch_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
        }
    }
}

impl Config {
    /// Creates a config with the default knobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the delay between batches.
    #[must_use]
    pub fn with_batch_delay(mut self, batch_delay: Duration) -> Self {
        self.batch_delay = batch_delay;
        self
    }
}

/// One table that needs backfilling, produced by an operation's Start.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Physical table name.
    pub table: String,
    /// Physical columns to self-assign (the duplicated columns).
    pub columns: Vec<String>,
    /// Primary key as `(physical name, SQL type)` pairs, in key order.
    pub primary_key: Vec<(String, String)>,
}

impl Task {
    /// Builds a task for the given snapshot table.
    ///
    /// Fails when the table has no primary key to iterate on.
    pub fn new(table: &Table, columns: Vec<String>) -> Result<Self> {
        let primary_key = table.primary_key_columns();
        if primary_key.is_empty() {
            return Err(RollError::BackfillRequiresPrimaryKey {
                table: table.name.clone(),
            });
        }
        Ok(Self {
            table: table.name.clone(),
            columns,
            primary_key,
        })
    }
}

/// Runs a backfill task to completion.
///
/// Progress is monotonic: the last committed batch key is carried forward
/// between batches. Cancellation is honored between batches only; a batch in
/// flight always runs to completion or rolls back as a unit.
pub async fn run(
    pool: &PgPool,
    schema: &str,
    task: &Task,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut last_key: Option<Vec<String>> = None;
    let mut batches = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(backfill_error(task, &last_key, RollError::Cancelled));
        }

        let sql = batch_query(schema, task, config.batch_size, last_key.is_some());
        let mut query = sqlx::query(&sql);
        for value in last_key.iter().flatten() {
            query = query.bind(value);
        }

        let row = match query.fetch_optional(pool).await {
            Ok(row) => row,
            Err(source) => {
                return Err(backfill_error(task, &last_key, RollError::Database(source)));
            }
        };

        let Some(row) = row else {
            debug!(table = %task.table, batches, "backfill complete");
            return Ok(());
        };

        let mut key = Vec::with_capacity(task.primary_key.len());
        for index in 0..task.primary_key.len() {
            match row.try_get::<String, _>(index) {
                Ok(value) => key.push(value),
                Err(source) => {
                    return Err(backfill_error(task, &last_key, RollError::Database(source)));
                }
            }
        }

        batches += 1;
        debug!(table = %task.table, batch = batches, key = ?key, "backfilled batch");
        last_key = Some(key);

        if !config.batch_delay.is_zero() {
            tokio::time::sleep(config.batch_delay).await;
        }
    }
}

/// Builds the single-statement batch: select the next slice of primary keys,
/// self-assign the target columns for those rows, and report the highest key
/// touched. Key values travel as text and are cast back to the key's SQL
/// type server-side, which keeps the client free of per-type bindings.
fn batch_query(schema: &str, task: &Task, batch_size: i64, with_lower_bound: bool) -> String {
    let table = quote_qualified(schema, &task.table);

    let pk_list = task
        .primary_key
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ");

    let lower_bound = if with_lower_bound {
        let placeholders = task
            .primary_key
            .iter()
            .enumerate()
            .map(|(i, (_, sql_type))| format!("(${}::text)::{}", i + 1, sql_type))
            .collect::<Vec<_>>()
            .join(", ");
        format!("WHERE ({pk_list}) > ({placeholders}) ")
    } else {
        String::new()
    };

    let assignments = task
        .columns
        .iter()
        .map(|column| format!("{col} = t.{col}", col = quote_ident(column)))
        .collect::<Vec<_>>()
        .join(", ");

    let join = task
        .primary_key
        .iter()
        .map(|(name, _)| format!("t.{col} = batch.{col}", col = quote_ident(name)))
        .collect::<Vec<_>>()
        .join(" AND ");

    let last_key = task
        .primary_key
        .iter()
        .map(|(name, _)| format!("{}::text", quote_ident(name)))
        .collect::<Vec<_>>()
        .join(", ");

    let order_desc = task
        .primary_key
        .iter()
        .map(|(name, _)| format!("{} DESC", quote_ident(name)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "WITH batch AS (\
           SELECT {pk_list} FROM {table} {lower_bound}\
           ORDER BY {pk_list} LIMIT {batch_size} FOR NO KEY UPDATE\
         ), updated AS (\
           UPDATE {table} AS t SET {assignments} FROM batch WHERE {join}\
         ) \
         SELECT {last_key} FROM batch ORDER BY {order_desc} LIMIT 1"
    )
}

fn backfill_error(task: &Task, last_key: &Option<Vec<String>>, source: RollError) -> RollError {
    RollError::BackfillFailed {
        table: task.table.clone(),
        last_key: last_key.as_ref().map(|key| key.join(", ")),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Table};

    fn task() -> Task {
        Task {
            table: "users".to_string(),
            columns: vec!["_pgroll_new_age".to_string()],
            primary_key: vec![("id".to_string(), "bigint".to_string())],
        }
    }

    #[test]
    fn test_task_requires_primary_key() {
        let table = Table::new("events");
        let err = Task::new(&table, vec!["_pgroll_new_kind".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            RollError::BackfillRequiresPrimaryKey { table } if table == "events"
        ));
    }

    #[test]
    fn test_task_resolves_physical_key_columns() {
        let mut table = Table::new("users");
        table.add_column(
            "id",
            Column {
                name: "id".to_string(),
                sql_type: "bigint".to_string(),
                ..Column::default()
            },
        );
        table.primary_key = vec!["id".to_string()];

        let task = Task::new(&table, vec!["_pgroll_new_age".to_string()]).unwrap();
        assert_eq!(task.primary_key, vec![("id".to_string(), "bigint".to_string())]);
    }

    #[test]
    fn test_first_batch_has_no_lower_bound() {
        let sql = batch_query("public", &task(), 1000, false);
        assert!(!sql.contains("WHERE"));
        assert!(sql.contains("LIMIT 1000 FOR NO KEY UPDATE"));
        assert!(sql.contains("SET \"_pgroll_new_age\" = t.\"_pgroll_new_age\""));
    }

    #[test]
    fn test_later_batches_seek_past_last_key() {
        let sql = batch_query("public", &task(), 500, true);
        assert!(sql.contains("WHERE (\"id\") > (($1::text)::bigint)"));
        assert!(sql.contains("SELECT \"id\"::text FROM batch ORDER BY \"id\" DESC LIMIT 1"));
    }

    #[test]
    fn test_composite_key_batches_use_row_comparison() {
        let task = Task {
            table: "orders".to_string(),
            columns: vec!["_pgroll_new_total".to_string()],
            primary_key: vec![
                ("region".to_string(), "text".to_string()),
                ("id".to_string(), "uuid".to_string()),
            ],
        };
        let sql = batch_query("public", &task, 100, true);
        assert!(sql.contains("(\"region\", \"id\") > (($1::text)::text, ($2::text)::uuid)"));
        assert!(sql.contains("t.\"region\" = batch.\"region\" AND t.\"id\" = batch.\"id\""));
    }
}

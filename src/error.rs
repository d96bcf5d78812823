//! Error types for the migration engine.

use std::fmt::Write as _;

/// Errors that can occur while decoding, validating or executing migrations.
#[derive(Debug, thiserror::Error)]
pub enum RollError {
    // -- validation ---------------------------------------------------------
    /// An `alter_column` operation requested more than one (or zero) changes.
    #[error("alter_column must specify exactly one change (rename, type, check or references)")]
    MultipleAlterColumnChanges,

    /// Up SQL was supplied on an operation that forbids it.
    #[error("up SQL is not allowed for this operation")]
    NoUpSQLAllowed,

    /// Down SQL was supplied on an operation that forbids it.
    #[error("down SQL is not allowed for this operation")]
    NoDownSQLAllowed,

    /// The operation key in a migration file is not part of the catalog.
    #[error("unknown operation {0:?}")]
    UnknownOperation(String),

    /// An operation object did not have exactly one key.
    #[error("operation object at index {index} must have exactly one key, found {found}")]
    MultipleOpKeys {
        /// Position of the offending operation in the migration.
        index: usize,
        /// Number of keys actually present.
        found: usize,
    },

    /// An operation body carried a field the variant does not define.
    #[error("unknown field in {op:?} operation: {message}")]
    UnknownField {
        /// Operation name.
        op: String,
        /// Decoder message naming the field.
        message: String,
    },

    /// An operation body failed to decode for a reason other than an
    /// unknown field (missing field, wrong type, ...).
    #[error("invalid {op:?} operation: {source}")]
    OperationDecode {
        /// Operation name.
        op: String,
        /// Underlying decode error.
        source: serde_json::Error,
    },

    /// The migration envelope itself is malformed.
    #[error("invalid migration: {0}")]
    InvalidMigration(String),

    /// A referenced table does not exist in the schema.
    #[error("table {name:?} does not exist")]
    TableDoesNotExist {
        /// Table name.
        name: String,
    },

    /// A table with the given name already exists.
    #[error("table {name:?} already exists")]
    TableAlreadyExists {
        /// Table name.
        name: String,
    },

    /// A referenced column does not exist on the table.
    #[error("column {column:?} does not exist on table {table:?}")]
    ColumnDoesNotExist {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A column with the given name already exists on the table.
    #[error("column {column:?} already exists on table {table:?}")]
    ColumnAlreadyExists {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A referenced constraint does not exist on the table.
    #[error("constraint {name:?} does not exist on table {table:?}")]
    ConstraintDoesNotExist {
        /// Table name.
        table: String,
        /// Constraint name.
        name: String,
    },

    /// A referenced index does not exist.
    #[error("index {name:?} does not exist")]
    IndexDoesNotExist {
        /// Index name.
        name: String,
    },

    /// A user-supplied name collides with a reserved engine prefix.
    #[error("name {name:?} uses a reserved prefix")]
    ReservedName {
        /// Offending name.
        name: String,
    },

    /// A replica identity other than NOTHING, FULL, DEFAULT or INDEX.
    #[error("invalid replica identity {0:?}")]
    InvalidReplicaIdentity(String),

    /// A table needs backfilling but has no primary key to iterate on.
    #[error("backfill requires a primary key on table {table:?}")]
    BackfillRequiresPrimaryKey {
        /// Table name.
        table: String,
    },

    // -- state --------------------------------------------------------------
    /// Another migration is active (or starting) on the target schema.
    #[error("a migration is already in progress for schema {schema:?}")]
    MigrationInProgress {
        /// Target schema.
        schema: String,
    },

    /// Complete or Rollback was requested but no migration is active.
    #[error("no active migration for schema {schema:?}")]
    NoActiveMigration {
        /// Target schema.
        schema: String,
    },

    /// A migration file sorts at or before the latest applied version.
    #[error("migration {name:?} is out of order: latest applied version is {latest:?}")]
    MigrationOutOfOrder {
        /// Name of the offending migration.
        name: String,
        /// Latest applied version.
        latest: String,
    },

    /// The migration has already been applied to the target schema.
    #[error("migration {name:?} has already been applied")]
    AlreadyApplied {
        /// Migration name.
        name: String,
    },

    // -- execution ----------------------------------------------------------
    /// A SQL step failed during Start, Complete or Rollback.
    #[error("{step} failed: {source}")]
    SqlFailed {
        /// Human-readable description of the failing step.
        step: String,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The backfill of a table failed part-way through.
    #[error("backfill of table {table:?} failed{}: {source}", fmt_last_key(.last_key))]
    BackfillFailed {
        /// Table being backfilled.
        table: String,
        /// Last fully committed batch key, if any batch completed.
        last_key: Option<String>,
        /// Underlying error.
        #[source]
        source: Box<RollError>,
    },

    /// The per-schema advisory lock could not be acquired.
    #[error("could not acquire the migration lock for schema {schema:?}")]
    LockAcquisitionFailed {
        /// Target schema.
        schema: String,
    },

    /// Start failed and was rolled back; residue lists objects that the
    /// automatic rollback could not remove.
    #[error("migration start failed: {source}{}", fmt_residue(.residue))]
    StartFailed {
        /// The error that aborted the start.
        source: Box<RollError>,
        /// Objects left behind by the best-effort rollback.
        residue: Vec<String>,
    },

    /// Rollback could not remove every transient object.
    #[error("rollback left residue{}", fmt_residue(.residue))]
    RollbackResidue {
        /// Objects left behind.
        residue: Vec<String>,
    },

    /// The operation was cancelled between suspension points.
    #[error("operation cancelled")]
    Cancelled,

    // -- passthrough --------------------------------------------------------
    /// Database error outside any specific step.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error reading migration files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Expression rewrite failure.
    #[error("invalid expression: {0}")]
    Expression(#[from] regex::Error),
}

impl RollError {
    /// Returns true for errors caused by user input (bad migration files,
    /// validation failures, state conflicts) as opposed to operational
    /// failures. The CLI maps user errors to exit code 1 and operational
    /// errors to exit code 2.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            Self::SqlFailed { .. }
                | Self::BackfillFailed { .. }
                | Self::LockAcquisitionFailed { .. }
                | Self::StartFailed { .. }
                | Self::RollbackResidue { .. }
                | Self::Cancelled
                | Self::Database(_)
                | Self::Io(_)
        )
    }
}

fn fmt_last_key(last_key: &Option<String>) -> String {
    match last_key {
        Some(key) => format!(" after key {key:?}"),
        None => String::new(),
    }
}

fn fmt_residue(residue: &[String]) -> String {
    let mut out = String::new();
    for item in residue {
        let _ = write!(out, "\n  - {item}");
    }
    out
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, RollError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residue_listed_in_message() {
        let err = RollError::RollbackResidue {
            residue: vec![
                "drop_column: column busy".to_string(),
                "drop_table: table busy".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("drop_column: column busy"));
        assert!(msg.contains("drop_table: table busy"));
    }

    #[test]
    fn test_start_failed_without_residue() {
        let err = RollError::StartFailed {
            source: Box::new(RollError::Cancelled),
            residue: Vec::new(),
        };
        assert_eq!(err.to_string(), "migration start failed: operation cancelled");
    }

    #[test]
    fn test_user_error_classification() {
        assert!(
            RollError::MultipleAlterColumnChanges.is_user_error(),
            "validation errors are user errors"
        );
        assert!(
            RollError::MigrationInProgress {
                schema: "public".to_string()
            }
            .is_user_error()
        );
        assert!(
            !RollError::LockAcquisitionFailed {
                schema: "public".to_string()
            }
            .is_user_error()
        );
    }

    #[test]
    fn test_backfill_failed_message() {
        let err = RollError::BackfillFailed {
            table: "users".to_string(),
            last_key: Some("42".to_string()),
            source: Box::new(RollError::Cancelled),
        };
        assert!(err.to_string().contains("after key \"42\""));
    }
}

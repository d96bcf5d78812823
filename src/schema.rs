//! In-memory schema snapshots.
//!
//! A [`Schema`] is the engine's view of one PostgreSQL schema: tables keyed
//! by their user-visible name, each mapping visible column names to the
//! physical column that currently backs them. During a transition window the
//! two can differ (a visible column may be backed by a `_pgroll_new_`
//! duplicate); per-version views are generated from this mapping.
//!
//! Snapshots are pure data. They are mutated only by operations, serialized
//! as JSON into the state store's `resulting_schema`, and bootstrapped from
//! the PostgreSQL catalogs by `read_schema` when no prior migration exists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Snapshot of a single PostgreSQL schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema name (e.g. `public`).
    #[serde(default)]
    pub name: String,
    /// Tables keyed by user-visible name.
    #[serde(default)]
    pub tables: HashMap<String, Table>,
}

/// Snapshot of a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Physical table name (may carry a transient prefix mid-migration).
    pub name: String,
    /// Columns keyed by user-visible name.
    #[serde(default)]
    pub columns: HashMap<String, Column>,
    /// Primary key, as user-visible column names in key order.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Indexes keyed by index name.
    #[serde(default)]
    pub indexes: HashMap<String, Index>,
    /// Table constraints keyed by constraint name (primary key excluded).
    #[serde(default)]
    pub constraints: HashMap<String, Constraint>,
}

/// Snapshot of a column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Physical column name.
    pub name: String,
    /// SQL type, as `format_type` renders it.
    #[serde(rename = "type")]
    pub sql_type: String,
    /// Whether the column accepts NULL.
    #[serde(default)]
    pub nullable: bool,
    /// Default expression, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Column comment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// True while this visible column is backed by a transient new-shape
    /// duplicate that Complete will promote.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
}

/// Snapshot of an index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,
    /// Indexed columns.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Whether the index is unique.
    #[serde(default)]
    pub unique: bool,
}

/// Kind of a table constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// CHECK constraint.
    #[default]
    Check,
    /// UNIQUE constraint.
    Unique,
    /// FOREIGN KEY constraint.
    ForeignKey,
    /// Anything else the catalogs report (exclusion, trigger constraints).
    Other,
}

/// Snapshot of a table constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Constraint name.
    pub name: String,
    /// Constraint kind.
    #[serde(rename = "type", default)]
    pub kind: ConstraintKind,
    /// Columns the constraint covers, as user-visible names.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Full definition as `pg_get_constraintdef` renders it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

impl Schema {
    /// Creates an empty snapshot for the named schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: HashMap::new(),
        }
    }

    /// Looks up a table by visible name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Looks up a table by visible name, mutably.
    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// Adds a table under its visible name.
    pub fn add_table(&mut self, visible_name: impl Into<String>, table: Table) {
        self.tables.insert(visible_name.into(), table);
    }

    /// Removes a table, returning it if present.
    pub fn remove_table(&mut self, name: &str) -> Option<Table> {
        self.tables.remove(name)
    }

    /// Renames a table's visible name, leaving its physical name untouched.
    pub fn rename_table(&mut self, from: &str, to: &str) {
        if let Some(table) = self.tables.remove(from) {
            self.tables.insert(to.to_string(), table);
        }
    }

    /// Visible table names in sorted order, for deterministic DDL output.
    #[must_use]
    pub fn table_names(&self) -> Vec<&String> {
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        names
    }
}

impl Table {
    /// Creates an empty table snapshot with the given physical name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Looks up a column by visible name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Looks up a column by visible name, mutably.
    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.get_mut(name)
    }

    /// Adds a column under its visible name.
    pub fn add_column(&mut self, visible_name: impl Into<String>, column: Column) {
        self.columns.insert(visible_name.into(), column);
    }

    /// Removes a column, returning it if present.
    pub fn remove_column(&mut self, name: &str) -> Option<Column> {
        self.columns.remove(name)
    }

    /// Renames a column's visible name, leaving the physical name untouched.
    pub fn rename_column(&mut self, from: &str, to: &str) {
        if let Some(column) = self.columns.remove(from) {
            self.columns.insert(to.to_string(), column);
        }
    }

    /// Visible column names in sorted order, for deterministic DDL output.
    #[must_use]
    pub fn column_names(&self) -> Vec<&String> {
        let mut names: Vec<&String> = self.columns.keys().collect();
        names.sort();
        names
    }

    /// Primary key columns resolved to `(physical name, SQL type)` pairs, in
    /// key order. Empty when the table has no primary key or a key column is
    /// missing from the snapshot.
    #[must_use]
    pub fn primary_key_columns(&self) -> Vec<(String, String)> {
        self.primary_key
            .iter()
            .filter_map(|name| {
                self.columns
                    .get(name)
                    .map(|c| (c.name.clone(), c.sql_type.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_table() -> Table {
        let mut table = Table::new("users");
        table.add_column(
            "id",
            Column {
                name: "id".to_string(),
                sql_type: "bigint".to_string(),
                ..Column::default()
            },
        );
        table.add_column(
            "name",
            Column {
                name: "name".to_string(),
                sql_type: "text".to_string(),
                nullable: true,
                ..Column::default()
            },
        );
        table.primary_key = vec!["id".to_string()];
        table
    }

    #[test]
    fn test_rename_table_keeps_physical_name() {
        let mut schema = Schema::new("public");
        schema.add_table("users", users_table());

        schema.rename_table("users", "accounts");

        assert!(schema.table("users").is_none());
        assert_eq!(schema.table("accounts").unwrap().name, "users");
    }

    #[test]
    fn test_rename_column_keeps_physical_name() {
        let mut table = users_table();
        table.rename_column("name", "full_name");

        assert!(table.column("name").is_none());
        assert_eq!(table.column("full_name").unwrap().name, "name");
    }

    #[test]
    fn test_primary_key_columns_resolve_physical_names() {
        let mut table = users_table();
        table.column_mut("id").unwrap().name = "_pgroll_new_id".to_string();

        let pk = table.primary_key_columns();
        assert_eq!(pk, vec![("_pgroll_new_id".to_string(), "bigint".to_string())]);
    }

    #[test]
    fn test_snapshot_round_trips_through_json() {
        let mut schema = Schema::new("public");
        let mut table = users_table();
        table.column_mut("name").unwrap().transient = true;
        schema.add_table("users", table);

        let value = serde_json::to_value(&schema).unwrap();
        let back: Schema = serde_json::from_value(value).unwrap();
        assert_eq!(back, schema);
    }

    #[test]
    fn test_transient_flag_defaults_to_false() {
        let json = r#"{"name": "age", "type": "integer", "nullable": true}"#;
        let column: Column = serde_json::from_str(json).unwrap();
        assert!(!column.transient);
    }
}

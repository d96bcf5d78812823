//! Up/down trigger generation.
//!
//! While a column exists in two physical shapes, a pair of BEFORE INSERT OR
//! UPDATE triggers keeps them reconciled. Which direction fires is decided
//! by the writer's `search_path`: clients address a shape by setting their
//! search path to a per-version view schema, and each trigger compares the
//! caller's setting against the latest version schema. A writer on an older
//! version gets the up expression applied (old shape to new); a writer on
//! the latest version gets the down expression applied (new shape to old).
//!
//! Each trigger function declares one local variable per visible column,
//! bound to the physical column backing it for the trigger's direction, so
//! user-authored expressions can reference columns by their visible names.

use std::collections::HashMap;

use sqlx::postgres::PgConnection;

use crate::error::Result;
use crate::schema::Column;
use crate::sql::{quote_ident, quote_literal, quote_qualified};

use super::execute;

/// Which way a trigger converts values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerDirection {
    /// Old shape to new shape; fires for writers on any older version.
    Up,
    /// New shape to old shape; fires for writers on the latest version.
    Down,
}

/// Everything needed to render one trigger function and its trigger.
pub(crate) struct TriggerConfig<'a> {
    /// Trigger and function name.
    pub name: String,
    /// Conversion direction.
    pub direction: TriggerDirection,
    /// Target schema name.
    pub schema: &'a str,
    /// State store schema name (for the `latest_version` lookup).
    pub state_schema: &'a str,
    /// Physical table name.
    pub table: &'a str,
    /// Physical column the trigger assigns.
    pub physical_column: &'a str,
    /// Conversion expression over visible column names.
    pub expression: &'a str,
    /// Visible-name to column mapping used for the DECLARE block.
    pub columns: &'a HashMap<String, Column>,
}

impl TriggerConfig<'_> {
    /// Renders the `CREATE OR REPLACE FUNCTION` statement.
    #[must_use]
    pub(crate) fn function_sql(&self) -> String {
        let table = quote_qualified(self.schema, self.table);

        let mut visible: Vec<&String> = self.columns.keys().collect();
        visible.sort();

        let mut declarations = String::new();
        for name in visible {
            let column = &self.columns[name];
            declarations.push_str(&format!(
                "  {var} {table}.{physical}%TYPE := NEW.{physical};\n",
                var = quote_ident(name),
                physical = quote_ident(&column.name),
            ));
        }

        let comparison = match self.direction {
            TriggerDirection::Up => "!=",
            TriggerDirection::Down => "=",
        };

        format!(
            "CREATE OR REPLACE FUNCTION {fn_name}()\n\
             RETURNS TRIGGER\n\
             LANGUAGE PLPGSQL\n\
             AS $$\n\
             DECLARE\n\
             {declarations}\
             \x20 latest_schema text;\n\
             \x20 search_path text;\n\
             BEGIN\n\
             \x20 SELECT {schema_literal} || '_' || {state}.latest_version({schema_literal})\n\
             \x20   INTO latest_schema;\n\
             \x20 SELECT current_setting('search_path') INTO search_path;\n\
             \x20 IF search_path {comparison} latest_schema THEN\n\
             \x20   NEW.{target} = {expression};\n\
             \x20 END IF;\n\
             \x20 RETURN NEW;\n\
             END; $$",
            fn_name = quote_qualified(self.schema, &self.name),
            schema_literal = quote_literal(self.schema),
            state = quote_ident(self.state_schema),
            target = quote_ident(self.physical_column),
            expression = self.expression,
        )
    }

    /// Renders the `CREATE TRIGGER` statement.
    #[must_use]
    pub(crate) fn trigger_sql(&self) -> String {
        format!(
            "CREATE OR REPLACE TRIGGER {name}\n\
             BEFORE UPDATE OR INSERT ON {table}\n\
             FOR EACH ROW EXECUTE FUNCTION {fn_name}()",
            name = quote_ident(&self.name),
            table = quote_qualified(self.schema, self.table),
            fn_name = quote_qualified(self.schema, &self.name),
        )
    }
}

/// Creates the trigger function and attaches the trigger.
pub(crate) async fn create_trigger(conn: &mut PgConnection, config: &TriggerConfig<'_>) -> Result<()> {
    execute(conn, "create trigger function", &config.function_sql()).await?;
    execute(conn, "create trigger", &config.trigger_sql()).await
}

/// Drops a trigger and its function, tolerating absence.
pub(crate) async fn drop_trigger(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    name: &str,
) -> Result<()> {
    let sql = format!(
        "DROP TRIGGER IF EXISTS {trigger} ON {table}",
        trigger = quote_ident(name),
        table = quote_qualified(schema, table),
    );
    execute(conn, "drop trigger", &sql).await?;

    let sql = format!(
        "DROP FUNCTION IF EXISTS {fn_name}() CASCADE",
        fn_name = quote_qualified(schema, name),
    );
    execute(conn, "drop trigger function", &sql).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> HashMap<String, Column> {
        let mut columns = HashMap::new();
        columns.insert(
            "id".to_string(),
            Column {
                name: "id".to_string(),
                sql_type: "bigint".to_string(),
                ..Column::default()
            },
        );
        columns.insert(
            "age".to_string(),
            Column {
                name: "age".to_string(),
                sql_type: "text".to_string(),
                nullable: true,
                ..Column::default()
            },
        );
        columns
    }

    #[test]
    fn test_up_trigger_fires_for_old_shape_writers() {
        let columns = columns();
        let config = TriggerConfig {
            name: "_pgroll_trigger_users__pgroll_new_age".to_string(),
            direction: TriggerDirection::Up,
            schema: "public",
            state_schema: "pgroll",
            table: "users",
            physical_column: "_pgroll_new_age",
            expression: "CAST(age AS integer)",
            columns: &columns,
        };

        let sql = config.function_sql();
        assert!(sql.contains("IF search_path != latest_schema THEN"));
        assert!(sql.contains("NEW.\"_pgroll_new_age\" = CAST(age AS integer);"));
        assert!(sql.contains("\"age\" \"public\".\"users\".\"age\"%TYPE := NEW.\"age\";"));
        assert!(sql.contains("\"pgroll\".latest_version('public')"));
    }

    #[test]
    fn test_down_trigger_fires_for_latest_shape_writers() {
        let mut columns = columns();
        // after Start the visible column is backed by the duplicate
        columns.get_mut("age").unwrap().name = "_pgroll_new_age".to_string();

        let config = TriggerConfig {
            name: "_pgroll_trigger_users_age".to_string(),
            direction: TriggerDirection::Down,
            schema: "public",
            state_schema: "pgroll",
            table: "users",
            physical_column: "age",
            expression: "CAST(age AS text)",
            columns: &columns,
        };

        let sql = config.function_sql();
        assert!(sql.contains("IF search_path = latest_schema THEN"));
        assert!(sql.contains("\"age\" \"public\".\"users\".\"_pgroll_new_age\"%TYPE := NEW.\"_pgroll_new_age\";"));
    }

    #[test]
    fn test_trigger_attaches_before_insert_and_update() {
        let columns = columns();
        let config = TriggerConfig {
            name: "_pgroll_trigger_users_age".to_string(),
            direction: TriggerDirection::Down,
            schema: "public",
            state_schema: "pgroll",
            table: "users",
            physical_column: "age",
            expression: "age",
            columns: &columns,
        };

        let sql = config.trigger_sql();
        assert!(sql.starts_with("CREATE OR REPLACE TRIGGER \"_pgroll_trigger_users_age\""));
        assert!(sql.contains("BEFORE UPDATE OR INSERT ON \"public\".\"users\""));
    }
}

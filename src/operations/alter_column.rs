//! The `alter_column` operation.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;

use crate::backfill;
use crate::error::{Result, RollError};
use crate::schema::Schema;

use super::change_type::OpChangeType;
use super::rename_column::OpRenameColumn;
use super::set_check::OpSetCheckConstraint;
use super::set_foreign_key::{ColumnReference, OpSetForeignKey};

/// Alters one aspect of a column.
///
/// A facade over four underlying operations, selected by which field is set:
/// `name` renames, `type` changes the type, `check` adds a CHECK constraint,
/// `references` adds a foreign key. Exactly one must be present; the facade
/// carries no state of its own and forwards `up`/`down` to the resolved
/// operation. A pure rename must not carry `up`/`down`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpAlterColumn {
    /// Table name.
    pub table: String,
    /// Column to alter.
    pub column: String,
    /// New column name (rename).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New SQL type.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub sql_type: Option<String>,
    /// CHECK expression to add.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    /// Foreign key to add.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ColumnReference>,
    /// Old-shape to new-shape conversion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<String>,
    /// New-shape to old-shape conversion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<String>,
}

/// The operation an `alter_column` resolves to.
#[derive(Debug)]
pub(crate) enum AlterColumnInner {
    Rename(OpRenameColumn),
    ChangeType(OpChangeType),
    SetCheck(OpSetCheckConstraint),
    SetForeignKey(OpSetForeignKey),
}

impl OpAlterColumn {
    /// Resolves the facade to its single underlying operation.
    pub(crate) fn inner(&self) -> Result<AlterColumnInner> {
        let changes = [
            self.name.is_some(),
            self.sql_type.is_some(),
            self.check.is_some(),
            self.references.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if changes != 1 {
            return Err(RollError::MultipleAlterColumnChanges);
        }

        if let Some(name) = &self.name {
            return Ok(AlterColumnInner::Rename(OpRenameColumn {
                table: self.table.clone(),
                from: self.column.clone(),
                to: name.clone(),
            }));
        }
        if let Some(sql_type) = &self.sql_type {
            return Ok(AlterColumnInner::ChangeType(OpChangeType {
                table: self.table.clone(),
                column: self.column.clone(),
                sql_type: sql_type.clone(),
                up: self.up.clone(),
                down: self.down.clone(),
            }));
        }
        if let Some(check) = &self.check {
            return Ok(AlterColumnInner::SetCheck(OpSetCheckConstraint {
                table: self.table.clone(),
                column: self.column.clone(),
                check: check.clone(),
                up: self.up.clone(),
                down: self.down.clone(),
            }));
        }
        // only `references` remains
        let references = self
            .references
            .clone()
            .ok_or(RollError::MultipleAlterColumnChanges)?;
        Ok(AlterColumnInner::SetForeignKey(OpSetForeignKey {
            table: self.table.clone(),
            column: self.column.clone(),
            references,
            up: self.up.clone(),
            down: self.down.clone(),
        }))
    }

    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        let inner = self.inner()?;

        if matches!(inner, AlterColumnInner::Rename(_)) {
            if self.up.is_some() {
                return Err(RollError::NoUpSQLAllowed);
            }
            if self.down.is_some() {
                return Err(RollError::NoDownSQLAllowed);
            }
        }

        match inner {
            AlterColumnInner::Rename(op) => op.validate(schema),
            AlterColumnInner::ChangeType(op) => op.validate(schema),
            AlterColumnInner::SetCheck(op) => op.validate(schema),
            AlterColumnInner::SetForeignKey(op) => op.validate(schema),
        }
    }

    pub(crate) fn update_schema(&self, schema: &mut Schema) {
        if let Ok(inner) = self.inner() {
            match inner {
                AlterColumnInner::Rename(op) => op.update_schema(schema),
                AlterColumnInner::ChangeType(op) => op.update_schema(schema),
                AlterColumnInner::SetCheck(op) => op.update_schema(schema),
                AlterColumnInner::SetForeignKey(op) => op.update_schema(schema),
            }
        }
    }

    pub(crate) async fn start(
        &self,
        conn: &mut PgConnection,
        state_schema: &str,
        schema: &mut Schema,
    ) -> Result<Option<backfill::Task>> {
        match self.inner()? {
            AlterColumnInner::Rename(op) => op.start(conn, state_schema, schema).await,
            AlterColumnInner::ChangeType(op) => op.start(conn, state_schema, schema).await,
            AlterColumnInner::SetCheck(op) => op.start(conn, state_schema, schema).await,
            AlterColumnInner::SetForeignKey(op) => op.start(conn, state_schema, schema).await,
        }
    }

    pub(crate) async fn complete(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        match self.inner()? {
            AlterColumnInner::Rename(op) => op.complete(conn, schema).await,
            AlterColumnInner::ChangeType(op) => op.complete(conn, schema).await,
            AlterColumnInner::SetCheck(op) => op.complete(conn, schema).await,
            AlterColumnInner::SetForeignKey(op) => op.complete(conn, schema).await,
        }
    }

    pub(crate) async fn rollback(&self, conn: &mut PgConnection, schema: &str) -> Result<()> {
        match self.inner()? {
            AlterColumnInner::Rename(op) => op.rollback(conn, schema).await,
            AlterColumnInner::ChangeType(op) => op.rollback(conn, schema).await,
            AlterColumnInner::SetCheck(op) => op.rollback(conn, schema).await,
            AlterColumnInner::SetForeignKey(op) => op.rollback(conn, schema).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Table};

    fn base() -> OpAlterColumn {
        OpAlterColumn {
            table: "t".to_string(),
            column: "age".to_string(),
            name: None,
            sql_type: None,
            check: None,
            references: None,
            up: None,
            down: None,
        }
    }

    fn schema() -> Schema {
        let mut schema = Schema::new("public");
        let mut table = Table::new("t");
        table.add_column(
            "age",
            Column {
                name: "age".to_string(),
                sql_type: "text".to_string(),
                nullable: true,
                ..Column::default()
            },
        );
        schema.add_table("t", table);
        schema
    }

    #[test]
    fn test_zero_changes_rejected() {
        let err = base().inner().unwrap_err();
        assert!(matches!(err, RollError::MultipleAlterColumnChanges));
    }

    #[test]
    fn test_multiple_changes_rejected() {
        let mut op = base();
        op.sql_type = Some("integer".to_string());
        op.check = Some("age > 0".to_string());

        let err = op.validate(&schema()).unwrap_err();
        assert!(matches!(err, RollError::MultipleAlterColumnChanges));
    }

    #[test]
    fn test_resolves_to_change_type() {
        let mut op = base();
        op.sql_type = Some("integer".to_string());
        op.up = Some("CAST(age AS integer)".to_string());

        assert!(matches!(op.inner().unwrap(), AlterColumnInner::ChangeType(_)));
        op.validate(&schema()).unwrap();
    }

    #[test]
    fn test_rename_refuses_up_and_down() {
        let mut op = base();
        op.name = Some("years".to_string());
        op.up = Some("age".to_string());
        assert!(matches!(op.validate(&schema()), Err(RollError::NoUpSQLAllowed)));

        let mut op = base();
        op.name = Some("years".to_string());
        op.down = Some("age".to_string());
        assert!(matches!(op.validate(&schema()), Err(RollError::NoDownSQLAllowed)));
    }

    #[test]
    fn test_rename_updates_visible_name() {
        let mut op = base();
        op.name = Some("years".to_string());

        let mut schema = schema();
        op.validate(&schema).unwrap();
        op.update_schema(&mut schema);
        assert!(schema.table("t").unwrap().column("years").is_some());
    }
}

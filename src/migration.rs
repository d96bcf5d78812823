//! The migration envelope and its JSON/YAML surface.
//!
//! A migration file is an object with a `name` and an `operations` array;
//! each operation is a single-key object whose key names the variant. YAML
//! files decode through the same model. When a file has no `name`, the
//! loader substitutes a caller-supplied default, typically the filename
//! without extension.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, RollError};
use crate::operations::{ensure_unreserved, Operation};

/// Supported migration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Canonical JSON.
    Json,
    /// Isomorphic YAML surface.
    Yaml,
}

impl Format {
    /// Picks a format from a file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Some(Self::Json),
            Some("yaml" | "yml") => Some(Self::Yaml),
            _ => None,
        }
    }
}

/// A named, ordered list of schema operations.
///
/// The name is the version identifier: unique within the target schema,
/// ordered lexicographically by the directory loader.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Migration {
    /// Migration name.
    pub name: String,
    /// Operations, applied in order.
    pub operations: Vec<Operation>,
}

impl Migration {
    /// Creates a migration.
    #[must_use]
    pub fn new(name: impl Into<String>, operations: Vec<Operation>) -> Self {
        Self {
            name: name.into(),
            operations,
        }
    }

    /// Decodes a migration from its JSON value form.
    ///
    /// Unknown envelope fields, operation objects without exactly one key,
    /// unknown operation names and unknown variant fields are all rejected.
    pub fn from_value(value: serde_json::Value, default_name: Option<&str>) -> Result<Self> {
        let serde_json::Value::Object(object) = value else {
            return Err(RollError::InvalidMigration(
                "migration must be an object".to_string(),
            ));
        };

        for key in object.keys() {
            if key != "name" && key != "operations" {
                return Err(RollError::InvalidMigration(format!(
                    "unknown field {key:?} in migration",
                )));
            }
        }

        let name = match object.get("name") {
            Some(serde_json::Value::String(name)) if !name.is_empty() => name.clone(),
            Some(serde_json::Value::Null) | None => default_name
                .map(str::to_string)
                .ok_or_else(|| RollError::InvalidMigration("migration has no name".to_string()))?,
            Some(_) => {
                return Err(RollError::InvalidMigration(
                    "migration name must be a string".to_string(),
                ));
            }
        };

        let operations = match object.get("operations") {
            Some(serde_json::Value::Array(values)) => values
                .iter()
                .enumerate()
                .map(|(index, value)| Operation::from_value(index, value.clone()))
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(RollError::InvalidMigration(
                    "operations must be an array".to_string(),
                ));
            }
            None => {
                return Err(RollError::InvalidMigration(
                    "migration has no operations".to_string(),
                ));
            }
        };

        Ok(Self { name, operations })
    }

    /// Rejects migration names that collide with reserved engine prefixes.
    pub fn validate_name(&self) -> Result<()> {
        ensure_unreserved(&self.name)
    }
}

impl<'de> Deserialize<'de> for Migration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_value(value, None).map_err(serde::de::Error::custom)
    }
}

/// Decodes a migration from file contents.
///
/// `default_name` substitutes for a missing `name` field.
pub fn read_migration(contents: &str, format: Format, default_name: Option<&str>) -> Result<Migration> {
    let value: serde_json::Value = match format {
        Format::Json => serde_json::from_str(contents)?,
        Format::Yaml => serde_yaml::from_str(contents)?,
    };
    Migration::from_value(value, default_name)
}

/// Reads a migration file, deriving the format and the default name from
/// the path.
pub fn read_migration_file(path: &Path) -> Result<Migration> {
    let format = Format::from_path(path).ok_or_else(|| {
        RollError::InvalidMigration(format!(
            "unsupported migration file extension: {}",
            path.display(),
        ))
    })?;
    let contents = std::fs::read_to_string(path)?;
    let stem = path.file_stem().and_then(|stem| stem.to_str());
    read_migration(&contents, format, stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RENAME: &str = r#"{
        "name": "01_rename",
        "operations": [
            {"rename_column": {"table": "users", "from": "fullname", "to": "name"}}
        ]
    }"#;

    #[test]
    fn test_decode_json() {
        let migration = read_migration(RENAME, Format::Json, None).unwrap();
        assert_eq!(migration.name, "01_rename");
        assert_eq!(migration.operations.len(), 1);
        assert_eq!(migration.operations[0].name(), "rename_column");
    }

    #[test]
    fn test_decode_yaml() {
        let yaml = "\
name: 01_rename
operations:
  - rename_column:
      table: users
      from: fullname
      to: name
";
        let from_yaml = read_migration(yaml, Format::Yaml, None).unwrap();
        let from_json = read_migration(RENAME, Format::Json, None).unwrap();
        assert_eq!(from_yaml, from_json);
    }

    #[test]
    fn test_default_name_substitution() {
        let contents = r#"{"operations": [{"drop_table": {"name": "users"}}]}"#;
        let migration = read_migration(contents, Format::Json, Some("02_drop")).unwrap();
        assert_eq!(migration.name, "02_drop");

        let err = read_migration(contents, Format::Json, None).unwrap_err();
        assert!(matches!(err, RollError::InvalidMigration(_)));
    }

    #[test]
    fn test_unknown_envelope_field_rejected() {
        let contents = r#"{"name": "m", "operations": [], "author": "me"}"#;
        let err = read_migration(contents, Format::Json, None).unwrap_err();
        assert!(matches!(err, RollError::InvalidMigration(_)));
    }

    #[test]
    fn test_round_trip() {
        let migration = read_migration(RENAME, Format::Json, None).unwrap();
        let encoded = serde_json::to_string(&migration).unwrap();
        let decoded: Migration = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, migration);
    }

    #[test]
    fn test_round_trip_every_operation_kind() {
        let value = json!({
            "name": "03_kitchen_sink",
            "operations": [
                {"create_table": {"name": "t", "columns": [
                    {"name": "id", "type": "serial", "pk": true},
                    {"name": "label", "type": "text", "nullable": true},
                ]}},
                {"rename_table": {"from": "t", "to": "u"}},
                {"drop_table": {"name": "u"}},
                {"add_column": {"table": "v", "column": {"name": "c", "type": "text", "nullable": true}}},
                {"drop_column": {"table": "v", "column": "c", "down": "''"}},
                {"rename_column": {"table": "v", "from": "a", "to": "b"}},
                {"alter_column": {"table": "v", "column": "b", "type": "integer", "up": "1", "down": "'1'"}},
                {"create_index": {"name": "i", "table": "v", "columns": ["b"]}},
                {"drop_index": {"name": "i"}},
                {"create_constraint": {"table": "v", "name": "k", "type": "unique", "columns": ["b"],
                    "up": {"b": "b"}, "down": {"b": "b"}}},
                {"drop_constraint": {"table": "v", "column": "b", "name": "k"}},
                {"rename_constraint": {"table": "v", "from": "k", "to": "k2"}},
                {"drop_multicolumn_constraint": {"table": "v", "name": "k2", "up": {"b": "b"}}},
                {"set_replica_identity": {"table": "v", "identity": {"type": "full"}}},
                {"sql": {"up": "SELECT 1"}},
                {"sql_in_transaction": {"up": "SELECT 1", "down": "SELECT 2"}},
            ],
        });
        let migration = Migration::from_value(value.clone(), None).unwrap();
        assert_eq!(migration.operations.len(), 16);
        assert_eq!(serde_json::to_value(&migration).unwrap(), value);
    }

    #[test]
    fn test_operation_with_two_keys_rejected() {
        let contents = r#"{
            "name": "m",
            "operations": [
                {"drop_table": {"name": "a"}, "drop_index": {"name": "b"}}
            ]
        }"#;
        let err = read_migration(contents, Format::Json, None).unwrap_err();
        assert!(matches!(err, RollError::MultipleOpKeys { index: 0, found: 2 }));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(Format::from_path(Path::new("01_a.json")), Some(Format::Json));
        assert_eq!(Format::from_path(Path::new("01_a.yaml")), Some(Format::Yaml));
        assert_eq!(Format::from_path(Path::new("01_a.yml")), Some(Format::Yaml));
        assert_eq!(Format::from_path(Path::new("01_a.sql")), None);
    }
}

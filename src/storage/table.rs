//! Table definitions for the in-memory engine.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::error::DataError;
use crate::model::{Access, KeyStrategy, ModelSchema};

/// One stored column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub nullable: bool,
}

/// A (possibly composite) uniqueness rule.
///
/// With `nulls_distinct` a row holding a null in any indexed column never
/// conflicts. Without it nulls compare equal, so a composite index over a
/// nullable column allows one row with a null in that position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndex {
    pub name: String,
    pub fields: Vec<String>,
    pub nulls_distinct: bool,
}

/// A column referencing the key of another table. Deletes of referenced
/// rows are restricted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub field: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub key: String,
    pub key_strategy: KeyStrategy,
    pub version: Option<String>,
    pub columns: Vec<Column>,
    pub unique: Vec<UniqueIndex>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// Derive the storage table for a model mapping.
    pub fn from_model(schema: &ModelSchema, key_strategy: KeyStrategy) -> Result<Self, DataError> {
        let key = schema
            .key()
            .ok_or_else(|| DataError::mapping(schema.collection, "<key>", "no key attribute"))?;

        let mut unique = Vec::new();
        let mut foreign_keys = Vec::new();
        let mut columns = Vec::new();
        for mapping in schema.fields {
            columns.push(Column {
                name: mapping.field.to_string(),
                nullable: mapping.nullable,
            });
            if mapping.unique {
                unique.push(UniqueIndex {
                    name: format!("{}_{}_key", schema.collection, mapping.field),
                    fields: vec![mapping.field.to_string()],
                    nulls_distinct: true,
                });
            }
            if let Some(table) = mapping.references {
                foreign_keys.push(ForeignKey {
                    field: mapping.field.to_string(),
                    table: table.to_string(),
                });
            }
        }

        for ignored in schema.ignored_fields {
            columns.push(Column {
                name: ignored.to_string(),
                nullable: true,
            });
        }

        // composite rules treat a null scope like any other value
        for set in schema.unique_together {
            let fields = set
                .iter()
                .map(|attribute| schema.resolve(attribute).map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?;
            unique.push(UniqueIndex {
                name: format!("{}_{}_key", schema.collection, fields.join("_")),
                fields,
                nulls_distinct: false,
            });
        }

        Ok(TableSchema {
            name: schema.collection.to_string(),
            key: key.field.to_string(),
            key_strategy,
            version: schema
                .fields
                .iter()
                .find(|f| f.access == Access::Version)
                .map(|f| f.field.to_string()),
            columns,
            unique,
            foreign_keys,
        })
    }

    /// Add a column the model does not map (see `ignore_fields`).
    pub fn with_column(mut self, name: impl Into<String>, nullable: bool) -> Self {
        self.columns.push(Column {
            name: name.into(),
            nullable,
        });
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns written by the engine rather than the caller.
    pub(crate) fn is_generated(&self, name: &str) -> bool {
        name == self.key || self.version.as_deref() == Some(name)
    }
}

/// Primary key of a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    Int(i64),
    Text(String),
}

impl RowKey {
    pub(crate) fn from_value(table: &str, value: &Value) -> Result<Self, DataError> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(RowKey::Int)
                .ok_or_else(|| DataError::mapping(table, "<key>", format!("unsupported key {}", n))),
            Value::String(s) => Ok(RowKey::Text(s.clone())),
            other => Err(DataError::mapping(
                table,
                "<key>",
                format!("unsupported key {}", other),
            )),
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        match self {
            RowKey::Int(i) => Value::from(*i),
            RowKey::Text(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Int(i) => write!(f, "{}", i),
            RowKey::Text(s) => f.write_str(s),
        }
    }
}

/// Sort order over stored values: nulls first, then by kind.
pub(crate) fn order_values(left: &Value, right: &Value) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => crate::model::compare_values(left, right).unwrap_or(Ordering::Equal),
    }
}

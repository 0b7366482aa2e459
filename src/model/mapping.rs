//! Static attribute <-> storage field mapping.

use std::collections::HashSet;

use super::Row;
use crate::error::DataError;

/// Write access of a mapped attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Storage-generated identity, never written by Save.
    Key,
    /// Storage-managed concurrency counter.
    Version,
    /// Written by Save.
    Mutable,
    /// Written once by Create, never by Save.
    Immutable,
}

/// One attribute <-> storage field pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMapping {
    pub attribute: &'static str,
    pub field: &'static str,
    pub access: Access,
    pub nullable: bool,
    pub unique: bool,
    pub references: Option<&'static str>,
}

/// The complete static mapping of a model type.
#[derive(Debug)]
pub struct ModelSchema {
    pub collection: &'static str,
    pub fields: &'static [FieldMapping],
    /// Composite uniqueness rules, by attribute name.
    pub unique_together: &'static [&'static [&'static str]],
    /// Storage fields intentionally left without an attribute.
    pub ignored_fields: &'static [&'static str],
}

impl ModelSchema {
    pub fn attribute(&self, attribute: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.attribute == attribute)
    }

    pub fn storage_field(&self, field: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.field == field)
    }

    pub fn key(&self) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.access == Access::Key)
    }

    pub fn version(&self) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.access == Access::Version)
    }

    pub fn mutable_fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.fields.iter().filter(|f| f.access == Access::Mutable)
    }

    /// Translate an attribute name to its storage field.
    pub(crate) fn resolve(&self, attribute: &str) -> Result<&'static str, DataError> {
        self.attribute(attribute).map(|f| f.field).ok_or_else(|| {
            DataError::Validation {
                collection: self.collection.to_string(),
                errors: crate::error::ValidationErrors::single(
                    attribute,
                    "is not a mapped attribute",
                ),
            }
        })
    }
}

/// Check the one-to-one mapping invariants of a schema.
///
/// `#[derive(Model)]` enforces these at compile time; this check covers
/// hand-written `Model` impls and runs when a table is registered.
pub fn verify_schema(schema: &ModelSchema) -> Result<(), DataError> {
    let collection = schema.collection;
    let keys = schema.fields.iter().filter(|f| f.access == Access::Key).count();
    if keys != 1 {
        return Err(DataError::mapping(
            collection,
            "<key>",
            format!("expected exactly one key attribute, found {}", keys),
        ));
    }
    if schema
        .fields
        .iter()
        .filter(|f| f.access == Access::Version)
        .count()
        > 1
    {
        return Err(DataError::mapping(
            collection,
            "<version>",
            "more than one version attribute",
        ));
    }

    let mut attributes = HashSet::new();
    let mut fields = HashSet::new();
    for mapping in schema.fields {
        if !attributes.insert(mapping.attribute) {
            return Err(DataError::mapping(
                collection,
                mapping.field,
                format!("attribute `{}` mapped twice", mapping.attribute),
            ));
        }
        if !fields.insert(mapping.field) {
            return Err(DataError::mapping(
                collection,
                mapping.field,
                "storage field mapped by more than one attribute",
            ));
        }
    }

    for ignored in schema.ignored_fields {
        if fields.contains(ignored) {
            return Err(DataError::mapping(
                collection,
                ignored,
                "storage field is both mapped and ignored",
            ));
        }
    }

    for set in schema.unique_together {
        for attribute in *set {
            if !attributes.contains(attribute) {
                return Err(DataError::mapping(
                    collection,
                    attribute,
                    "unique_together names an unmapped attribute",
                ));
            }
        }
    }

    Ok(())
}

/// Reject stored fields that are neither mapped nor explicitly ignored.
pub(crate) fn check_row(schema: &ModelSchema, row: &Row) -> Result<(), DataError> {
    for field in row.keys() {
        let mapped = schema.storage_field(field).is_some();
        let ignored = schema.ignored_fields.iter().any(|i| *i == field.as_str());
        if !mapped && !ignored {
            return Err(DataError::mapping(
                schema.collection,
                field,
                "stored field has no attribute and is not listed in ignore_fields",
            ));
        }
    }
    Ok(())
}

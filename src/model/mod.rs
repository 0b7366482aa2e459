//! Models - in-memory representations of stored ontology concepts.
//!
//! A model is a plain struct whose storage mapping is generated at build time
//! by `#[derive(Model)]`. Instances are never constructed by application
//! code: they come back from a model adapter's `Create`, `Get`, `GetAll`,
//! `Find` or `FindAll`, which hydrate them through a [`Hydration`] token only
//! the storage layer can mint.
//!
//! ## Example
//!
//! ```ignore
//! use modeled_rust::{Model, Create, Get};
//!
//! #[derive(Clone, Debug, Model)]
//! #[model(collection = "offices")]
//! pub struct Office {
//!     #[model(key)]
//!     id: Uuid,
//!     #[model(mutable, non_empty)]
//!     name: String,
//! }
//!
//! let office = offices.create(NewOffice { name: "Cleveland".into() })?;
//! let loaded = offices.get(office.id())?;
//! ```

mod filter;
mod generated;
mod mapping;
mod relation;

use std::fmt;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DataError, ValidationErrors};

pub use filter::Filter;
pub use mapping::{verify_schema, Access, FieldMapping, ModelSchema};
pub use relation::{BelongsTo, Children, HasMany, ParentLink, Relation};

#[doc(hidden)]
pub use generated::__private;

pub(crate) use filter::compare as compare_values;
pub(crate) use mapping::check_row;

/// A stored record: storage field name -> value.
pub type Row = serde_json::Map<String, Value>;

/// How the storage layer generates identities for a key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Random v4 UUID.
    Uuid,
    /// Monotonic per-collection integer sequence starting at 1.
    Sequence,
}

/// Types usable as a storage-generated model identity.
pub trait ModelKey:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const STRATEGY: KeyStrategy;
}

impl ModelKey for Uuid {
    const STRATEGY: KeyStrategy = KeyStrategy::Uuid;
}

impl ModelKey for i64 {
    const STRATEGY: KeyStrategy = KeyStrategy::Sequence;
}

/// Proof that a model is being built from a stored row.
///
/// Only the storage layer can create one, so application code cannot
/// construct "new, unsaved" models through [`Model::hydrate`].
pub struct Hydration {
    _private: (),
}

impl Hydration {
    pub(crate) fn new() -> Self {
        Hydration { _private: () }
    }
}

/// Input accepted by a model adapter's `Create` operation.
///
/// `#[derive(Model)]` generates one per model (`New<Model>`) holding exactly
/// the declared attributes, minus the storage-generated key and version.
pub trait CreateInput: Send + Sync {
    /// Check presence and shape of the inputs before any storage write.
    fn validate(&self) -> Result<(), ValidationErrors>;

    /// Write parameters keyed by storage field name.
    fn into_row(self) -> Result<Row, DataError>;
}

/// Trait for types that represent a stored record.
///
/// Implemented by `#[derive(Model)]`; hand-written impls must uphold the same
/// one-to-one mapping between attributes and storage fields.
pub trait Model: Clone + Send + Sync + Sized + 'static {
    /// The storage-generated identity.
    type Key: ModelKey;

    /// The create-input struct for this model.
    type New: CreateInput;

    /// The static attribute <-> storage field mapping.
    fn schema() -> &'static ModelSchema;

    /// Returns the unique identifier for this model instance.
    fn key(&self) -> &Self::Key;

    /// Build an instance from a stored row.
    fn hydrate(row: &Row, token: Hydration) -> Result<Self, DataError>;

    /// The mutable attributes, keyed by storage field name.
    fn write_set(&self) -> Result<Row, DataError>;

    /// Shape checks on the mutable attributes, run before Save writes them.
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }

    /// The optimistic concurrency version, when the model declares one.
    fn current_version(&self) -> Option<u64> {
        None
    }

    fn set_current_version(&mut self, _version: u64) {}

    /// Back-reference to the loaded collection holding this instance.
    fn parent_link(&self) -> Option<&ParentLink> {
        None
    }

    fn set_parent_link(&mut self, _link: ParentLink) {}

    /// Visit every loaded child for graph saves.
    fn visit_children(
        &mut self,
        _visit: &mut dyn FnMut(&mut dyn GraphNode) -> Result<(), DataError>,
    ) -> Result<(), DataError> {
        Ok(())
    }

    /// The collection name (table, document collection, key prefix).
    fn collection() -> &'static str {
        Self::schema().collection
    }
}

/// Type-erased view of a model used when saving heterogeneous object graphs.
pub trait GraphNode {
    fn node_collection(&self) -> &'static str;
    fn node_key(&self) -> Result<Value, DataError>;
    fn node_write_set(&self) -> Result<Row, DataError>;
    fn node_validate(&self) -> Result<(), DataError>;
    fn node_version(&self) -> Option<u64>;
    fn set_node_version(&mut self, version: u64);
    fn visit_child_nodes(
        &mut self,
        visit: &mut dyn FnMut(&mut dyn GraphNode) -> Result<(), DataError>,
    ) -> Result<(), DataError>;
}

impl<M: Model> GraphNode for M {
    fn node_collection(&self) -> &'static str {
        M::collection()
    }

    fn node_key(&self) -> Result<Value, DataError> {
        key_value::<M>(self.key())
    }

    fn node_write_set(&self) -> Result<Row, DataError> {
        self.write_set()
    }

    fn node_validate(&self) -> Result<(), DataError> {
        self.validate().map_err(|errors| DataError::Validation {
            collection: M::collection().to_string(),
            errors,
        })
    }

    fn node_version(&self) -> Option<u64> {
        self.current_version()
    }

    fn set_node_version(&mut self, version: u64) {
        self.set_current_version(version);
    }

    fn visit_child_nodes(
        &mut self,
        visit: &mut dyn FnMut(&mut dyn GraphNode) -> Result<(), DataError>,
    ) -> Result<(), DataError> {
        self.visit_children(visit)
    }
}

/// Serialize a model key into its stored representation.
pub fn key_value<M: Model>(key: &M::Key) -> Result<Value, DataError> {
    serde_json::to_value(key).map_err(|e| {
        let field = M::schema().key().map(|k| k.field).unwrap_or("<key>");
        DataError::mapping(M::collection(), field, e.to_string())
    })
}

/// A lazy, finite, single-pass sequence of models.
///
/// Rows are fetched when the sequence is created; each row is mapped with the
/// same hydration used by `Get` only when the iterator reaches it.
pub struct Models<M> {
    rows: std::vec::IntoIter<Row>,
    _model: std::marker::PhantomData<fn() -> M>,
}

impl<M: Model> Models<M> {
    pub(crate) fn new(rows: Vec<Row>) -> Self {
        Models {
            rows: rows.into_iter(),
            _model: std::marker::PhantomData,
        }
    }

    /// Remaining rows not yet mapped.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    /// Map every remaining row, stopping at the first mapping error.
    pub fn collect_all(self) -> Result<Vec<M>, DataError> {
        self.collect()
    }
}

impl<M: Model> Iterator for Models<M> {
    type Item = Result<M, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next().map(|row| hydrate_row::<M>(&row))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl<M: Model> ExactSizeIterator for Models<M> {}

/// Hydrate a stored row, rejecting storage fields the mapping does not
/// account for.
pub(crate) fn hydrate_row<M: Model>(row: &Row) -> Result<M, DataError> {
    check_row(M::schema(), row)?;
    M::hydrate(row, Hydration::new())
}

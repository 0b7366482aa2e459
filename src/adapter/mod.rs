//! Model adapters - the intended operations on one model type.
//!
//! Each verb is its own trait. A model's adapter is a trait composed from
//! exactly the verbs that are valid for that model, with a blanket impl so
//! any storage adapter providing those verbs satisfies it:
//!
//! ```ignore
//! model_adapter! {
//!     /// Employees are never enumerated wholesale.
//!     pub trait EmployeeAdapter for Employee: Get, FindAll, Create, Save, Delete
//! }
//!
//! let employees = conn.adapter::<dyn EmployeeAdapter>()?;
//! let ada = employees.create(NewEmployee { name: "Ada".into(), .. })?;
//! ```
//!
//! Verbs never mention storage operations; [`crate::StorageAdapter`] maps
//! them onto the engine.

mod connection;

use serde_json::Value;

use crate::error::DataError;
use crate::model::{Filter, Model, Models};

pub use connection::{Connection, ConnectionBuilder};

/// Fetch one model by key. Absence is `Ok(None)`, never an error.
pub trait Get<M: Model>: Send + Sync {
    fn get(&self, key: &M::Key) -> Result<Option<M>, DataError>;
}

/// Every stored model of the type.
pub trait GetAll<M: Model>: Send + Sync {
    fn get_all(&self) -> Result<Models<M>, DataError>;
}

/// The first model matching a predicate.
pub trait Find<M: Model>: Send + Sync {
    fn find(&self, filter: &Filter) -> Result<Option<M>, DataError>;
}

/// Every model matching a predicate.
pub trait FindAll<M: Model>: Send + Sync {
    fn find_all(&self, filter: &Filter) -> Result<Models<M>, DataError>;
}

/// Validate inputs, store a new record and return it hydrated. No model
/// is returned on any failure.
pub trait Create<M: Model>: Send + Sync {
    fn create(&self, input: M::New) -> Result<M, DataError>;
}

/// Persist the mutable attributes of a model.
pub trait Save<M: Model>: Send + Sync {
    fn save(&self, model: &mut M) -> Result<(), DataError>;
}

/// Remove a model's record. A model loaded through a parent's collection
/// also leaves that collection.
pub trait Delete<M: Model>: Send + Sync {
    fn delete(&self, model: M) -> Result<(), DataError>;
}

/// Save a model and every loaded descendant, parent first.
pub trait SaveGraph<M: Model>: Save<M> {
    fn save_graph(&self, model: &mut M) -> Result<(), DataError>;
}

/// Lookups used by lazily loaded relations.
pub trait LoadRelated<M: Model>: Send + Sync {
    fn load_by_key(&self, key: &Value) -> Result<Option<M>, DataError>;

    fn load_by_field(
        &self,
        attribute: &str,
        value: &Value,
        order_by: Option<&str>,
    ) -> Result<Vec<M>, DataError>;
}

/// Declare a per-model adapter trait from a list of verbs, with a blanket
/// impl for every type providing them.
#[macro_export]
macro_rules! model_adapter {
    ($(#[$meta:meta])* $vis:vis trait $name:ident for $model:ty : $($verb:ident),+ $(,)?) => {
        $(#[$meta])*
        $vis trait $name: $($crate::$verb<$model> +)+ Send + Sync {}

        impl<T: ?Sized + $($crate::$verb<$model> +)+ Send + Sync> $name for T {}
    };
}

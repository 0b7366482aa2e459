use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::DataError;

struct Registered {
    name: &'static str,
    adapter: Box<dyn Any + Send + Sync>,
}

/// A fixed set of model adapters, indexed by adapter trait.
///
/// Built once by a composition root and read-only afterwards. It says
/// nothing about which stores back the adapters or how many there are.
pub struct Connection {
    adapters: HashMap<TypeId, Registered>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }

    /// The adapter registered for `A`, usually a trait object such as
    /// `dyn EmployeeAdapter`.
    pub fn adapter<A>(&self) -> Result<Arc<A>, DataError>
    where
        A: ?Sized + Send + Sync + 'static,
    {
        self.adapters
            .get(&TypeId::of::<A>())
            .and_then(|registered| registered.adapter.downcast_ref::<Arc<A>>())
            .cloned()
            .ok_or(DataError::AdapterNotRegistered(type_name::<A>()))
    }

    pub fn has_adapter<A>(&self) -> bool
    where
        A: ?Sized + Send + Sync + 'static,
    {
        self.adapters.contains_key(&TypeId::of::<A>())
    }

    /// Names of the registered adapter interfaces, sorted.
    pub fn adapter_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.adapters.values().map(|r| r.name).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("adapters", &self.adapter_names())
            .finish()
    }
}

#[derive(Default)]
pub struct ConnectionBuilder {
    adapters: HashMap<TypeId, Registered>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<A>(mut self, adapter: Arc<A>) -> Self
    where
        A: ?Sized + Send + Sync + 'static,
    {
        self.register(adapter);
        self
    }

    /// Register an adapter under interface `A`. A later registration for
    /// the same interface replaces the earlier one.
    pub fn register<A>(&mut self, adapter: Arc<A>) -> &mut Self
    where
        A: ?Sized + Send + Sync + 'static,
    {
        let name = type_name::<A>();
        let previous = self.adapters.insert(
            TypeId::of::<A>(),
            Registered {
                name,
                adapter: Box::new(adapter),
            },
        );
        if previous.is_some() {
            tracing::warn!(adapter = name, "replaced adapter registration");
        }
        self
    }

    pub fn build(self) -> Connection {
        tracing::debug!(adapters = self.adapters.len(), "built connection");
        Connection {
            adapters: self.adapters,
        }
    }
}

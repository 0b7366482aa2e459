//! `StorageAdapter<M>`: every adapter verb, mapped onto the table engine.

use std::marker::PhantomData;

use serde_json::Value;

use super::pool::{Handle, Pool};
use crate::adapter::{Create, Delete, Find, FindAll, Get, GetAll, LoadRelated, Save, SaveGraph};
use crate::config::StorageOptions;
use crate::error::DataError;
use crate::model::{hydrate_row, key_value, CreateInput, Filter, GraphNode, Model, Models};

/// Storage adapter for one model type.
///
/// Handles are drawn from the store's pool per call and released on every
/// exit path. Models only ever come back hydrated from a stored row.
pub struct StorageAdapter<M> {
    pool: Pool,
    options: StorageOptions,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> StorageAdapter<M> {
    pub(crate) fn new(pool: Pool, options: StorageOptions) -> Self {
        StorageAdapter {
            pool,
            options,
            _model: PhantomData,
        }
    }

    /// Run `work` inside one transaction when the backend supports it.
    fn transactionally<T>(
        &self,
        handle: &mut Handle,
        work: impl FnOnce(&mut Handle) -> Result<T, DataError>,
    ) -> Result<T, DataError> {
        if !self.options.transactions {
            return work(handle);
        }
        handle.begin()?;
        match work(handle) {
            Ok(value) => {
                handle.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = handle.rollback() {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl<M: Model> Get<M> for StorageAdapter<M> {
    fn get(&self, key: &M::Key) -> Result<Option<M>, DataError> {
        let key = key_value::<M>(key)?;
        self.load_by_key(&key)
    }
}

impl<M: Model> GetAll<M> for StorageAdapter<M> {
    fn get_all(&self) -> Result<Models<M>, DataError> {
        self.find_all(&Filter::All)
    }
}

impl<M: Model> Find<M> for StorageAdapter<M> {
    fn find(&self, filter: &Filter) -> Result<Option<M>, DataError> {
        let mut models = self.find_all(filter)?;
        models.next().transpose()
    }
}

impl<M: Model> FindAll<M> for StorageAdapter<M> {
    fn find_all(&self, filter: &Filter) -> Result<Models<M>, DataError> {
        let resolved = filter.resolve(M::schema())?;
        let rows = self
            .pool
            .acquire()?
            .scan(M::collection(), &resolved, None)?;
        Ok(Models::new(rows))
    }
}

impl<M: Model> Create<M> for StorageAdapter<M> {
    fn create(&self, input: M::New) -> Result<M, DataError> {
        let collection = M::collection();
        if let Err(errors) = input.validate() {
            tracing::debug!(collection, %errors, "rejected create input");
            return Err(DataError::Validation {
                collection: collection.to_string(),
                errors,
            });
        }
        let values = input.into_row()?;
        let returning = self.options.returning;

        let mut handle = self.pool.acquire()?;
        self.transactionally(&mut handle, |handle| {
            let inserted = handle.insert(collection, values, returning)?;
            let row = match inserted.row {
                Some(row) => row,
                None => handle
                    .select(collection, &inserted.key)?
                    .ok_or_else(|| DataError::NoRowsAffected {
                        collection: collection.to_string(),
                    })?,
            };
            hydrate_row::<M>(&row)
        })
    }
}

impl<M: Model> Save<M> for StorageAdapter<M> {
    fn save(&self, model: &mut M) -> Result<(), DataError> {
        model.node_validate()?;
        let key = key_value::<M>(model.key())?;
        let changes = model.write_set()?;
        let version = self
            .pool
            .acquire()?
            .update(M::collection(), &key, &changes, model.current_version())?;
        if let Some(version) = version {
            model.set_current_version(version);
        }
        Ok(())
    }
}

impl<M: Model> Delete<M> for StorageAdapter<M> {
    fn delete(&self, model: M) -> Result<(), DataError> {
        let key = key_value::<M>(model.key())?;
        self.pool
            .acquire()?
            .delete(M::collection(), &key, model.current_version())?;
        if let Some(link) = model.parent_link() {
            if link.detach(&key) {
                tracing::debug!(collection = M::collection(), key = %key, "removed from loaded parent collection");
            }
        }
        Ok(())
    }
}

/// One pending node write collected from a graph.
struct NodeWrite {
    collection: &'static str,
    key: Value,
    changes: crate::model::Row,
    version: Option<u64>,
}

fn collect_writes(node: &mut dyn GraphNode, out: &mut Vec<NodeWrite>) -> Result<(), DataError> {
    node.node_validate()?;
    out.push(NodeWrite {
        collection: node.node_collection(),
        key: node.node_key()?,
        changes: node.node_write_set()?,
        version: node.node_version(),
    });
    node.visit_child_nodes(&mut |child| collect_writes(child, out))
}

fn apply_versions(
    node: &mut dyn GraphNode,
    versions: &mut std::vec::IntoIter<Option<u64>>,
) -> Result<(), DataError> {
    match versions.next() {
        Some(Some(version)) => node.set_node_version(version),
        Some(None) => {}
        None => return Ok(()),
    }
    node.visit_child_nodes(&mut |child| apply_versions(child, versions))
}

impl<M: Model> SaveGraph<M> for StorageAdapter<M> {
    fn save_graph(&self, model: &mut M) -> Result<(), DataError> {
        let mut writes = Vec::new();
        collect_writes(model, &mut writes)?;

        let mut handle = self.pool.acquire()?;
        let mut versions = Vec::with_capacity(writes.len());
        let outcome = self.transactionally(&mut handle, |handle| {
            for write in &writes {
                let version =
                    handle.update(write.collection, &write.key, &write.changes, write.version)?;
                versions.push(version);
            }
            Ok(())
        });

        // Inside a transaction nothing landed unless everything did.
        if outcome.is_err() && self.options.transactions {
            versions.clear();
        }
        tracing::debug!(
            collection = M::collection(),
            nodes = writes.len(),
            saved = versions.len(),
            "graph save"
        );
        apply_versions(model, &mut versions.into_iter())?;
        outcome
    }
}

impl<M: Model> LoadRelated<M> for StorageAdapter<M> {
    fn load_by_key(&self, key: &Value) -> Result<Option<M>, DataError> {
        let row = self.pool.acquire()?.select(M::collection(), key)?;
        row.as_ref().map(hydrate_row::<M>).transpose()
    }

    fn load_by_field(
        &self,
        attribute: &str,
        value: &Value,
        order_by: Option<&str>,
    ) -> Result<Vec<M>, DataError> {
        let schema = M::schema();
        let filter = Filter::Eq(schema.resolve(attribute)?.to_string(), value.clone());
        let order_by = order_by.map(|attr| schema.resolve(attr)).transpose()?;
        let rows = self
            .pool
            .acquire()?
            .scan(M::collection(), &filter, order_by)?;
        Models::<M>::new(rows).collect()
    }
}

use std::sync::Arc;

use super::adapter::StorageAdapter;
use super::database::MemoryDatabase;
use super::pool::Pool;
use super::table::TableSchema;
use crate::config::{StorageOptions, StoreConfig};
use crate::error::DataError;
use crate::model::{verify_schema, Model, ModelKey};

/// The embedded table engine plus its handle pool.
///
/// Register each model once at startup, then hand its adapter to a
/// [`crate::ConnectionBuilder`].
///
/// ```ignore
/// let store = MemoryStore::new(&StoreConfig::default());
/// let offices = store.register::<Office>()?;
/// let conn = Connection::builder()
///     .with::<dyn OfficeAdapter>(offices.clone())
///     .with::<dyn LoadRelated<Office>>(offices)
///     .build();
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    database: Arc<MemoryDatabase>,
    pool: Pool,
    options: StorageOptions,
}

impl MemoryStore {
    pub fn new(config: &StoreConfig) -> Self {
        let database = Arc::new(MemoryDatabase::new());
        let pool = Pool::new(Arc::clone(&database), &config.pool);
        MemoryStore {
            database,
            pool,
            options: config.storage,
        }
    }

    /// Create the table for `M` and return its adapter. Tables referenced
    /// by foreign keys must be registered first.
    pub fn register<M: Model>(&self) -> Result<Arc<StorageAdapter<M>>, DataError> {
        verify_schema(M::schema())?;
        let table = TableSchema::from_model(M::schema(), <M::Key as ModelKey>::STRATEGY)?;
        self.create_table(table)?;
        Ok(self.adapter::<M>())
    }

    /// Create a table directly, e.g. one carrying columns no model maps.
    pub fn create_table(&self, table: TableSchema) -> Result<(), DataError> {
        self.database.create_table(table)
    }

    pub fn adapter<M: Model>(&self) -> Arc<StorageAdapter<M>> {
        Arc::new(StorageAdapter::new(self.pool.clone(), self.options))
    }

    pub fn row_count(&self, collection: &str) -> Result<usize, DataError> {
        self.database.row_count(collection)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn options(&self) -> StorageOptions {
        self.options
    }
}

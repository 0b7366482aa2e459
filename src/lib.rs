extern crate self as modeled_rust;

mod adapter;
mod config;
mod error;
mod model;
pub mod security;
mod storage;

pub use adapter::{
    Connection, ConnectionBuilder, Create, Delete, Find, FindAll, Get, GetAll, LoadRelated, Save,
    SaveGraph,
};
pub use config::{ConfigError, PoolConfig, SecurityConfig, StorageOptions, StoreConfig};
pub use error::{ConnectivityError, DataError, FieldError, ValidationErrors};
pub use model::{
    key_value, verify_schema, Access, BelongsTo, Children, CreateInput, FieldMapping, Filter,
    GraphNode, HasMany, Hydration, KeyStrategy, Model, ModelKey, ModelSchema, Models, ParentLink,
    Relation, Row,
};
pub use security::{install_security, Privilege, ScopeMatching};
pub use storage::{
    Column, ForeignKey, Handle, Inserted, MemoryDatabase, MemoryStore, Pool, PoolStatus,
    PooledHandle, RowKey, StorageAdapter, TableSchema, UniqueIndex,
};

#[doc(hidden)]
pub use model::__private;

// Derives share their trait's name; they live in the macro namespace.
pub use modeled_rust_macros::{Model, Privilege};

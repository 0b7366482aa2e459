//! Storage layer: an embedded table engine with constraints and
//! transactions, a bounded handle pool, and the storage adapter that maps
//! model verbs onto it.

mod adapter;
mod database;
mod pool;
mod store;
mod table;

pub use adapter::StorageAdapter;
pub use database::MemoryDatabase;
pub use pool::{Handle, Inserted, Pool, PoolStatus, PooledHandle};
pub use store::MemoryStore;
pub use table::{Column, ForeignKey, RowKey, TableSchema, UniqueIndex};

//! The in-memory table engine: tables, constraints and the transaction log.
//!
//! Committed rows live in one [`DatabaseState`]. An open transaction keeps
//! only its own writes in a [`Pending`] layer and reads through it, so its
//! cost is proportional to what it touches rather than to the database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use uuid::Uuid;

use super::table::{order_values, RowKey, TableSchema, UniqueIndex};
use crate::error::{ConnectivityError, DataError};
use crate::model::{Filter, KeyStrategy, Row};

/// Shared state of every table, guarded as one unit so a transaction can be
/// committed atomically.
pub struct MemoryDatabase {
    state: RwLock<DatabaseState>,
    sequences: Mutex<HashMap<String, i64>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        MemoryDatabase {
            state: RwLock::new(DatabaseState::default()),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Create a table. Re-creating an identical table is a no-op.
    pub fn create_table(&self, schema: TableSchema) -> Result<(), DataError> {
        let mut state = self.write()?;
        if let Some(existing) = state.tables.get(&schema.name) {
            if existing.schema == schema {
                return Ok(());
            }
            return Err(DataError::mapping(
                &schema.name,
                "<table>",
                "table already exists with a different definition",
            ));
        }

        for field in std::iter::once(&schema.key)
            .chain(schema.version.iter())
            .chain(schema.unique.iter().flat_map(|u| u.fields.iter()))
            .chain(schema.foreign_keys.iter().map(|fk| &fk.field))
        {
            if schema.column(field).is_none() {
                return Err(DataError::mapping(&schema.name, field, "no such column"));
            }
        }
        for fk in &schema.foreign_keys {
            if fk.table != schema.name && !state.tables.contains_key(&fk.table) {
                return Err(DataError::UnknownCollection(fk.table.clone()));
            }
        }

        tracing::debug!(table = %schema.name, columns = schema.columns.len(), "created table");
        state.tables.insert(schema.name.clone(), Table::new(schema));
        Ok(())
    }

    pub fn row_count(&self, table: &str) -> Result<usize, DataError> {
        Ok(self.read()?.table(table)?.rows.len())
    }

    /// Generate the next key for a table. Sequences are not transactional:
    /// a rolled-back insert still consumes its value.
    pub(crate) fn next_key(&self, table: &str) -> Result<Value, DataError> {
        let strategy = self.read()?.table(table)?.schema.key_strategy;
        match strategy {
            KeyStrategy::Uuid => Ok(Value::from(Uuid::new_v4().to_string())),
            KeyStrategy::Sequence => {
                let mut sequences = self
                    .sequences
                    .lock()
                    .map_err(|_| ConnectivityError::Poisoned("sequence"))?;
                let next = sequences.entry(table.to_string()).or_insert(0);
                *next += 1;
                Ok(Value::from(*next))
            }
        }
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, DatabaseState>, DataError> {
        self.state
            .read()
            .map_err(|_| ConnectivityError::Poisoned("database read").into())
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, DatabaseState>, DataError> {
        self.state
            .write()
            .map_err(|_| ConnectivityError::Poisoned("database write").into())
    }

    /// Replay a transaction's write log against the committed tables,
    /// rechecking every constraint. On the first failure the writes already
    /// replayed are undone, so either every write lands or none.
    pub(crate) fn apply(&self, log: &[WriteOp]) -> Result<(), DataError> {
        let mut state = self.write()?;
        let mut undo = Vec::with_capacity(log.len());
        for op in log {
            if let Err(err) = state.replay(op, &mut undo) {
                state.revert(undo);
                return Err(err);
            }
        }
        Ok(())
    }
}

/// A write recorded inside a transaction.
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Insert {
        table: String,
        row: Row,
    },
    Update {
        table: String,
        key: RowKey,
        changes: Row,
        expected_version: Option<u64>,
    },
    Delete {
        table: String,
        key: RowKey,
        expected_version: Option<u64>,
    },
}

/// The prior content of a row touched while replaying a log.
struct Undo {
    table: String,
    key: RowKey,
    row: Option<Row>,
}

#[derive(Debug)]
struct Table {
    schema: TableSchema,
    rows: BTreeMap<RowKey, Row>,
    /// Per unique index, encoded indexed values and the row holding them.
    unique: Vec<HashMap<String, RowKey>>,
}

impl Table {
    fn new(schema: TableSchema) -> Self {
        let unique = schema.unique.iter().map(|_| HashMap::new()).collect();
        Table {
            schema,
            rows: BTreeMap::new(),
            unique,
        }
    }

    /// Store `row` under `key`, returning the row it replaced.
    fn put(&mut self, key: RowKey, row: Row) -> Option<Row> {
        let previous = self.remove(&key);
        for (index, entries) in self.schema.unique.iter().zip(&mut self.unique) {
            if let Some(encoded) = index_key(index, &row) {
                entries.insert(encoded, key.clone());
            }
        }
        self.rows.insert(key, row);
        previous
    }

    fn remove(&mut self, key: &RowKey) -> Option<Row> {
        let row = self.rows.remove(key)?;
        for (index, entries) in self.schema.unique.iter().zip(&mut self.unique) {
            if let Some(encoded) = index_key(index, &row) {
                if entries.get(&encoded) == Some(key) {
                    entries.remove(&encoded);
                }
            }
        }
        Some(row)
    }
}

/// The values `row` holds under `index`, encoded for lookup. `None` when a
/// null exempts the row from a nulls-distinct index.
fn index_key(index: &UniqueIndex, row: &Row) -> Option<String> {
    let values: Vec<Value> = index
        .fields
        .iter()
        .map(|f| row.get(f).cloned().unwrap_or(Value::Null))
        .collect();
    if index.nulls_distinct && values.iter().any(Value::is_null) {
        return None;
    }
    Some(Value::Array(values).to_string())
}

/// Read access to rows for constraint checks and queries.
pub(crate) trait RowSource {
    fn table_schema(&self, table: &str) -> Result<&TableSchema, DataError>;

    fn schemas(&self) -> Vec<&TableSchema>;

    fn row(&self, table: &str, key: &RowKey) -> Result<Option<&Row>, DataError>;

    /// Every row of `table`, in no particular order.
    fn rows<'s>(
        &'s self,
        table: &str,
    ) -> Result<Box<dyn Iterator<Item = (&'s RowKey, &'s Row)> + 's>, DataError>;

    /// Whether a row other than `key` holds `encoded` under unique index
    /// number `index` of `table`.
    fn holds_unique(&self, table: &str, index: usize, encoded: &str, key: &RowKey) -> Result<bool, DataError>;

    fn select(&self, table: &str, key: &RowKey) -> Result<Option<Row>, DataError> {
        Ok(self.row(table, key)?.cloned())
    }

    /// Rows matching a storage-level filter, in key order unless `order_by`
    /// names a column.
    fn scan(&self, table: &str, filter: &Filter, order_by: Option<&str>) -> Result<Vec<Row>, DataError> {
        let schema = self.table_schema(table)?;
        if let Some(column) = order_by {
            if schema.column(column).is_none() {
                return Err(DataError::mapping(table, column, "no such column"));
            }
        }
        let mut matched: Vec<(&RowKey, &Row)> = self
            .rows(table)?
            .filter(|(_, row)| filter.matches(row))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(b.0));
        if let Some(column) = order_by {
            matched.sort_by(|(_, a), (_, b)| {
                order_values(
                    a.get(column).unwrap_or(&Value::Null),
                    b.get(column).unwrap_or(&Value::Null),
                )
            });
        }
        Ok(matched.into_iter().map(|(_, row)| row.clone()).collect())
    }
}

/// Committed rows of every table.
#[derive(Debug, Default)]
pub(crate) struct DatabaseState {
    tables: HashMap<String, Table>,
}

impl DatabaseState {
    fn table(&self, name: &str) -> Result<&Table, DataError> {
        self.tables
            .get(name)
            .ok_or_else(|| DataError::UnknownCollection(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, DataError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DataError::UnknownCollection(name.to_string()))
    }

    /// Insert a new row under a pre-generated key. Returns the stored row.
    pub(crate) fn insert(&mut self, table: &str, row: Row, key: Value) -> Result<Row, DataError> {
        let (key, row) = prepare_insert(&*self, table, row, key)?;
        self.table_mut(table)?.put(key, row.clone());
        Ok(row)
    }

    /// Apply `changes` to an existing row, returning the new version.
    pub(crate) fn update(
        &mut self,
        table: &str,
        key: &RowKey,
        changes: &Row,
        expected_version: Option<u64>,
    ) -> Result<Option<u64>, DataError> {
        let (next, version) = prepare_update(&*self, table, key, changes, expected_version)?;
        self.table_mut(table)?.put(key.clone(), next);
        Ok(version)
    }

    pub(crate) fn delete(
        &mut self,
        table: &str,
        key: &RowKey,
        expected_version: Option<u64>,
    ) -> Result<(), DataError> {
        prepare_delete(&*self, table, key, expected_version)?;
        self.table_mut(table)?.remove(key);
        Ok(())
    }

    fn replay(&mut self, op: &WriteOp, undo: &mut Vec<Undo>) -> Result<(), DataError> {
        match op {
            WriteOp::Insert { table, row } => {
                let key_field = &self.table(table)?.schema.key;
                let key = RowKey::from_value(table, row.get(key_field).unwrap_or(&Value::Null))?;
                check_new(&*self, table, &key, row)?;
                let previous = self.table_mut(table)?.put(key.clone(), row.clone());
                undo.push(Undo {
                    table: table.clone(),
                    key,
                    row: previous,
                });
            }
            WriteOp::Update {
                table,
                key,
                changes,
                expected_version,
            } => {
                let (next, _) = prepare_update(&*self, table, key, changes, *expected_version)?;
                let previous = self.table_mut(table)?.put(key.clone(), next);
                undo.push(Undo {
                    table: table.clone(),
                    key: key.clone(),
                    row: previous,
                });
            }
            WriteOp::Delete {
                table,
                key,
                expected_version,
            } => {
                prepare_delete(&*self, table, key, *expected_version)?;
                let previous = self.table_mut(table)?.remove(key);
                undo.push(Undo {
                    table: table.clone(),
                    key: key.clone(),
                    row: previous,
                });
            }
        }
        Ok(())
    }

    fn revert(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            if let Some(table) = self.tables.get_mut(&step.table) {
                match step.row {
                    Some(row) => {
                        table.put(step.key, row);
                    }
                    None => {
                        table.remove(&step.key);
                    }
                }
            }
        }
    }
}

impl RowSource for DatabaseState {
    fn table_schema(&self, table: &str) -> Result<&TableSchema, DataError> {
        Ok(&self.table(table)?.schema)
    }

    fn schemas(&self) -> Vec<&TableSchema> {
        self.tables.values().map(|t| &t.schema).collect()
    }

    fn row(&self, table: &str, key: &RowKey) -> Result<Option<&Row>, DataError> {
        Ok(self.table(table)?.rows.get(key))
    }

    fn rows<'s>(
        &'s self,
        table: &str,
    ) -> Result<Box<dyn Iterator<Item = (&'s RowKey, &'s Row)> + 's>, DataError> {
        Ok(Box::new(self.table(table)?.rows.iter()))
    }

    fn holds_unique(&self, table: &str, index: usize, encoded: &str, key: &RowKey) -> Result<bool, DataError> {
        let holder = self
            .table(table)?
            .unique
            .get(index)
            .and_then(|entries| entries.get(encoded));
        Ok(holder.map_or(false, |holder| holder != key))
    }
}

/// Writes of an open transaction, invisible to other handles until
/// commit. `None` marks a deleted row.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    tables: HashMap<String, BTreeMap<RowKey, Option<Row>>>,
}

impl Pending {
    /// The committed state as this transaction sees it.
    pub(crate) fn over<'a>(&'a self, base: &'a DatabaseState) -> Staged<'a> {
        Staged {
            base,
            pending: self,
        }
    }

    pub(crate) fn insert(
        &mut self,
        base: &DatabaseState,
        table: &str,
        row: Row,
        key: Value,
    ) -> Result<Row, DataError> {
        let (key, row) = prepare_insert(&self.over(base), table, row, key)?;
        self.entries(table).insert(key, Some(row.clone()));
        Ok(row)
    }

    pub(crate) fn update(
        &mut self,
        base: &DatabaseState,
        table: &str,
        key: &RowKey,
        changes: &Row,
        expected_version: Option<u64>,
    ) -> Result<Option<u64>, DataError> {
        let (next, version) = prepare_update(&self.over(base), table, key, changes, expected_version)?;
        self.entries(table).insert(key.clone(), Some(next));
        Ok(version)
    }

    pub(crate) fn delete(
        &mut self,
        base: &DatabaseState,
        table: &str,
        key: &RowKey,
        expected_version: Option<u64>,
    ) -> Result<(), DataError> {
        prepare_delete(&self.over(base), table, key, expected_version)?;
        self.entries(table).insert(key.clone(), None);
        Ok(())
    }

    fn entries(&mut self, table: &str) -> &mut BTreeMap<RowKey, Option<Row>> {
        self.tables.entry(table.to_string()).or_default()
    }
}

/// Committed rows seen through a transaction's pending writes.
pub(crate) struct Staged<'a> {
    base: &'a DatabaseState,
    pending: &'a Pending,
}

impl RowSource for Staged<'_> {
    fn table_schema(&self, table: &str) -> Result<&TableSchema, DataError> {
        self.base.table_schema(table)
    }

    fn schemas(&self) -> Vec<&TableSchema> {
        self.base.schemas()
    }

    fn row(&self, table: &str, key: &RowKey) -> Result<Option<&Row>, DataError> {
        match self.pending.tables.get(table).and_then(|p| p.get(key)) {
            Some(staged) => Ok(staged.as_ref()),
            None => self.base.row(table, key),
        }
    }

    fn rows<'s>(
        &'s self,
        table: &str,
    ) -> Result<Box<dyn Iterator<Item = (&'s RowKey, &'s Row)> + 's>, DataError> {
        let committed = self.base.table(table)?.rows.iter();
        let Some(pending) = self.pending.tables.get(table) else {
            return Ok(Box::new(committed));
        };
        let committed = committed.filter(move |(key, _)| !pending.contains_key(*key));
        let staged = pending
            .iter()
            .filter_map(|(key, row)| row.as_ref().map(|row| (key, row)));
        Ok(Box::new(committed.chain(staged)))
    }

    fn holds_unique(&self, table: &str, index: usize, encoded: &str, key: &RowKey) -> Result<bool, DataError> {
        let Some(rule) = self.base.table_schema(table)?.unique.get(index) else {
            return Ok(false);
        };
        let pending = self.pending.tables.get(table);
        if let Some(pending) = pending {
            let staged = pending.iter().any(|(other, row)| {
                other != key
                    && row
                        .as_ref()
                        .and_then(|row| index_key(rule, row))
                        .map_or(false, |held| held == encoded)
            });
            if staged {
                return Ok(true);
            }
        }
        let holder = self
            .base
            .table(table)?
            .unique
            .get(index)
            .and_then(|entries| entries.get(encoded));
        // a committed holder rewritten or deleted here was checked above
        Ok(holder.map_or(false, |holder| {
            holder != key && pending.map_or(true, |p| !p.contains_key(holder))
        }))
    }
}

/// Fill defaults and generated columns of a new row, then check it.
fn prepare_insert(
    src: &impl RowSource,
    table: &str,
    mut row: Row,
    key: Value,
) -> Result<(RowKey, Row), DataError> {
    let schema = src.table_schema(table)?;
    for field in row.keys() {
        if schema.column(field).is_none() {
            return Err(DataError::mapping(table, field, "no such column"));
        }
        if schema.is_generated(field) {
            return Err(DataError::mapping(table, field, "column is generated by storage"));
        }
    }
    for column in &schema.columns {
        row.entry(column.name.clone()).or_insert(Value::Null);
    }
    let row_key = RowKey::from_value(table, &key)?;
    row.insert(schema.key.clone(), key);
    if let Some(version) = &schema.version {
        row.insert(version.clone(), Value::from(1u64));
    }
    check_new(src, table, &row_key, &row)?;
    Ok((row_key, row))
}

fn check_new(src: &impl RowSource, table: &str, key: &RowKey, row: &Row) -> Result<(), DataError> {
    if src.row(table, key)?.is_some() {
        return Err(DataError::constraint(
            table,
            format!("{}_pkey", table),
            format!("key {} already exists", key),
        ));
    }
    check_row(src, table, key, row)
}

/// The row `changes` would produce, and its new version.
fn prepare_update(
    src: &impl RowSource,
    table: &str,
    key: &RowKey,
    changes: &Row,
    expected_version: Option<u64>,
) -> Result<(Row, Option<u64>), DataError> {
    let schema = src.table_schema(table)?;
    let current = src.row(table, key)?.ok_or_else(|| DataError::NotFound {
        collection: table.to_string(),
        key: key.to_string(),
    })?;
    for field in changes.keys() {
        if schema.column(field).is_none() {
            return Err(DataError::mapping(table, field, "no such column"));
        }
        if schema.is_generated(field) {
            return Err(DataError::mapping(table, field, "column is generated by storage"));
        }
    }

    let version = match &schema.version {
        Some(column) => {
            let actual = current.get(column).and_then(Value::as_u64).unwrap_or(0);
            if let Some(expected) = expected_version {
                if expected != actual {
                    return Err(DataError::ConcurrencyConflict {
                        collection: table.to_string(),
                        key: key.to_string(),
                        expected,
                        actual,
                    });
                }
            }
            Some((column.clone(), actual + 1))
        }
        None => None,
    };

    let mut next = current.clone();
    for (field, value) in changes {
        next.insert(field.clone(), value.clone());
    }
    if let Some((column, v)) = &version {
        next.insert(column.clone(), Value::from(*v));
    }
    check_row(src, table, key, &next)?;
    Ok((next, version.map(|(_, v)| v)))
}

fn prepare_delete(
    src: &impl RowSource,
    table: &str,
    key: &RowKey,
    expected_version: Option<u64>,
) -> Result<(), DataError> {
    let schema = src.table_schema(table)?;
    let current = src.row(table, key)?.ok_or_else(|| DataError::NotFound {
        collection: table.to_string(),
        key: key.to_string(),
    })?;
    if let (Some(column), Some(expected)) = (&schema.version, expected_version) {
        let actual = current.get(column).and_then(Value::as_u64).unwrap_or(0);
        if expected != actual {
            return Err(DataError::ConcurrencyConflict {
                collection: table.to_string(),
                key: key.to_string(),
                expected,
                actual,
            });
        }
    }

    let key_value = key.to_value();
    for other in src.schemas() {
        for fk in other.foreign_keys.iter().filter(|fk| fk.table == table) {
            let referenced = src
                .rows(&other.name)?
                .any(|(_, row)| row.get(&fk.field) == Some(&key_value));
            if referenced {
                return Err(DataError::constraint(
                    table,
                    format!("{}_{}_fkey", other.name, fk.field),
                    format!("{} is still referenced from {}", key, other.name),
                ));
            }
        }
    }
    Ok(())
}

/// Not-null, unique and foreign key checks for a candidate row.
fn check_row(src: &impl RowSource, table: &str, key: &RowKey, row: &Row) -> Result<(), DataError> {
    let schema = src.table_schema(table)?;

    for column in schema.columns.iter().filter(|c| !c.nullable) {
        if row.get(&column.name).map_or(true, Value::is_null) {
            return Err(DataError::constraint(
                table,
                format!("{}_{}_not_null", table, column.name),
                format!("null value in column `{}`", column.name),
            ));
        }
    }

    for (position, index) in schema.unique.iter().enumerate() {
        let Some(encoded) = index_key(index, row) else {
            continue;
        };
        if src.holds_unique(table, position, &encoded, key)? {
            return Err(DataError::constraint(
                table,
                index.name.clone(),
                format!("duplicate value for ({})", index.fields.join(", ")),
            ));
        }
    }

    for fk in &schema.foreign_keys {
        let value = row.get(&fk.field).unwrap_or(&Value::Null);
        if value.is_null() {
            continue;
        }
        let target = RowKey::from_value(&fk.table, value)?;
        let exists = (fk.table == table && &target == key) || src.row(&fk.table, &target)?.is_some();
        if !exists {
            return Err(DataError::constraint(
                table,
                format!("{}_{}_fkey", table, fk.field),
                format!("{} references missing {} {}", fk.field, fk.table, target),
            ));
        }
    }
    Ok(())
}

//! Dynamic predicates for `Find` / `FindAll`, expressed over attribute names.

use std::cmp::Ordering;

use serde_json::Value;

use super::{ModelSchema, Row};
use crate::error::DataError;

/// A predicate over model attributes.
///
/// Filters name attributes, never storage fields; the storage adapter
/// translates them through the model's mapping before evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(attribute.into(), value.into())
    }

    pub fn ne(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(attribute.into(), value.into())
    }

    pub fn lt(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(attribute.into(), value.into())
    }

    pub fn le(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Le(attribute.into(), value.into())
    }

    pub fn gt(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(attribute.into(), value.into())
    }

    pub fn ge(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ge(attribute.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(
        attribute: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::In(attribute.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(attribute: impl Into<String>) -> Self {
        Filter::IsNull(attribute.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::All => other,
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            filter => Filter::And(vec![filter, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut filters) => {
                filters.push(other);
                Filter::Or(filters)
            }
            filter => Filter::Or(vec![filter, other]),
        }
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Rewrite attribute names into storage field names.
    pub(crate) fn resolve(&self, schema: &ModelSchema) -> Result<Filter, DataError> {
        let field = |attribute: &str| schema.resolve(attribute).map(str::to_string);
        Ok(match self {
            Filter::All => Filter::All,
            Filter::Eq(a, v) => Filter::Eq(field(a)?, v.clone()),
            Filter::Ne(a, v) => Filter::Ne(field(a)?, v.clone()),
            Filter::Lt(a, v) => Filter::Lt(field(a)?, v.clone()),
            Filter::Le(a, v) => Filter::Le(field(a)?, v.clone()),
            Filter::Gt(a, v) => Filter::Gt(field(a)?, v.clone()),
            Filter::Ge(a, v) => Filter::Ge(field(a)?, v.clone()),
            Filter::In(a, vs) => Filter::In(field(a)?, vs.clone()),
            Filter::IsNull(a) => Filter::IsNull(field(a)?),
            Filter::And(fs) => Filter::And(
                fs.iter()
                    .map(|f| f.resolve(schema))
                    .collect::<Result<_, _>>()?,
            ),
            Filter::Or(fs) => Filter::Or(
                fs.iter()
                    .map(|f| f.resolve(schema))
                    .collect::<Result<_, _>>()?,
            ),
            Filter::Not(f) => Filter::Not(Box::new(f.resolve(schema)?)),
        })
    }

    /// Evaluate against a stored row whose names are storage fields.
    pub(crate) fn matches(&self, row: &Row) -> bool {
        let get = |field: &str| row.get(field).unwrap_or(&Value::Null);
        match self {
            Filter::All => true,
            Filter::Eq(f, v) => get(f) == v,
            Filter::Ne(f, v) => get(f) != v,
            Filter::Lt(f, v) => compare(get(f), v) == Some(Ordering::Less),
            Filter::Le(f, v) => matches!(
                compare(get(f), v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::Gt(f, v) => compare(get(f), v) == Some(Ordering::Greater),
            Filter::Ge(f, v) => matches!(
                compare(get(f), v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::In(f, vs) => vs.contains(get(f)),
            Filter::IsNull(f) => get(f).is_null(),
            Filter::And(fs) => fs.iter().all(|f| f.matches(row)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(row)),
            Filter::Not(f) => !f.matches(row),
        }
    }
}

/// Order two stored values. Values of different kinds are incomparable.
pub(crate) fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

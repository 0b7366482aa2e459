use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Field-level validation failures collected for a Create or Save input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set holding a single failure.
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.push(field, message);
        errors
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// Whether any failure is recorded for `field`.
    pub fn has(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Failures reaching the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectivityError {
    #[error("timed out after {0:?} waiting for a pooled storage handle")]
    PoolTimeout(Duration),
    #[error("storage pool is closed")]
    Closed,
    #[error("storage lock poisoned during {0}")]
    Poisoned(&'static str),
}

/// Error type for model adapter and storage operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    /// Malformed or missing Create/Save inputs.
    #[error("validation failed for {collection}: {errors}")]
    Validation {
        collection: String,
        errors: ValidationErrors,
    },
    /// Storage-level uniqueness, not-null or foreign-key failure.
    #[error("constraint `{constraint}` violated on {collection}: {detail}")]
    ConstraintViolation {
        collection: String,
        constraint: String,
        detail: String,
    },
    /// Optimistic concurrency conflict on a versioned model.
    #[error("concurrency conflict on {collection}:{key} (expected version {expected}, actual {actual})")]
    ConcurrencyConflict {
        collection: String,
        key: String,
        expected: u64,
        actual: u64,
    },
    /// Save or Delete addressed a record that no longer exists.
    #[error("record not found: {collection}:{key}")]
    NotFound { collection: String, key: String },
    #[error("write to {collection} affected no rows")]
    NoRowsAffected { collection: String },
    #[error("storage unavailable: {0}")]
    Connectivity(#[from] ConnectivityError),
    /// Row <-> attribute conversion failure.
    #[error("mapping error on {collection}.{field}: {detail}")]
    Mapping {
        collection: String,
        field: String,
        detail: String,
    },
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    /// Transaction used out of order on a storage handle.
    #[error("transaction misuse: {0}")]
    Transaction(&'static str),
    #[error("no adapter registered for {0}")]
    AdapterNotRegistered(&'static str),
}

impl DataError {
    pub(crate) fn constraint(
        collection: &str,
        constraint: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        DataError::ConstraintViolation {
            collection: collection.to_string(),
            constraint: constraint.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn mapping(collection: &str, field: &str, detail: impl Into<String>) -> Self {
        DataError::Mapping {
            collection: collection.to_string(),
            field: field.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether a caller may retry the operation after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataError::Connectivity(ConnectivityError::PoolTimeout(_))
        )
    }
}

//! Support code called by `#[derive(Model)]` output. Not a stable API.

pub mod __private {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;

    use crate::error::{DataError, ValidationErrors};
    use crate::model::Row;

    pub use serde_json;

    /// Read one stored field, converting it to the attribute type.
    /// A missing field reads as null so optional attributes hydrate to `None`.
    pub fn read_field<T: DeserializeOwned>(
        row: &Row,
        collection: &str,
        field: &str,
    ) -> Result<T, DataError> {
        let value = row.get(field).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| DataError::mapping(collection, field, e.to_string()))
    }

    /// Convert one attribute to its stored representation.
    pub fn write_field<T: Serialize + ?Sized>(
        collection: &str,
        field: &str,
        value: &T,
    ) -> Result<Value, DataError> {
        serde_json::to_value(value).map_err(|e| DataError::mapping(collection, field, e.to_string()))
    }

    /// Text-like attribute values checked by `non_empty` / `max_len`.
    pub trait Text {
        fn text(&self) -> Option<&str>;
    }

    impl Text for String {
        fn text(&self) -> Option<&str> {
            Some(self.as_str())
        }
    }

    impl Text for Option<String> {
        fn text(&self) -> Option<&str> {
            self.as_deref()
        }
    }

    pub fn check_non_empty<T: Text>(errors: &mut ValidationErrors, attribute: &str, value: &T) {
        if let Some(text) = value.text() {
            if text.trim().is_empty() {
                errors.push(attribute, "must not be empty");
            }
        }
    }

    pub fn check_max_len<T: Text>(
        errors: &mut ValidationErrors,
        attribute: &str,
        value: &T,
        max: usize,
    ) {
        if let Some(text) = value.text() {
            if text.chars().count() > max {
                errors.push(attribute, format!("must be at most {} characters", max));
            }
        }
    }
}

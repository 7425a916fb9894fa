//! Typed errors for schema field access.

use thiserror::Error;

/// Result alias for field accessors.
pub type FieldResult<T> = Result<T, FieldError>;

/// Errors raised while reading or writing a field through a [`TypeSchema`].
///
/// [`TypeSchema`]: crate::object::TypeSchema
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FieldError {
    /// The object handed to an accessor is not the type the schema describes.
    #[error("Object is not a {expected}")]
    ObjectMismatch {
        /// Rust type the accessor was built for.
        expected: &'static str,
    },

    /// An object reference of the wrong type was written into a field.
    #[error("Field '{field}' expects a reference to {expected}")]
    ReferenceMismatch {
        field: &'static str,
        expected: &'static str,
    },

    /// A value of the wrong category was written into a field.
    #[error("Field '{field}' holds {expected}, got {actual}")]
    KindMismatch {
        field: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    /// The field cannot be read through the schema.
    #[error("Field '{0}' is not readable")]
    NotReadable(&'static str),

    /// The field cannot be written through the schema.
    #[error("Field '{0}' is not writable")]
    NotWritable(&'static str),

    /// A native value of another type was written into a field.
    #[error("Field '{field}' expects a {expected}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },

    /// The field's type is not one that can be transferred natively.
    #[error("Field '{0}' has no native representation")]
    NotNative(&'static str),

    /// Encoding the current field value failed.
    #[error("Failed to encode field '{field}': {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The incoming value does not fit the field's type.
    #[error("Failed to decode field '{field}': {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mismatch_names_both_sides() {
        let err = FieldError::KindMismatch {
            field: "hits",
            expected: "value",
            actual: "object",
        };
        let message = err.to_string();
        assert!(message.contains("hits"));
        assert!(message.contains("value"));
        assert!(message.contains("object"));
    }

    #[test]
    fn test_decode_error_keeps_source() {
        let source = serde_json::from_str::<u32>("\"text\"").unwrap_err();
        let err = FieldError::Decode {
            field: "counter",
            source,
        };
        assert!(std::error::Error::source(&err).is_some());
    }
}

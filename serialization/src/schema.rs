//! Type schemas and version negotiation.

use serde::{Deserialize, Serialize};

use crate::SerializationError;

/// Version of the serialization system emitted by this runtime.
pub const SERIALIZATION_SYSTEM_VERSION: u32 = 2;

/// Oldest serialization system version this runtime will read.
pub const MINIMUM_SERIALIZATION_SYSTEM_VERSION: u32 = 0;

/// The identity of a serialized type: its fully qualified name and the
/// version of the handler that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSchema {
    /// Fully qualified type name.
    pub name: String,
    /// Handler version that produced instances of this schema.
    pub version: u32,
}

impl TypeSchema {
    /// Creates a schema for `name` at `version`.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        TypeSchema { name: name.into(), version }
    }

    /// Creates the schema of a compile-time type at the current version.
    pub fn of<T: 'static>() -> Self {
        TypeSchema::new(std::any::type_name::<T>(), SERIALIZATION_SYSTEM_VERSION)
    }

    /// Checks that data written under `self` can be read into `target`.
    ///
    /// Name mismatches are `TypeMismatch`; a source version newer than the
    /// target handler is `SerializationVersion`.
    pub fn validate_compatible(&self, target: &TypeSchema) -> Result<(), SerializationError> {
        if self.name != target.name {
            return Err(SerializationError::TypeMismatch {
                expected: target.name.clone(),
                found: self.name.clone(),
            });
        }
        if self.version > target.version {
            return Err(SerializationError::SerializationVersion {
                found: self.version,
                supported: target.version,
            });
        }
        ensure_supported_type_name(&self.name)
    }
}

/// Rejects type names the serialization system cannot represent.
///
/// Multi-dimensional array names (as written by foreign runtimes, e.g.
/// `Double[,]`) and function or closure types are refused with the fixed
/// message prefixes callers match on.
pub fn ensure_supported_type_name(name: &str) -> Result<(), SerializationError> {
    if name.contains("[,") {
        return Err(SerializationError::Unsupported(format!(
            "Multi-dimensional arrays are currently not supported: {name}"
        )));
    }
    if name.contains("{{closure}}") || name.starts_with("fn(") || name.contains("dyn Fn") {
        return Err(SerializationError::Unsupported(format!(
            "Cannot clone Func: {name}"
        )));
    }
    Ok(())
}

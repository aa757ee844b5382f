//! Deterministic in-memory cloning and wire-format serialization.
//!
//! Every payload type that crosses a store or wire boundary is handled by a
//! [`SerializationHandler`], found through the [`KnownSerializers`]
//! registry. Types without a custom handler fall back to their serde
//! implementation. Reference graphs are preserved through per-operation
//! contexts that intern instance identities on write and keep an ordinal
//! table of materialized instances on read.
//!
//! # Examples
//!
//! ```
//! use tempo_serialization::Serializer;
//!
//! let serializer = Serializer::new();
//! let bytes = serializer.serialize(&(3u32, String::from("tick"))).unwrap();
//! let back: (u32, String) = serializer.deserialize(&bytes).unwrap();
//! assert_eq!(back, (3, String::from("tick")));
//! ```

pub mod buffer;
pub mod context;
pub mod registry;
pub mod schema;

pub use buffer::{BufferReader, BufferWriter};
pub use context::{CloneContext, DeserializationContext, SerializationContext};
pub use registry::{
    KnownSerializers, RefHandler, SerdeHandler, SerializationHandler, SharedHandler,
};
pub use schema::{
    ensure_supported_type_name, TypeSchema, MINIMUM_SERIALIZATION_SYSTEM_VERSION,
    SERIALIZATION_SYSTEM_VERSION,
};

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors raised by serialization, deserialization, and cloning.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// The wire carries a different type than the target expects.
    #[error("type mismatch: expected `{expected}`, found `{found}`")]
    TypeMismatch {
        /// Type the reader was asked to produce.
        expected: String,
        /// Type recorded on the wire.
        found: String,
    },
    /// The wire was written by a newer handler than this runtime carries.
    #[error("serialization version {found} is not supported (supported up to {supported})")]
    SerializationVersion {
        /// Version found on the wire.
        found: u32,
        /// Newest version this runtime supports.
        supported: u32,
    },
    /// The input shape has no serializable representation.
    #[error("{0}")]
    Unsupported(String),
    /// The buffer ended before the value did.
    #[error("buffer truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },
    /// The payload bytes do not decode under the expected schema.
    #[error("codec error: {0}")]
    Codec(String),
    /// An underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience facade over a [`KnownSerializers`] registry with fresh
/// contexts per operation.
#[derive(Clone, Default)]
pub struct Serializer {
    known: Arc<KnownSerializers>,
}

impl Serializer {
    /// Creates a serializer with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a serializer over an existing registry.
    pub fn over(known: Arc<KnownSerializers>) -> Self {
        Serializer { known }
    }

    /// The backing registry.
    pub fn known_serializers(&self) -> &Arc<KnownSerializers> {
        &self.known
    }

    /// Serializes `value` to a fresh byte vector.
    pub fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, SerializationError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let mut writer = BufferWriter::new();
        let mut context = SerializationContext::new();
        self.known.handler::<T>()?.serialize(&mut writer, value, &mut context)?;
        Ok(writer.into_vec())
    }

    /// Deserializes a value of `T` from `bytes`.
    pub fn deserialize<T>(&self, bytes: &[u8]) -> Result<T, SerializationError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let mut reader = BufferReader::new(bytes);
        let mut context = DeserializationContext::new();
        let mut target = None;
        self.known.handler::<T>()?.deserialize(&mut reader, &mut target, &mut context)?;
        target.ok_or_else(|| {
            SerializationError::Codec(String::from("handler produced no instance"))
        })
    }

    /// Deserializes from `bytes` into `target`, reusing its storage where
    /// the handler permits.
    pub fn deserialize_into<T>(
        &self,
        bytes: &[u8],
        target: &mut Option<T>,
    ) -> Result<(), SerializationError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let mut reader = BufferReader::new(bytes);
        let mut context = DeserializationContext::new();
        let handler = self.known.handler::<T>()?;
        handler.prepare_deserialization_target(target);
        handler.deserialize(&mut reader, target, &mut context)
    }

    /// Produces a deterministic clone of `value`.
    pub fn clone_value<T>(&self, value: &T) -> Result<T, SerializationError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let mut context = CloneContext::new();
        let mut target = None;
        let handler = self.known.handler::<T>()?;
        SerializationHandler::clone_into(handler.as_ref(), value, &mut target, &mut context)?;
        target.ok_or_else(|| {
            SerializationError::Codec(String::from("handler produced no instance"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_pool::{Shared, SharedPool};

    #[test]
    fn serde_fallback_round_trip() {
        let serializer = Serializer::new();
        let value = vec![(1u64, String::from("a")), (2, String::from("b"))];
        let bytes = serializer.serialize(&value).unwrap();
        let back: Vec<(u64, String)> = serializer.deserialize(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn aliased_references_serialize_once() {
        let known = Arc::new(KnownSerializers::new());
        let inner: Arc<dyn SerializationHandler<String>> = Arc::new(SerdeHandler::new());
        known.register::<Arc<String>>(Arc::new(RefHandler::new(inner))).unwrap();

        let shared = Arc::new(String::from("payload"));
        let pair = (shared.clone(), shared);

        let handler = known.registered::<Arc<String>>().unwrap();
        let mut writer = BufferWriter::new();
        let mut context = SerializationContext::new();
        handler.serialize(&mut writer, &pair.0, &mut context).unwrap();
        let first_len = writer.position();
        handler.serialize(&mut writer, &pair.1, &mut context).unwrap();
        // Second occurrence is a tag plus an ordinal, not a payload.
        assert_eq!(writer.position() - first_len, 5);

        let bytes = writer.into_vec();
        let mut reader = BufferReader::new(&bytes);
        let mut read_context = DeserializationContext::new();
        let mut first = None;
        let mut second = None;
        handler.deserialize(&mut reader, &mut first, &mut read_context).unwrap();
        handler.deserialize(&mut reader, &mut second, &mut read_context).unwrap();
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, "payload");
    }

    #[test]
    fn clone_preserves_identity() {
        let known = KnownSerializers::new();
        let inner: Arc<dyn SerializationHandler<String>> = Arc::new(SerdeHandler::new());
        known.register::<Arc<String>>(Arc::new(RefHandler::new(inner))).unwrap();
        let handler = known.registered::<Arc<String>>().unwrap();

        let original = Arc::new(String::from("payload"));
        let mut context = CloneContext::new();
        let mut first = None;
        let mut second = None;
        SerializationHandler::clone_into(handler.as_ref(), &original, &mut first, &mut context).unwrap();
        SerializationHandler::clone_into(handler.as_ref(), &original, &mut second, &mut context).unwrap();
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &original));
    }

    #[test]
    fn shared_handler_recycles_through_pool() {
        let pool = SharedPool::<Vec<u8>>::new(4);
        let known = KnownSerializers::new();
        let inner: Arc<dyn SerializationHandler<Vec<u8>>> = Arc::new(SerdeHandler::new());
        known
            .register::<Shared<Vec<u8>>>(Arc::new(SharedHandler::new(pool.clone(), inner)))
            .unwrap();
        let handler = known.registered::<Shared<Vec<u8>>>().unwrap();
        assert!(handler.is_clear_required());

        let instance = pool.get_or_create(|| vec![9u8; 16]);
        let mut writer = BufferWriter::new();
        handler
            .serialize(&mut writer, &instance, &mut SerializationContext::new())
            .unwrap();

        // Cloning bumps the count instead of copying.
        let mut aliased = None;
        SerializationHandler::clone_into(handler.as_ref(), &instance, &mut aliased, &mut CloneContext::new()).unwrap();
        assert_eq!(instance.reference_count(), 2);

        // Clearing releases handles; the final release recycles.
        let mut aliased = aliased.unwrap();
        handler.clear(&mut aliased).unwrap();
        drop(instance);
        assert_eq!(pool.available(), 1);

        // Deserializing reuses pooled storage rather than allocating.
        let bytes = writer.into_vec();
        let mut reader = BufferReader::new(&bytes);
        let mut target = None;
        handler
            .deserialize(&mut reader, &mut target, &mut DeserializationContext::new())
            .unwrap();
        assert_eq!(&*target.unwrap(), &vec![9u8; 16]);
        assert_eq!(pool.total_allocated(), 1);
    }

    #[test]
    fn minimum_version_enforced() {
        let known = KnownSerializers::with_minimum_version(2);
        assert!(known.accept_version(2).is_ok());
        assert!(matches!(
            known.accept_version(1),
            Err(SerializationError::SerializationVersion { found: 1, supported: 2 })
        ));
    }

    #[test]
    fn schema_registered_by_name() {
        let serializer = Serializer::new();
        serializer.serialize(&1u64).unwrap();
        let schema = serializer.known_serializers().schema_for("u64").unwrap();
        assert_eq!(schema.version, SERIALIZATION_SYSTEM_VERSION);
    }
}

//! Per-type serialization handlers and the registry that owns them.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use tempo_pool::{Shared, SharedPool};

use crate::buffer::{BufferReader, BufferWriter};
use crate::context::{
    CloneContext, DeserializationContext, RefEntry, SerializationContext, TAG_BACK_REF,
    TAG_NEW_REF,
};
use crate::schema::{
    ensure_supported_type_name, TypeSchema, MINIMUM_SERIALIZATION_SYSTEM_VERSION,
    SERIALIZATION_SYSTEM_VERSION,
};
use crate::SerializationError;

/// The operations a type must support to move through the runtime: wire
/// (de)serialization, deterministic in-memory cloning, and clearing of
/// resources that need explicit reclamation.
pub trait SerializationHandler<T>: Send + Sync + 'static {
    /// The schema this handler reads and writes.
    fn schema(&self) -> TypeSchema;

    /// Validates this handler against a schema read from a store or wire,
    /// returning the schema the handler will produce.
    fn initialize(
        &self,
        _known: &KnownSerializers,
        target_schema: Option<&TypeSchema>,
    ) -> Result<TypeSchema, SerializationError> {
        let schema = self.schema();
        ensure_supported_type_name(&schema.name)?;
        if let Some(target) = target_schema {
            target.validate_compatible(&schema)?;
        }
        Ok(schema)
    }

    /// Whether `clear` does real work for this type. Contexts skip the call
    /// when false.
    fn is_clear_required(&self) -> bool {
        false
    }

    /// Appends the wire form of `instance` to `writer`.
    fn serialize(
        &self,
        writer: &mut BufferWriter,
        instance: &T,
        context: &mut SerializationContext,
    ) -> Result<(), SerializationError>;

    /// Reads an instance, reusing `target` storage where possible.
    fn deserialize(
        &self,
        reader: &mut BufferReader<'_>,
        target: &mut Option<T>,
        context: &mut DeserializationContext,
    ) -> Result<(), SerializationError>;

    /// Clones `instance` into `target`, reusing its storage where possible.
    fn clone_into(
        &self,
        instance: &T,
        target: &mut Option<T>,
        context: &mut CloneContext,
    ) -> Result<(), SerializationError>;

    /// Releases resources held by `target` that require explicit
    /// reclamation. A no-op unless `is_clear_required` reports true.
    fn clear(&self, _target: &mut T) -> Result<(), SerializationError> {
        Ok(())
    }

    /// Adjusts `target` before deserialization; the default keeps whatever
    /// storage is already present.
    fn prepare_deserialization_target(&self, _target: &mut Option<T>) {}

    /// Adjusts `target` before cloning; the default keeps whatever storage
    /// is already present.
    fn prepare_cloning_target(&self, _instance: &T, _target: &mut Option<T>) {}
}

/// Handler derived from a type's serde implementation, the fallback for any
/// type the registry has no custom handler for.
pub struct SerdeHandler<T> {
    marker: PhantomData<fn() -> T>,
}

impl<T> Default for SerdeHandler<T> {
    fn default() -> Self {
        SerdeHandler { marker: PhantomData }
    }
}

impl<T> SerdeHandler<T> {
    /// Creates the fallback handler for `T`.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> SerializationHandler<T> for SerdeHandler<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn schema(&self) -> TypeSchema {
        TypeSchema::new(std::any::type_name::<T>(), SERIALIZATION_SYSTEM_VERSION)
    }

    fn serialize(
        &self,
        writer: &mut BufferWriter,
        instance: &T,
        _context: &mut SerializationContext,
    ) -> Result<(), SerializationError> {
        bincode::serialize_into(writer, instance)
            .map_err(|error| SerializationError::Codec(error.to_string()))
    }

    fn deserialize(
        &self,
        reader: &mut BufferReader<'_>,
        target: &mut Option<T>,
        _context: &mut DeserializationContext,
    ) -> Result<(), SerializationError> {
        let value = bincode::deserialize_from(reader)
            .map_err(|error| SerializationError::Codec(error.to_string()))?;
        *target = Some(value);
        Ok(())
    }

    fn clone_into(
        &self,
        instance: &T,
        target: &mut Option<T>,
        _context: &mut CloneContext,
    ) -> Result<(), SerializationError> {
        match target {
            Some(existing) => existing.clone_from(instance),
            None => *target = Some(instance.clone()),
        }
        Ok(())
    }
}

/// Handler for `Arc<T>` that preserves reference identity: aliased inputs
/// serialize as one payload plus back-references, and deserialize or clone
/// back into a single shared instance.
pub struct RefHandler<T> {
    inner: Arc<dyn SerializationHandler<T>>,
}

impl<T> RefHandler<T> {
    /// Wraps a handler for the pointee type.
    pub fn new(inner: Arc<dyn SerializationHandler<T>>) -> Self {
        RefHandler { inner }
    }
}

impl<T: Send + Sync + 'static> SerializationHandler<Arc<T>> for RefHandler<T> {
    fn schema(&self) -> TypeSchema {
        let inner = self.inner.schema();
        TypeSchema::new(format!("ref<{}>", inner.name), inner.version)
    }

    fn serialize(
        &self,
        writer: &mut BufferWriter,
        instance: &Arc<T>,
        context: &mut SerializationContext,
    ) -> Result<(), SerializationError> {
        match context.intern(Arc::as_ptr(instance) as usize) {
            RefEntry::New(_) => {
                writer.write_u8(TAG_NEW_REF);
                self.inner.serialize(writer, instance, context)
            }
            RefEntry::Known(ordinal) => {
                writer.write_u8(TAG_BACK_REF);
                writer.write_u32(ordinal);
                Ok(())
            }
        }
    }

    fn deserialize(
        &self,
        reader: &mut BufferReader<'_>,
        target: &mut Option<Arc<T>>,
        context: &mut DeserializationContext,
    ) -> Result<(), SerializationError> {
        match reader.read_u8()? {
            TAG_NEW_REF => {
                let mut value = None;
                self.inner.deserialize(reader, &mut value, context)?;
                let instance = Arc::new(value.ok_or_else(|| {
                    SerializationError::Codec(String::from("handler produced no instance"))
                })?);
                context.register(instance.clone());
                *target = Some(instance);
                Ok(())
            }
            TAG_BACK_REF => {
                let ordinal = reader.read_u32()?;
                *target = Some(context.resolve::<T>(ordinal)?);
                Ok(())
            }
            tag => Err(SerializationError::Codec(format!("unknown reference tag {tag}"))),
        }
    }

    fn clone_into(
        &self,
        instance: &Arc<T>,
        target: &mut Option<Arc<T>>,
        context: &mut CloneContext,
    ) -> Result<(), SerializationError> {
        let address = Arc::as_ptr(instance) as usize;
        if let Some(existing) = context.cloned_for::<T>(address) {
            *target = Some(existing);
            return Ok(());
        }
        let mut value = None;
        SerializationHandler::clone_into(self.inner.as_ref(), instance, &mut value, context)?;
        let clone = Arc::new(value.ok_or_else(|| {
            SerializationError::Codec(String::from("handler produced no instance"))
        })?);
        context.record(address, clone.clone());
        *target = Some(clone);
        Ok(())
    }
}

/// Handler for pooled [`Shared<T>`] handles.
///
/// Cloning bumps the reference count rather than copying the resource;
/// deserialization overwrites the target's pooled storage when the target
/// handle is unique, and draws from the pool otherwise; `clear` releases
/// the handle so the resource can return to its pool.
pub struct SharedHandler<T: Send + 'static> {
    pool: SharedPool<T>,
    inner: Arc<dyn SerializationHandler<T>>,
}

impl<T: Send + 'static> SharedHandler<T> {
    /// Creates a handler drawing deserialization targets from `pool`.
    pub fn new(pool: SharedPool<T>, inner: Arc<dyn SerializationHandler<T>>) -> Self {
        SharedHandler { pool, inner }
    }
}

impl<T: Send + Sync + 'static> SerializationHandler<Shared<T>> for SharedHandler<T> {
    fn schema(&self) -> TypeSchema {
        let inner = self.inner.schema();
        TypeSchema::new(format!("shared<{}>", inner.name), inner.version)
    }

    fn is_clear_required(&self) -> bool {
        true
    }

    fn serialize(
        &self,
        writer: &mut BufferWriter,
        instance: &Shared<T>,
        context: &mut SerializationContext,
    ) -> Result<(), SerializationError> {
        let resource = instance.resource().ok_or_else(|| {
            SerializationError::Codec(String::from("cannot serialize a released Shared handle"))
        })?;
        match context.intern(resource as *const T as usize) {
            RefEntry::New(_) => {
                writer.write_u8(TAG_NEW_REF);
                self.inner.serialize(writer, resource, context)
            }
            RefEntry::Known(ordinal) => {
                writer.write_u8(TAG_BACK_REF);
                writer.write_u32(ordinal);
                Ok(())
            }
        }
    }

    fn deserialize(
        &self,
        reader: &mut BufferReader<'_>,
        target: &mut Option<Shared<T>>,
        context: &mut DeserializationContext,
    ) -> Result<(), SerializationError> {
        if reader.read_u8()? != TAG_NEW_REF {
            return Err(SerializationError::Codec(String::from(
                "back-references between Shared handles require a ref<> wrapper",
            )));
        }
        let mut value = None;
        self.inner.deserialize(reader, &mut value, context)?;
        let value = value.ok_or_else(|| {
            SerializationError::Codec(String::from("handler produced no instance"))
        })?;

        // Overwrite the target's storage in place when it is uniquely held.
        if let Some(existing) = target.as_mut() {
            if let Some(resource) = existing.try_resource_mut() {
                *resource = value;
                return Ok(());
            }
        }

        let mut value = Some(value);
        let mut shared = self.pool.get_or_create(|| value.take().expect("factory runs once"));
        if let Some(remaining) = value.take() {
            if let Some(resource) = shared.try_resource_mut() {
                *resource = remaining;
            }
        }
        *target = Some(shared);
        Ok(())
    }

    fn clone_into(
        &self,
        instance: &Shared<T>,
        target: &mut Option<Shared<T>>,
        _context: &mut CloneContext,
    ) -> Result<(), SerializationError> {
        // A handle clone adds a reference to the same resource.
        *target = Some(instance.clone());
        Ok(())
    }

    fn clear(&self, target: &mut Shared<T>) -> Result<(), SerializationError> {
        target.release();
        Ok(())
    }

    fn prepare_cloning_target(&self, _instance: &Shared<T>, target: &mut Option<Shared<T>>) {
        // The incoming reference replaces the target outright; release any
        // handle the target still holds so its resource can recycle.
        if let Some(existing) = target.as_mut() {
            existing.release();
        }
        *target = None;
    }
}

type AnyHandler = Box<dyn Any + Send + Sync>;

/// Registry of serialization handlers keyed by type.
///
/// Custom handlers are installed with [`KnownSerializers::register`]; any
/// serde-capable type without one falls back to a [`SerdeHandler`] derived
/// from its compile-time implementation, cached on first use.
pub struct KnownSerializers {
    handlers: RwLock<HashMap<TypeId, AnyHandler>>,
    schemas: RwLock<HashMap<String, TypeSchema>>,
    minimum_version: u32,
}

impl Default for KnownSerializers {
    fn default() -> Self {
        KnownSerializers {
            handlers: RwLock::new(HashMap::new()),
            schemas: RwLock::new(HashMap::new()),
            minimum_version: MINIMUM_SERIALIZATION_SYSTEM_VERSION,
        }
    }
}

impl KnownSerializers {
    /// Creates a registry accepting the default minimum system version.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry refusing stores older than `minimum_version`.
    pub fn with_minimum_version(minimum_version: u32) -> Self {
        KnownSerializers { minimum_version, ..Self::default() }
    }

    /// Installs a custom handler for `T`, replacing any previous one.
    pub fn register<T: 'static>(
        &self,
        handler: Arc<dyn SerializationHandler<T>>,
    ) -> Result<(), SerializationError> {
        let schema = handler.initialize(self, None)?;
        self.schemas
            .write()
            .expect("registry poisoned")
            .insert(schema.name.clone(), schema);
        self.handlers
            .write()
            .expect("registry poisoned")
            .insert(TypeId::of::<T>(), Box::new(handler));
        Ok(())
    }

    /// The handler registered for `T`, if any.
    pub fn registered<T: 'static>(&self) -> Option<Arc<dyn SerializationHandler<T>>> {
        self.handlers
            .read()
            .expect("registry poisoned")
            .get(&TypeId::of::<T>())
            .and_then(|any| any.downcast_ref::<Arc<dyn SerializationHandler<T>>>())
            .cloned()
    }

    /// The handler for `T`: the registered one, else a cached serde
    /// fallback.
    pub fn handler<T>(&self) -> Result<Arc<dyn SerializationHandler<T>>, SerializationError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if let Some(handler) = self.registered::<T>() {
            return Ok(handler);
        }
        ensure_supported_type_name(std::any::type_name::<T>())?;
        let handler: Arc<dyn SerializationHandler<T>> = Arc::new(SerdeHandler::<T>::new());
        self.register::<T>(handler.clone())?;
        Ok(handler)
    }

    /// The schema last registered under `name`.
    pub fn schema_for(&self, name: &str) -> Option<TypeSchema> {
        self.schemas.read().expect("registry poisoned").get(name).cloned()
    }

    /// Checks a store-level serialization system version against the
    /// configured minimum.
    pub fn accept_version(&self, version: u32) -> Result<(), SerializationError> {
        if version < self.minimum_version {
            return Err(SerializationError::SerializationVersion {
                found: version,
                supported: self.minimum_version,
            });
        }
        Ok(())
    }
}

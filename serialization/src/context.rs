//! Per-operation identity tracking for reference graphs.
//!
//! Serializing the same shared instance twice must produce one payload and
//! one back-reference; deserializing must materialize a single shared
//! instance; cloning must preserve aliasing. Each context holds the side
//! table for one such operation and is reset between messages.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::SerializationError;

/// Tag preceding an inline payload for a not-yet-seen reference.
pub const TAG_NEW_REF: u8 = 1;
/// Tag preceding the ordinal of an already-serialized reference.
pub const TAG_BACK_REF: u8 = 2;

/// Write-side identity table: instance address to reference ordinal.
#[derive(Default)]
pub struct SerializationContext {
    refs: HashMap<usize, u32>,
}

/// Outcome of interning an address on the write side.
pub enum RefEntry {
    /// First sighting; serialize the payload inline under this ordinal.
    New(u32),
    /// Already serialized under this ordinal; write a back-reference.
    Known(u32),
}

impl SerializationContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `address`, assigning the next ordinal on first sight.
    pub fn intern(&mut self, address: usize) -> RefEntry {
        match self.refs.get(&address) {
            Some(&ordinal) => RefEntry::Known(ordinal),
            None => {
                let ordinal = self.refs.len() as u32;
                self.refs.insert(address, ordinal);
                RefEntry::New(ordinal)
            }
        }
    }

    /// Forgets all interned references.
    pub fn reset(&mut self) {
        self.refs.clear();
    }
}

/// Read-side identity table: ordinal to materialized instance.
#[derive(Default)]
pub struct DeserializationContext {
    refs: Vec<Arc<dyn Any + Send + Sync>>,
}

impl DeserializationContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly materialized instance, returning its ordinal.
    pub fn register(&mut self, instance: Arc<dyn Any + Send + Sync>) -> u32 {
        self.refs.push(instance);
        (self.refs.len() - 1) as u32
    }

    /// Resolves a back-reference to the instance registered under `ordinal`.
    pub fn resolve<T: Send + Sync + 'static>(
        &self,
        ordinal: u32,
    ) -> Result<Arc<T>, SerializationError> {
        let any = self.refs.get(ordinal as usize).ok_or_else(|| {
            SerializationError::Codec(format!("dangling back-reference ordinal {ordinal}"))
        })?;
        any.clone().downcast::<T>().map_err(|_| SerializationError::TypeMismatch {
            expected: std::any::type_name::<T>().to_string(),
            found: String::from("back-referenced instance of another type"),
        })
    }

    /// Forgets all materialized references.
    pub fn reset(&mut self) {
        self.refs.clear();
    }
}

/// Clone-side identity table: source address to already-cloned instance.
#[derive(Default)]
pub struct CloneContext {
    refs: HashMap<usize, Arc<dyn Any + Send + Sync>>,
}

impl CloneContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// The clone previously produced for the instance at `address`.
    pub fn cloned_for<T: Send + Sync + 'static>(&self, address: usize) -> Option<Arc<T>> {
        self.refs
            .get(&address)
            .and_then(|any| any.clone().downcast::<T>().ok())
    }

    /// Records the clone produced for the instance at `address`.
    pub fn record(&mut self, address: usize, clone: Arc<dyn Any + Send + Sync>) {
        self.refs.insert(address, clone);
    }

    /// Forgets all recorded clones.
    pub fn reset(&mut self) {
        self.refs.clear();
    }
}

//! Durable storage of timestamped message streams.
//!
//! A store named `N` at path `P` consists of extent files `N_000000.psi`
//! onward holding message blocks, a catalog `N.Catalog.psi` of stream
//! metadata and store info records, a fixed-width index `N.Index.psi`
//! sized for binary search by time, and a liveness marker `N.Live` held
//! exclusively by the writer. Readers may attach while the writer is
//! appending and tail the committed cursor until the marker disappears.
//!
//! Whole-store operations — [`ops::copy_store`], [`ops::crop_store`],
//! [`ops::edit_store`], [`ops::add_stream`], [`ops::repair_store`] —
//! rewrite stores without interpreting payloads, preserving envelopes
//! bit for bit.

pub mod index;
pub mod infinite_file;
pub mod metadata;
pub mod ops;
pub mod reader;
pub mod wire;
pub mod writer;

pub use index::{IndexEntry, IndexReader, IndexWriter};
pub use infinite_file::{
    ExtentNaming, InfiniteFileReader, InfiniteFileWriter, ReadOutcome, BLOCK_ALIGNMENT,
    DEFAULT_EXTENT_SIZE,
};
pub use metadata::{StoreInfo, StreamMetadata, METADATA_VERSION};
pub use ops::{
    add_stream, copy_store, crop_store, edit_store, list_streams, repair_store, RepairReport,
    StreamEdit,
};
pub use reader::StoreReader;
pub use writer::{StoreWriter, StoreWriterOptions};

use std::path::PathBuf;

use tempo_serialization::SerializationError;

/// Errors raised by store reading, writing, and maintenance.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An underlying filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Another writer holds the store's liveness marker.
    #[error("store `{0}` already has a live writer")]
    AlreadyLive(String),
    /// The on-disk structures are inconsistent; repair may recover.
    #[error("store integrity: {0}")]
    Integrity(String),
    /// No stream with the given identity.
    #[error("unknown stream `{0}`")]
    UnknownStream(String),
    /// A stream with this id is already open.
    #[error("stream id {0} already exists")]
    DuplicateStream(u32),
    /// A caller-supplied argument is out of range or contradictory.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No store with this name exists at the path.
    #[error("store `{name}` not found under {path}")]
    NotFound {
        /// Requested store name.
        name: String,
        /// Path searched.
        path: PathBuf,
    },
    /// A payload or metadata blob failed to (de)serialize.
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

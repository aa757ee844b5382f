//! The write side of a store.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use log::debug;

use tempo_serialization::BufferWriter;
use tempo_time::{Envelope, Time};

use crate::index::{IndexEntry, IndexWriter};
use crate::infinite_file::{ExtentNaming, InfiniteFileWriter, DEFAULT_EXTENT_SIZE};
use crate::metadata::{StoreInfo, StreamMetadata, RECORD_STORE_INFO, RECORD_STREAM_METADATA};
use crate::wire::{encode_envelope, ENVELOPE_SIZE};
use crate::StoreError;

/// Name of the exclusive liveness marker of store `name`.
pub fn live_marker_name(name: &str) -> String {
    format!("{name}.Live")
}

/// Logical name of the catalog chain of store `name`.
pub fn catalog_name(name: &str) -> String {
    format!("{name}.Catalog")
}

/// Creation options for a [`StoreWriter`].
#[derive(Clone, Debug)]
pub struct StoreWriterOptions {
    /// Create the store in an auto-incrementing `name.NNNN` subdirectory
    /// so existing versions are never overwritten.
    pub incrementing: bool,
    /// Capacity of each data extent.
    pub extent_size: usize,
}

impl Default for StoreWriterOptions {
    fn default() -> Self {
        StoreWriterOptions { incrementing: false, extent_size: DEFAULT_EXTENT_SIZE }
    }
}

/// An exclusive writer over one store.
///
/// Holds the `name.Live` marker for its lifetime; a second writer on the
/// same store fails with `AlreadyLive`. Closing finalizes metadata,
/// truncates the extent tail, and removes the marker.
pub struct StoreWriter {
    name: String,
    directory: PathBuf,
    data: InfiniteFileWriter,
    index: IndexWriter,
    catalog: InfiniteFileWriter,
    streams: BTreeMap<u32, StreamMetadata>,
    info: StoreInfo,
    closed: bool,
}

impl StoreWriter {
    /// Creates a new store `name` under `path`.
    pub fn create(
        name: &str,
        path: &Path,
        options: StoreWriterOptions,
    ) -> Result<StoreWriter, StoreError> {
        let directory = if options.incrementing {
            let mut version = 0u32;
            loop {
                let candidate = path.join(format!("{name}.{version:04}"));
                if !candidate.exists() {
                    break candidate;
                }
                version += 1;
            }
        } else {
            path.to_path_buf()
        };
        std::fs::create_dir_all(&directory)?;

        // The marker doubles as the single-writer lock.
        let marker = directory.join(live_marker_name(name));
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .map_err(|error| {
                if error.kind() == std::io::ErrorKind::AlreadyExists {
                    StoreError::AlreadyLive(name.to_string())
                } else {
                    StoreError::Io(error)
                }
            })?;

        let data =
            InfiniteFileWriter::create(&directory, name, ExtentNaming::Numbered, options.extent_size)?;
        let index = IndexWriter::create(&directory, name)?;
        let mut catalog = InfiniteFileWriter::create(
            &directory,
            &catalog_name(name),
            ExtentNaming::Single,
            options.extent_size,
        )?;

        let info = StoreInfo::current();
        write_info_record(&mut catalog, &info)?;
        debug!("created store `{name}` at {}", directory.display());

        Ok(StoreWriter {
            name: name.to_string(),
            directory,
            data,
            index,
            catalog,
            streams: BTreeMap::new(),
            info,
            closed: false,
        })
    }

    /// The store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory holding the store files.
    pub fn path(&self) -> &Path {
        &self.directory
    }

    /// Opens a stream for writing.
    pub fn create_stream(
        &mut self,
        id: u32,
        name: &str,
        type_name: &str,
    ) -> Result<(), StoreError> {
        if self.streams.contains_key(&id) {
            return Err(StoreError::DuplicateStream(id));
        }
        if self.streams.values().any(|metadata| metadata.name == name) {
            return Err(StoreError::InvalidArgument(format!(
                "stream name `{name}` already exists"
            )));
        }
        let metadata = StreamMetadata::new(id, name, type_name, Time::now());
        self.write_metadata_record(&metadata)?;
        self.streams.insert(id, metadata);
        Ok(())
    }

    /// Opens a stream reproducing existing metadata: name, type,
    /// supplemental block, runtime types, and open/closed times. Message
    /// statistics are recomputed from the messages actually written.
    pub fn create_stream_from(&mut self, source: &StreamMetadata) -> Result<(), StoreError> {
        if self.streams.contains_key(&source.id) {
            return Err(StoreError::DuplicateStream(source.id));
        }
        let mut metadata =
            StreamMetadata::new(source.id, &source.name, &source.type_name, source.opened_time);
        metadata.closed_time = source.closed_time;
        metadata.supplemental_type_name = source.supplemental_type_name.clone();
        metadata.supplemental_bytes = source.supplemental_bytes.clone();
        metadata.runtime_types = source.runtime_types.clone();
        self.write_metadata_record(&metadata)?;
        self.streams.insert(source.id, metadata);
        Ok(())
    }

    /// Attaches supplemental metadata to an open stream.
    pub fn set_supplemental(
        &mut self,
        stream_id: u32,
        type_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        let metadata = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| StoreError::UnknownStream(stream_id.to_string()))?;
        metadata.supplemental_type_name = Some(type_name.to_string());
        metadata.supplemental_bytes = bytes;
        Ok(())
    }

    /// Appends a message block and its index entry.
    pub fn write_message(
        &mut self,
        envelope: &Envelope,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let metadata = self
            .streams
            .get_mut(&envelope.source_id)
            .ok_or_else(|| StoreError::UnknownStream(envelope.source_id.to_string()))?;

        let mut header = [0u8; ENVELOPE_SIZE];
        encode_envelope(envelope, &mut header);
        self.data.reserve_block(ENVELOPE_SIZE + payload.len())?;
        self.data.write_to_block(&header)?;
        self.data.write_to_block(payload)?;
        let (extent_id, position) = self.data.commit_block()?;

        self.index.append(&IndexEntry {
            originating_time: envelope.originating_time,
            creation_time: envelope.creation_time,
            stream_id: envelope.source_id,
            extent_id,
            position,
        })?;

        metadata.update(envelope, payload.len());
        Ok(())
    }

    /// Streams opened so far.
    pub fn streams(&self) -> impl Iterator<Item = &StreamMetadata> {
        self.streams.values()
    }

    /// Largest stream id in use.
    pub fn max_stream_id(&self) -> Option<u32> {
        self.streams.keys().next_back().copied()
    }

    /// Flushes mapped writes of the data, index, and catalog files.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.data.flush()?;
        self.index.flush()?;
        self.catalog.flush()?;
        Ok(())
    }

    fn write_metadata_record(&mut self, metadata: &StreamMetadata) -> Result<(), StoreError> {
        let mut buffer = BufferWriter::new();
        buffer.write_u8(RECORD_STREAM_METADATA);
        metadata.encode(&mut buffer);
        self.catalog.write_block(buffer.as_slice())?;
        Ok(())
    }

    /// Closes the store: stamps closing times, writes final catalog
    /// records, truncates the tail, and removes the liveness marker.
    ///
    /// Streams that carry an imported closed time keep it; others close at
    /// `final_time`, or at their last message when none is given.
    pub fn close(&mut self, final_time: Option<Time>) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        let stream_metadata: Vec<StreamMetadata> = self
            .streams
            .values_mut()
            .map(|metadata| {
                metadata.is_closed = true;
                if metadata.closed_time == Time::MIN {
                    metadata.closed_time = final_time
                        .unwrap_or(metadata.last_message_originating_time);
                }
                metadata.clone()
            })
            .collect();
        for metadata in &stream_metadata {
            let mut buffer = BufferWriter::new();
            buffer.write_u8(RECORD_STREAM_METADATA);
            metadata.encode(&mut buffer);
            self.catalog.write_block(buffer.as_slice())?;
        }
        self.info.closed = true;
        write_info_record(&mut self.catalog, &self.info)?;

        self.data.close()?;
        self.index.close()?;
        self.catalog.close()?;
        std::fs::remove_file(self.directory.join(live_marker_name(&self.name)))?;
        self.closed = true;
        debug!("closed store `{}`", self.name);
        Ok(())
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        let _ = self.close(None);
    }
}

fn write_info_record(
    catalog: &mut InfiniteFileWriter,
    info: &StoreInfo,
) -> Result<(), StoreError> {
    let mut buffer = BufferWriter::new();
    buffer.write_u8(RECORD_STORE_INFO);
    info.encode(&mut buffer);
    catalog.write_block(buffer.as_slice())?;
    Ok(())
}

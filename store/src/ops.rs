//! Whole-store operations: copy, crop, edit, add-stream, and repair.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};

use tempo_time::{Envelope, Time, TimeInterval};

use crate::index::{index_file_name, IndexReader};
use crate::infinite_file::{ExtentNaming, InfiniteFileWriter, BLOCK_ALIGNMENT};
use crate::metadata::{StoreInfo, RECORD_STORE_INFO, RECORD_STREAM_METADATA};
use crate::reader::StoreReader;
use crate::writer::{catalog_name, live_marker_name, StoreWriter, StoreWriterOptions};
use crate::StoreError;
use tempo_serialization::BufferWriter;

/// One edit applied to a stream during [`edit_store`], keyed by
/// originating time.
#[derive(Clone, Debug)]
pub enum StreamEdit {
    /// Adds a message at the given time with the given payload.
    Insert {
        /// Originating (and creation) time of the new message.
        time: Time,
        /// Serialized payload.
        payload: Vec<u8>,
    },
    /// Replaces the payload of the message at the given time, preserving
    /// its originating time, creation time, and sequence id.
    Update {
        /// Originating time of the message to update.
        time: Time,
        /// Replacement payload.
        payload: Vec<u8>,
    },
    /// Removes the unique message at the given time.
    Delete {
        /// Originating time of the message to remove.
        time: Time,
    },
}

impl StreamEdit {
    fn time(&self) -> Time {
        match self {
            StreamEdit::Insert { time, .. }
            | StreamEdit::Update { time, .. }
            | StreamEdit::Delete { time } => *time,
        }
    }
}

/// Copies every stream of a store, bit for bit, into a new store.
pub fn copy_store(
    source_name: &str,
    source_path: &Path,
    destination_name: &str,
    destination_path: &Path,
) -> Result<(), StoreError> {
    transform_store(source_name, source_path, destination_name, destination_path, |_, _| {
        Transform::Keep
    })
}

/// Copies a store, retaining only messages whose originating time falls
/// within `interval`. Indices are rebuilt for the retained messages.
pub fn crop_store(
    source_name: &str,
    source_path: &Path,
    destination_name: &str,
    destination_path: &Path,
    interval: TimeInterval,
) -> Result<(), StoreError> {
    transform_store(source_name, source_path, destination_name, destination_path, |envelope, _| {
        if interval.contains(envelope.originating_time) {
            Transform::Keep
        } else {
            Transform::Drop
        }
    })
}

enum Transform {
    Keep,
    Drop,
}

/// Shared shape of copy and crop: replay the source in append order,
/// filter, and write with envelopes preserved.
fn transform_store(
    source_name: &str,
    source_path: &Path,
    destination_name: &str,
    destination_path: &Path,
    mut transform: impl FnMut(&Envelope, &[u8]) -> Transform,
) -> Result<(), StoreError> {
    let mut reader = StoreReader::open(source_name, source_path)?;
    let mut writer =
        StoreWriter::create(destination_name, destination_path, StoreWriterOptions::default())?;

    let sources: Vec<_> = reader.streams().cloned().collect();
    for metadata in &sources {
        writer.create_stream_from(metadata)?;
    }

    let entries = reader.index_entries();
    let mut buffer = Vec::new();
    let mut kept = 0u64;
    for entry in entries {
        let envelope = reader.read_message(&entry, &mut buffer)?;
        if matches!(transform(&envelope, &buffer), Transform::Keep) {
            writer.write_message(&envelope, &buffer)?;
            kept += 1;
        }
    }
    info!("wrote {kept} messages into `{destination_name}`");
    writer.close(None)?;
    Ok(())
}

/// Applies per-stream insert/update/delete operations while copying a
/// store. Unedited messages keep their originating time, creation time,
/// and sequence id; inserted messages may target times before the first
/// or after the last original message.
pub fn edit_store(
    source_name: &str,
    source_path: &Path,
    destination_name: &str,
    destination_path: &Path,
    edits: &BTreeMap<u32, Vec<StreamEdit>>,
) -> Result<(), StoreError> {
    let mut reader = StoreReader::open(source_name, source_path)?;
    let mut writer =
        StoreWriter::create(destination_name, destination_path, StoreWriterOptions::default())?;

    let sources: Vec<_> = reader.streams().cloned().collect();
    for metadata in &sources {
        writer.create_stream_from(metadata)?;
    }

    for metadata in &sources {
        let mut messages =
            reader.read_stream_messages(metadata.id, TimeInterval::infinite())?;
        let mut next_sequence = messages
            .iter()
            .map(|(envelope, _)| envelope.sequence_id + 1)
            .max()
            .unwrap_or(0);

        if let Some(stream_edits) = edits.get(&metadata.id) {
            let mut ordered = stream_edits.clone();
            ordered.sort_by_key(StreamEdit::time);
            for edit in ordered {
                match edit {
                    StreamEdit::Delete { time } => {
                        let position = messages
                            .iter()
                            .position(|(envelope, _)| envelope.originating_time == time)
                            .ok_or_else(|| {
                                StoreError::InvalidArgument(format!(
                                    "no message at {time} in stream {} to delete",
                                    metadata.id
                                ))
                            })?;
                        messages.remove(position);
                    }
                    StreamEdit::Update { time, payload } => {
                        let message = messages
                            .iter_mut()
                            .find(|(envelope, _)| envelope.originating_time == time)
                            .ok_or_else(|| {
                                StoreError::InvalidArgument(format!(
                                    "no message at {time} in stream {} to update",
                                    metadata.id
                                ))
                            })?;
                        message.1 = payload;
                    }
                    StreamEdit::Insert { time, payload } => {
                        let envelope =
                            Envelope::new(metadata.id, next_sequence, time, time);
                        next_sequence += 1;
                        let position = messages
                            .partition_point(|(e, _)| e.originating_time <= time);
                        messages.insert(position, (envelope, payload));
                    }
                }
            }
        }

        for (envelope, payload) in &messages {
            writer.write_message(envelope, payload)?;
        }
    }
    writer.close(None)?;
    Ok(())
}

/// Copies a store and adds a new stream carrying a single user-supplied
/// payload at `time`, with optional supplemental metadata.
pub fn add_stream(
    source_name: &str,
    source_path: &Path,
    destination_name: &str,
    destination_path: &Path,
    stream_name: &str,
    type_name: &str,
    payload: &[u8],
    time: Time,
    supplemental: Option<(&str, Vec<u8>)>,
) -> Result<(), StoreError> {
    let mut reader = StoreReader::open(source_name, source_path)?;
    let mut writer =
        StoreWriter::create(destination_name, destination_path, StoreWriterOptions::default())?;

    let sources: Vec<_> = reader.streams().cloned().collect();
    for metadata in &sources {
        writer.create_stream_from(metadata)?;
    }
    let entries = reader.index_entries();
    let mut buffer = Vec::new();
    for entry in entries {
        let envelope = reader.read_message(&entry, &mut buffer)?;
        writer.write_message(&envelope, &buffer)?;
    }

    let id = writer.max_stream_id().map_or(0, |max| max + 1);
    writer.create_stream(id, stream_name, type_name)?;
    if let Some((supplemental_type, bytes)) = supplemental {
        writer.set_supplemental(id, supplemental_type, bytes)?;
    }
    writer.write_message(&Envelope::new(id, 0, time, time), payload)?;
    writer.close(None)?;
    Ok(())
}

/// Outcome of a [`repair_store`] pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Messages that survived validation.
    pub valid_messages: u64,
    /// Index entries dropped as incomplete or inconsistent.
    pub dropped_entries: u64,
}

/// Restores a store left un-closed by a crashed writer.
///
/// Validates the index against the committed extent data, truncates the
/// index (and extent tails) back to the last fully committed pair,
/// rebuilds the catalog with closing times derived from the surviving
/// messages, and removes the liveness marker, after which the store
/// reads as closed.
pub fn repair_store(name: &str, path: &Path) -> Result<RepairReport, StoreError> {
    let directory = StoreReader::resolve(name, path)?;

    // Recover the stream catalog as written at create time; final
    // metadata records never made it out of the crashed writer.
    let mut recovered = match StoreReader::open(name, &directory) {
        Ok(reader) => reader,
        Err(error) => {
            return Err(StoreError::Integrity(format!(
                "store `{name}` is beyond repair: {error}"
            )))
        }
    };

    // Walk the index, keeping the prefix whose blocks decode and agree
    // with their entries.
    let entries = recovered.index_entries();
    let mut valid = Vec::new();
    let mut buffer = Vec::new();
    for entry in &entries {
        match recovered.read_message(entry, &mut buffer) {
            Ok(envelope)
                if envelope.source_id == entry.stream_id
                    && envelope.originating_time == entry.originating_time =>
            {
                valid.push((*entry, envelope, buffer.len()));
            }
            _ => break,
        }
    }
    let dropped = entries.len() as u64 - valid.len() as u64;
    if dropped > 0 {
        warn!("repair of `{name}` drops {dropped} incomplete index entries");
    }

    // Recompute stream statistics from the surviving messages.
    let mut streams: BTreeMap<u32, crate::metadata::StreamMetadata> = recovered
        .streams()
        .map(|metadata| (metadata.id, metadata.clone()))
        .collect();
    for metadata in streams.values_mut() {
        metadata.message_count = 0;
        metadata.message_size_cumulative_sum = 0;
        metadata.latency_cumulative_sum = 0;
        metadata.first_message_originating_time = Time::MAX;
        metadata.first_message_creation_time = Time::MAX;
        metadata.last_message_originating_time = Time::MIN;
        metadata.last_message_creation_time = Time::MIN;
    }
    for (_, envelope, payload_size) in &valid {
        if let Some(metadata) = streams.get_mut(&envelope.source_id) {
            metadata.update(envelope, *payload_size);
        }
    }
    for metadata in streams.values_mut() {
        metadata.is_closed = true;
        if metadata.closed_time == Time::MIN {
            metadata.closed_time = metadata.last_message_originating_time;
        }
    }

    let mut info = recovered.info().clone();
    info.closed = true;
    drop(recovered);

    truncate_index(&directory, name, valid.len() as u64)?;
    truncate_extents(&directory, name)?;
    rewrite_catalog(&directory, name, &info, streams.values())?;

    let marker = directory.join(live_marker_name(name));
    if marker.exists() {
        std::fs::remove_file(&marker)?;
    }
    info!("repaired `{name}`: {} valid messages, {dropped} dropped", valid.len());
    Ok(RepairReport { valid_messages: valid.len() as u64, dropped_entries: dropped })
}

/// Truncates the index to its first `count` records.
fn truncate_index(directory: &Path, name: &str, count: u64) -> Result<(), StoreError> {
    const HEADER_SIZE: u64 = 16;
    let path = directory.join(index_file_name(name));
    let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
    let mut header = [0u8; 16];
    file.read_exact(&mut header)?;
    LittleEndian::write_u64(&mut header[8..16], count);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.set_len(HEADER_SIZE + count * crate::index::RECORD_SIZE as u64)?;
    file.sync_all()?;
    // The mapping-based reader validates against this count on open.
    drop(IndexReader::open(directory, name)?);
    Ok(())
}

/// Truncates every extent of the data chain back to its committed cursor,
/// block-aligned.
fn truncate_extents(directory: &Path, name: &str) -> Result<(), StoreError> {
    let mut extent_id = 0u32;
    loop {
        let path = directory.join(ExtentNaming::Numbered.file_name(name, extent_id));
        if !path.exists() {
            break;
        }
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut header = [0u8; 16];
        file.read_exact(&mut header)?;
        let committed = LittleEndian::read_u64(&header[8..16]);
        let length = file.metadata()?.len();
        let aligned = committed.div_ceil(BLOCK_ALIGNMENT) * BLOCK_ALIGNMENT;
        if aligned < length {
            file.set_len(aligned)?;
            file.sync_all()?;
        }
        extent_id += 1;
    }
    Ok(())
}

/// Replaces the catalog with final records for the repaired store.
fn rewrite_catalog<'a>(
    directory: &Path,
    name: &str,
    info: &StoreInfo,
    streams: impl Iterator<Item = &'a crate::metadata::StreamMetadata>,
) -> Result<(), StoreError> {
    // Remove the old chain so a fresh single-extent catalog can be built.
    let base = catalog_name(name);
    let first = directory.join(format!("{base}.psi"));
    if first.exists() {
        std::fs::remove_file(&first)?;
    }
    let mut extent_id = 1u32;
    loop {
        let continuation = directory.join(ExtentNaming::Single.file_name(&base, extent_id));
        if !continuation.exists() {
            break;
        }
        std::fs::remove_file(&continuation)?;
        extent_id += 1;
    }

    let mut catalog = InfiniteFileWriter::create(
        directory,
        &base,
        ExtentNaming::Single,
        crate::infinite_file::DEFAULT_EXTENT_SIZE,
    )?;
    let mut buffer = BufferWriter::new();
    buffer.write_u8(RECORD_STORE_INFO);
    info.encode(&mut buffer);
    catalog.write_block(buffer.as_slice())?;
    for metadata in streams {
        buffer.reset();
        buffer.write_u8(RECORD_STREAM_METADATA);
        metadata.encode(&mut buffer);
        catalog.write_block(buffer.as_slice())?;
    }
    catalog.close()?;
    Ok(())
}

/// Lists the streams of a store without reading any messages.
pub fn list_streams(
    name: &str,
    path: &Path,
) -> Result<Vec<crate::metadata::StreamMetadata>, StoreError> {
    let reader = StoreReader::open(name, path)?;
    Ok(reader.streams().cloned().collect())
}

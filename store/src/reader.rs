//! The read side of a store, including read-while-writing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempo_serialization::{BufferReader, KnownSerializers};
use tempo_time::{Envelope, Time, TimeInterval};

use crate::index::{IndexEntry, IndexReader};
use crate::infinite_file::{ExtentNaming, InfiniteFileReader, ReadOutcome};
use crate::metadata::{StoreInfo, StreamMetadata, RECORD_STORE_INFO, RECORD_STREAM_METADATA};
use crate::wire::{decode_envelope, ENVELOPE_SIZE};
use crate::writer::{catalog_name, live_marker_name};
use crate::StoreError;

/// A reader over one store.
///
/// Readers never take the liveness marker, so any number may be attached,
/// including while a writer is appending: a reader that catches up with
/// the committed cursor polls until the marker disappears.
pub struct StoreReader {
    name: String,
    directory: PathBuf,
    info: StoreInfo,
    streams: BTreeMap<u32, StreamMetadata>,
    index: IndexReader,
    data: InfiniteFileReader,
    scratch: Vec<u8>,
}

impl StoreReader {
    /// Opens store `name` under `path`, resolving the latest
    /// auto-incremented version if versioned subdirectories exist.
    pub fn open(name: &str, path: &Path) -> Result<StoreReader, StoreError> {
        let directory = Self::resolve(name, path)?;
        let (info, streams) = read_catalog(&directory, name)?;
        let index = IndexReader::open(&directory, name)?;
        let data = InfiniteFileReader::open(&directory, name, ExtentNaming::Numbered)?;
        Ok(StoreReader {
            name: name.to_string(),
            directory,
            info,
            streams,
            index,
            data,
            scratch: Vec::new(),
        })
    }

    /// Resolves the directory of the latest version of store `name`.
    pub fn resolve(name: &str, path: &Path) -> Result<PathBuf, StoreError> {
        let catalog_file = |dir: &Path| dir.join(format!("{}.psi", catalog_name(name)));
        // Versioned subdirectories win over a store in the path itself.
        let mut latest: Option<(u32, PathBuf)> = None;
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                if let Some(suffix) = file_name.strip_prefix(&format!("{name}.")) {
                    if let Ok(version) = suffix.parse::<u32>() {
                        let candidate = entry.path();
                        if catalog_file(&candidate).exists()
                            && latest.as_ref().is_none_or(|(best, _)| version > *best)
                        {
                            latest = Some((version, candidate));
                        }
                    }
                }
            }
        }
        if let Some((_, directory)) = latest {
            return Ok(directory);
        }
        if catalog_file(path).exists() {
            return Ok(path.to_path_buf());
        }
        Err(StoreError::NotFound { name: name.to_string(), path: path.to_path_buf() })
    }

    /// The store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory holding the store files.
    pub fn path(&self) -> &Path {
        &self.directory
    }

    /// The store-level info record.
    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    /// True once the writer closed the store cleanly.
    pub fn is_closed(&self) -> bool {
        self.info.closed
    }

    /// True while a writer holds the liveness marker.
    pub fn is_live(&self) -> bool {
        self.directory.join(live_marker_name(&self.name)).exists()
    }

    /// Validates the store's serialization system version against a
    /// registry's configured minimum.
    pub fn validate_serialization(&self, known: &KnownSerializers) -> Result<(), StoreError> {
        known.accept_version(self.info.serialization_system_version)?;
        Ok(())
    }

    /// Metadata of every cataloged stream.
    pub fn streams(&self) -> impl Iterator<Item = &StreamMetadata> {
        self.streams.values()
    }

    /// Metadata of the stream named `name`.
    pub fn stream(&self, name: &str) -> Option<&StreamMetadata> {
        self.streams.values().find(|metadata| metadata.name == name)
    }

    /// Metadata of the stream with identity `id`.
    pub fn stream_by_id(&self, id: u32) -> Option<&StreamMetadata> {
        self.streams.get(&id)
    }

    /// Number of index entries currently visible.
    pub fn message_count(&self) -> u64 {
        self.index.count()
    }

    /// The index entry at `position`.
    pub fn index_entry(&self, position: u64) -> IndexEntry {
        self.index.entry(position)
    }

    /// Index entries in append (creation) order.
    pub fn index_entries(&self) -> Vec<IndexEntry> {
        self.index.iter().collect()
    }

    /// Index entries sorted by originating time, ties kept in append
    /// order; this is replay order.
    pub fn entries_in_originating_order(&self) -> Vec<IndexEntry> {
        let mut entries = self.index_entries();
        entries.sort_by_key(|entry| entry.originating_time);
        entries
    }

    /// Reads the message block of `entry`; the payload lands in `buffer`.
    pub fn read_message(
        &mut self,
        entry: &IndexEntry,
        buffer: &mut Vec<u8>,
    ) -> Result<Envelope, StoreError> {
        self.data.read_at(entry.extent_id, entry.position, &mut self.scratch)?;
        let envelope = decode_envelope(&self.scratch)?;
        buffer.clear();
        buffer.extend_from_slice(&self.scratch[ENVELOPE_SIZE..]);
        Ok(envelope)
    }

    /// Reads every message of `stream_id` within `interval`, in
    /// originating order.
    pub fn read_stream_messages(
        &mut self,
        stream_id: u32,
        interval: TimeInterval,
    ) -> Result<Vec<(Envelope, Vec<u8>)>, StoreError> {
        let entries: Vec<IndexEntry> = self
            .entries_in_originating_order()
            .into_iter()
            .filter(|entry| {
                entry.stream_id == stream_id && interval.contains(entry.originating_time)
            })
            .collect();
        let mut messages = Vec::with_capacity(entries.len());
        let mut buffer = Vec::new();
        for entry in entries {
            let envelope = self.read_message(&entry, &mut buffer)?;
            messages.push((envelope, buffer.clone()));
        }
        Ok(messages)
    }

    /// Re-reads the catalog and index to observe a live writer's progress.
    pub fn refresh(&mut self) -> Result<(), StoreError> {
        let (info, streams) = read_catalog(&self.directory, &self.name)?;
        self.info = info;
        self.streams = streams;
        self.index.refresh()?;
        self.data.refresh()?;
        Ok(())
    }

    /// Waits until more than `seen` index entries are visible or the
    /// store goes non-live; true if new entries arrived within `timeout`.
    pub fn wait_for_messages(&mut self, seen: u64, timeout: Duration) -> Result<bool, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.index.refresh()?;
            if self.index.count() > seen {
                return Ok(true);
            }
            if !self.is_live() {
                // One final refresh: the writer may have finished between
                // the count check and the marker check.
                self.index.refresh()?;
                return Ok(self.index.count() > seen);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// The earliest and latest originating times across all streams, or
    /// `None` for an empty store.
    pub fn originating_time_range(&self) -> Option<(Time, Time)> {
        let mut range: Option<(Time, Time)> = None;
        for metadata in self.streams.values() {
            if metadata.message_count == 0 {
                continue;
            }
            let first = metadata.first_message_originating_time;
            let last = metadata.last_message_originating_time;
            range = Some(match range {
                None => (first, last),
                Some((lo, hi)) => (lo.min(first), hi.max(last)),
            });
        }
        // Fall back to the index when metadata statistics are stale
        // (e.g. a repaired or live store).
        if range.is_none() && self.index.count() > 0 {
            let mut lo = Time::MAX;
            let mut hi = Time::MIN;
            for entry in self.index.iter() {
                lo = lo.min(entry.originating_time);
                hi = hi.max(entry.originating_time);
            }
            return Some((lo, hi));
        }
        range
    }
}

/// Reads the catalog chain; the last record per stream and the last info
/// record win.
fn read_catalog(
    directory: &Path,
    name: &str,
) -> Result<(StoreInfo, BTreeMap<u32, StreamMetadata>), StoreError> {
    let mut reader = InfiniteFileReader::open(directory, &catalog_name(name), ExtentNaming::Single)?;
    let mut info: Option<StoreInfo> = None;
    let mut streams = BTreeMap::new();
    let mut buffer = Vec::new();
    loop {
        match reader.move_next(false)? {
            ReadOutcome::Block { .. } => {
                reader.read_block(&mut buffer)?;
                let mut record = BufferReader::new(&buffer);
                match record.read_u8()? {
                    RECORD_STORE_INFO => info = Some(StoreInfo::decode(&mut record)?),
                    RECORD_STREAM_METADATA => {
                        let metadata = StreamMetadata::decode(&mut record)?;
                        streams.insert(metadata.id, metadata);
                    }
                    tag => {
                        return Err(StoreError::Integrity(format!(
                            "unknown catalog record tag {tag}"
                        )))
                    }
                }
            }
            ReadOutcome::Eof | ReadOutcome::NotReady => break,
        }
    }
    let info = info.ok_or_else(|| {
        StoreError::Integrity(String::from("catalog carries no store info record"))
    })?;
    Ok((info, streams))
}

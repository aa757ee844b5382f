//! The store index: fixed-width records mapping message times to extent
//! positions, sized for binary search.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{Mmap, MmapMut};

use tempo_time::Time;

use crate::StoreError;

const INDEX_MAGIC: u32 = 0x544D_4958; // "TMIX"
const HEADER_SIZE: usize = 16;
/// On-disk size of one [`IndexEntry`].
pub const RECORD_SIZE: usize = 32;
/// The file grows in steps of this many records.
const GROWTH_RECORDS: usize = 32 * 1024;

/// One index record: where the message at a given time lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Originating time of the indexed message.
    pub originating_time: Time,
    /// Creation time of the indexed message.
    pub creation_time: Time,
    /// Stream the message belongs to.
    pub stream_id: u32,
    /// Extent holding the message block.
    pub extent_id: u32,
    /// Offset of the block within its extent.
    pub position: u32,
}

impl IndexEntry {
    fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_i64(&mut out[0..8], self.originating_time.ticks());
        LittleEndian::write_i64(&mut out[8..16], self.creation_time.ticks());
        LittleEndian::write_u32(&mut out[16..20], self.stream_id);
        LittleEndian::write_u32(&mut out[20..24], self.extent_id);
        LittleEndian::write_u32(&mut out[24..28], self.position);
        LittleEndian::write_u32(&mut out[28..32], 0);
    }

    fn decode(input: &[u8]) -> IndexEntry {
        IndexEntry {
            originating_time: Time::from_ticks(LittleEndian::read_i64(&input[0..8])),
            creation_time: Time::from_ticks(LittleEndian::read_i64(&input[8..16])),
            stream_id: LittleEndian::read_u32(&input[16..20]),
            extent_id: LittleEndian::read_u32(&input[20..24]),
            position: LittleEndian::read_u32(&input[24..28]),
        }
    }
}

fn count_cell(map: &MmapMut) -> &AtomicU64 {
    unsafe { &*(map.as_ptr().add(8) as *const AtomicU64) }
}

/// File name of the index of store `name`.
pub fn index_file_name(name: &str) -> String {
    format!("{name}.Index.psi")
}

/// The append side of an index file.
pub struct IndexWriter {
    path: PathBuf,
    file: File,
    map: MmapMut,
    count: u64,
    closed: bool,
}

impl IndexWriter {
    /// Creates the index of store `name` under `directory`.
    pub fn create(directory: &Path, name: &str) -> Result<Self, StoreError> {
        let path = directory.join(index_file_name(name));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len((HEADER_SIZE + GROWTH_RECORDS * RECORD_SIZE) as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        LittleEndian::write_u32(&mut map[0..4], INDEX_MAGIC);
        count_cell(&map).store(0, Ordering::Release);
        Ok(IndexWriter { path, file, map, count: 0, closed: false })
    }

    /// Appends an entry and publishes the new count.
    pub fn append(&mut self, entry: &IndexEntry) -> Result<(), StoreError> {
        assert!(!self.closed, "index writer is closed");
        let offset = HEADER_SIZE + self.count as usize * RECORD_SIZE;
        if offset + RECORD_SIZE > self.map.len() {
            self.grow()?;
        }
        entry.encode(&mut self.map[offset..offset + RECORD_SIZE]);
        self.count += 1;
        count_cell(&self.map).store(self.count, Ordering::Release);
        Ok(())
    }

    fn grow(&mut self) -> Result<(), StoreError> {
        let new_length = self.map.len() as u64 + (GROWTH_RECORDS * RECORD_SIZE) as u64;
        self.map.flush()?;
        self.file.set_len(new_length)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    /// Entries appended so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flushes mapped writes.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.map.flush()?;
        Ok(())
    }

    /// Flushes and truncates the file to the committed records.
    pub fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.map.flush()?;
        self.file.set_len((HEADER_SIZE + self.count as usize * RECORD_SIZE) as u64)?;
        self.file.sync_all()?;
        self.closed = true;
        Ok(())
    }

    /// The index file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// The read side of an index file.
pub struct IndexReader {
    path: PathBuf,
    map: Mmap,
}

impl IndexReader {
    /// Opens the index of store `name` under `directory`.
    pub fn open(directory: &Path, name: &str) -> Result<Self, StoreError> {
        let path = directory.join(index_file_name(name));
        let file = File::open(&path).map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound { name: name.to_string(), path: path.clone() }
            } else {
                StoreError::Io(error)
            }
        })?;
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < HEADER_SIZE || LittleEndian::read_u32(&map[0..4]) != INDEX_MAGIC {
            return Err(StoreError::Integrity(format!(
                "{} is not an index file",
                path.display()
            )));
        }
        Ok(IndexReader { path, map })
    }

    /// Committed entries visible through the current mapping.
    pub fn count(&self) -> u64 {
        let published = unsafe { &*(self.map.as_ptr().add(8) as *const AtomicU64) }
            .load(Ordering::Acquire);
        let mappable = ((self.map.len() - HEADER_SIZE) / RECORD_SIZE) as u64;
        published.min(mappable)
    }

    /// The entry at `position`, which must be below `count()`.
    pub fn entry(&self, position: u64) -> IndexEntry {
        assert!(position < self.count(), "index position out of range");
        let offset = HEADER_SIZE + position as usize * RECORD_SIZE;
        IndexEntry::decode(&self.map[offset..offset + RECORD_SIZE])
    }

    /// Position of the first entry with originating time at or after
    /// `time`, assuming entries were appended in non-decreasing
    /// originating order per stream but interleaved across streams; the
    /// result is a conservative starting point for a scan.
    pub fn first_at_or_after(&self, time: Time) -> u64 {
        let count = self.count();
        let mut low = 0u64;
        let mut high = count;
        while low < high {
            let mid = (low + high) / 2;
            if self.entry(mid).originating_time < time {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// Re-maps the file to observe growth of a live index.
    pub fn refresh(&mut self) -> Result<(), StoreError> {
        let file = File::open(&self.path)?;
        self.map = unsafe { Mmap::map(&file)? };
        Ok(())
    }

    /// Iterates all visible entries.
    pub fn iter(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        (0..self.count()).map(move |i| self.entry(i))
    }
}

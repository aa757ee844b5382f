//! An unbounded append log built from chained memory-mapped extents.
//!
//! Each extent is a fixed-size file whose header carries a committed
//! cursor. Writers fill blocks with the reserve/write/commit protocol;
//! the commit publishes the cursor with a release store, so a reader
//! mapping the same extent observes only whole blocks. The last block of
//! a full extent is a continuation record naming the next extent; closing
//! truncates the tail to a 4 KiB boundary.
//!
//! Visibility contract: everything up to the cursor published by the most
//! recent `commit_block` is visible to a concurrent reader; a reserved but
//! uncommitted block is not.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{Mmap, MmapMut};

use crate::StoreError;

/// Magic tag at the head of every extent.
const EXTENT_MAGIC: u32 = 0x544D_5031; // "TMP1"
/// Extent header: magic, extent id, committed cursor.
const HEADER_SIZE: usize = 16;
/// Block length prefix.
const LENGTH_PREFIX: usize = 4;
/// Length value marking a continuation record.
const CONTINUATION: u32 = u32::MAX;
/// Continuation record size: prefix plus next extent id.
const CONTINUATION_SIZE: usize = LENGTH_PREFIX + 4;
/// Closed extents are truncated to a multiple of this.
pub const BLOCK_ALIGNMENT: u64 = 4096;
/// Default extent capacity.
pub const DEFAULT_EXTENT_SIZE: usize = 256 * 1024 * 1024;

/// How extent files of a logical name are laid out on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentNaming {
    /// `name_000000.psi`, `name_000001.psi`, ... (message data).
    Numbered,
    /// `name.psi` for the first extent, numbered thereafter (catalog).
    Single,
}

impl ExtentNaming {
    /// File name of extent `id` for logical name `name`.
    pub fn file_name(&self, name: &str, id: u32) -> String {
        match self {
            ExtentNaming::Numbered => format!("{name}_{id:06}.psi"),
            ExtentNaming::Single if id == 0 => format!("{name}.psi"),
            ExtentNaming::Single => format!("{name}_{id:06}.psi"),
        }
    }
}

fn committed_cell(map: &MmapMut) -> &AtomicU64 {
    // The mapping is page-aligned, so offset 8 is suitably aligned for an
    // atomic u64.
    unsafe { &*(map.as_ptr().add(8) as *const AtomicU64) }
}

fn committed_of(map: &Mmap) -> u64 {
    let cell = unsafe { &*(map.as_ptr().add(8) as *const AtomicU64) };
    cell.load(Ordering::Acquire)
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// The append side of an extent chain.
pub struct InfiniteFileWriter {
    directory: PathBuf,
    name: String,
    naming: ExtentNaming,
    extent_size: usize,
    extent_id: u32,
    file: File,
    map: MmapMut,
    committed: usize,
    reserved: Option<Reservation>,
    closed: bool,
}

struct Reservation {
    /// Offset of the block's length prefix.
    start: usize,
    written: usize,
    capacity: usize,
}

impl InfiniteFileWriter {
    /// Creates the first extent of a new chain under `directory`.
    pub fn create(
        directory: &Path,
        name: &str,
        naming: ExtentNaming,
        extent_size: usize,
    ) -> Result<Self, StoreError> {
        assert!(
            extent_size >= HEADER_SIZE + CONTINUATION_SIZE + LENGTH_PREFIX,
            "extent too small to hold a block"
        );
        let (file, map) = Self::create_extent(directory, name, naming, 0, extent_size)?;
        Ok(InfiniteFileWriter {
            directory: directory.to_path_buf(),
            name: name.to_string(),
            naming,
            extent_size,
            extent_id: 0,
            file,
            map,
            committed: HEADER_SIZE,
            reserved: None,
            closed: false,
        })
    }

    fn create_extent(
        directory: &Path,
        name: &str,
        naming: ExtentNaming,
        id: u32,
        extent_size: usize,
    ) -> Result<(File, MmapMut), StoreError> {
        let path = directory.join(naming.file_name(name, id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(extent_size as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        LittleEndian::write_u32(&mut map[0..4], EXTENT_MAGIC);
        LittleEndian::write_u32(&mut map[4..8], id);
        committed_cell(&map).store(HEADER_SIZE as u64, Ordering::Release);
        Ok((file, map))
    }

    /// The logical name of the chain.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The extent currently being appended to.
    pub fn current_extent(&self) -> u32 {
        self.extent_id
    }

    /// Begins a block of at most `capacity` payload bytes, rotating to a
    /// new extent if the current one cannot hold it.
    pub fn reserve_block(&mut self, capacity: usize) -> Result<(), StoreError> {
        assert!(self.reserved.is_none(), "previous block was not committed");
        assert!(!self.closed, "writer is closed");
        let needed = LENGTH_PREFIX + capacity + CONTINUATION_SIZE;
        if needed > self.extent_size - HEADER_SIZE {
            return Err(StoreError::InvalidArgument(format!(
                "block of {capacity} bytes exceeds the extent capacity"
            )));
        }
        if self.committed + needed > self.extent_size {
            self.rotate_extent()?;
        }
        self.reserved = Some(Reservation { start: self.committed, written: 0, capacity });
        Ok(())
    }

    /// Appends `bytes` to the reserved block.
    pub fn write_to_block(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let reservation = self.reserved.as_mut().expect("no block reserved");
        if reservation.written + bytes.len() > reservation.capacity {
            return Err(StoreError::InvalidArgument(format!(
                "block overflow: reserved {}, writing past it",
                reservation.capacity
            )));
        }
        let offset = reservation.start + LENGTH_PREFIX + reservation.written;
        self.map[offset..offset + bytes.len()].copy_from_slice(bytes);
        reservation.written += bytes.len();
        Ok(())
    }

    /// Seals the reserved block and publishes it to readers.
    ///
    /// Returns `(extent id, block offset)` for indexing.
    pub fn commit_block(&mut self) -> Result<(u32, u32), StoreError> {
        let reservation = self.reserved.take().expect("no block reserved");
        let start = reservation.start;
        LittleEndian::write_u32(
            &mut self.map[start..start + LENGTH_PREFIX],
            reservation.written as u32,
        );
        self.committed = start + LENGTH_PREFIX + reservation.written;
        committed_cell(&self.map).store(self.committed as u64, Ordering::Release);
        Ok((self.extent_id, start as u32))
    }

    /// Writes a whole block in one call.
    pub fn write_block(&mut self, bytes: &[u8]) -> Result<(u32, u32), StoreError> {
        self.reserve_block(bytes.len())?;
        self.write_to_block(bytes)?;
        self.commit_block()
    }

    fn rotate_extent(&mut self) -> Result<(), StoreError> {
        let next_id = self.extent_id + 1;
        // The successor must exist before the continuation record becomes
        // visible, or a racing reader would chase a missing file.
        let (file, map) =
            Self::create_extent(&self.directory, &self.name, self.naming, next_id, self.extent_size)?;

        let start = self.committed;
        LittleEndian::write_u32(&mut self.map[start..start + 4], CONTINUATION);
        LittleEndian::write_u32(&mut self.map[start + 4..start + 8], next_id);
        self.committed = start + CONTINUATION_SIZE;
        committed_cell(&self.map).store(self.committed as u64, Ordering::Release);
        self.map.flush()?;

        // Truncate the finished extent to the block alignment.
        let length = align_up(self.committed as u64, BLOCK_ALIGNMENT).min(self.extent_size as u64);
        let old_file = std::mem::replace(&mut self.file, file);
        let old_map = std::mem::replace(&mut self.map, map);
        drop(old_map);
        old_file.set_len(length)?;
        old_file.sync_all()?;

        self.extent_id = next_id;
        self.committed = HEADER_SIZE;
        Ok(())
    }

    /// Flushes mapped writes to the file.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.map.flush()?;
        Ok(())
    }

    /// Flushes and truncates the final extent to the block alignment.
    pub fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        assert!(self.reserved.is_none(), "closing with an uncommitted block");
        self.map.flush()?;
        let length = align_up(self.committed as u64, BLOCK_ALIGNMENT).min(self.extent_size as u64);
        self.file.set_len(length)?;
        self.file.sync_all()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for InfiniteFileWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Outcome of advancing a sequential reader.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A committed block is available at the reader's cursor.
    Block {
        /// Extent holding the block.
        extent_id: u32,
        /// Offset of the block's length prefix.
        position: u32,
        /// Payload length.
        length: usize,
    },
    /// The reader caught up with the writer; poll again later.
    NotReady,
    /// No further data will ever appear.
    Eof,
}

/// The read side of an extent chain: sequential iteration plus random
/// access for index-directed reads.
pub struct InfiniteFileReader {
    directory: PathBuf,
    name: String,
    naming: ExtentNaming,
    extent_id: u32,
    map: Mmap,
    position: usize,
    current: Option<(u32, usize)>,
}

impl InfiniteFileReader {
    /// Opens the chain at its first extent.
    pub fn open(directory: &Path, name: &str, naming: ExtentNaming) -> Result<Self, StoreError> {
        let map = Self::map_extent(directory, name, naming, 0)?;
        Ok(InfiniteFileReader {
            directory: directory.to_path_buf(),
            name: name.to_string(),
            naming,
            extent_id: 0,
            map,
            position: HEADER_SIZE,
            current: None,
        })
    }

    fn map_extent(
        directory: &Path,
        name: &str,
        naming: ExtentNaming,
        id: u32,
    ) -> Result<Mmap, StoreError> {
        let path = directory.join(naming.file_name(name, id));
        let file = File::open(&path).map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound { name: name.to_string(), path: path.clone() }
            } else {
                StoreError::Io(error)
            }
        })?;
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < HEADER_SIZE || LittleEndian::read_u32(&map[0..4]) != EXTENT_MAGIC {
            return Err(StoreError::Integrity(format!(
                "{} is not an extent file",
                path.display()
            )));
        }
        Ok(map)
    }

    /// Advances to the next committed block, following continuation
    /// records across extents. `live` reports whether a writer may still
    /// be attached; when false, catching up with the cursor means `Eof`.
    pub fn move_next(&mut self, live: bool) -> Result<ReadOutcome, StoreError> {
        loop {
            let committed = committed_of(&self.map) as usize;
            if self.position >= committed {
                // A finished extent may have been truncated after we
                // mapped it; remap to observe the final cursor.
                return Ok(if live { ReadOutcome::NotReady } else { ReadOutcome::Eof });
            }
            if self.position + LENGTH_PREFIX > self.map.len() {
                return Err(StoreError::Integrity(String::from(
                    "committed cursor points past the extent",
                )));
            }
            let length =
                LittleEndian::read_u32(&self.map[self.position..self.position + LENGTH_PREFIX]);
            if length == CONTINUATION {
                let next_id =
                    LittleEndian::read_u32(&self.map[self.position + 4..self.position + 8]);
                self.map = Self::map_extent(&self.directory, &self.name, self.naming, next_id)?;
                self.extent_id = next_id;
                self.position = HEADER_SIZE;
                continue;
            }
            let length = length as usize;
            if self.position + LENGTH_PREFIX + length > committed {
                return Err(StoreError::Integrity(String::from(
                    "block extends past the committed cursor",
                )));
            }
            let outcome = ReadOutcome::Block {
                extent_id: self.extent_id,
                position: self.position as u32,
                length,
            };
            self.current = Some((self.extent_id, self.position));
            self.position += LENGTH_PREFIX + length;
            return Ok(outcome);
        }
    }

    /// Copies the current block (the one `move_next` just returned) into
    /// `buffer`, resizing it as needed. Returns the payload length.
    pub fn read_block(&mut self, buffer: &mut Vec<u8>) -> Result<usize, StoreError> {
        let (extent_id, position) = self.current.expect("no current block");
        debug_assert_eq!(extent_id, self.extent_id);
        self.copy_block(position, buffer)
    }

    /// Random access read of the block at `(extent_id, position)`.
    pub fn read_at(
        &mut self,
        extent_id: u32,
        position: u32,
        buffer: &mut Vec<u8>,
    ) -> Result<usize, StoreError> {
        if extent_id != self.extent_id {
            self.map = Self::map_extent(&self.directory, &self.name, self.naming, extent_id)?;
            self.extent_id = extent_id;
            self.position = HEADER_SIZE;
            self.current = None;
        }
        self.copy_block(position as usize, buffer)
    }

    fn copy_block(&self, position: usize, buffer: &mut Vec<u8>) -> Result<usize, StoreError> {
        if position + LENGTH_PREFIX > self.map.len() {
            return Err(StoreError::Integrity(String::from("block offset out of range")));
        }
        let length =
            LittleEndian::read_u32(&self.map[position..position + LENGTH_PREFIX]) as usize;
        let start = position + LENGTH_PREFIX;
        if start + length > self.map.len() {
            return Err(StoreError::Integrity(String::from("block extends past the extent")));
        }
        buffer.resize(length, 0);
        buffer.copy_from_slice(&self.map[start..start + length]);
        Ok(length)
    }

    /// Re-maps the current extent, picking up growth of a live file.
    pub fn refresh(&mut self) -> Result<(), StoreError> {
        self.map = Self::map_extent(&self.directory, &self.name, self.naming, self.extent_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn round_trip(blocks: &[&[u8]], extent_size: usize) -> Vec<Vec<u8>> {
        let dir = TempDir::new().unwrap();
        let mut writer =
            InfiniteFileWriter::create(dir.path(), "log", ExtentNaming::Numbered, extent_size)
                .unwrap();
        for block in blocks {
            writer.reserve_block(block.len()).unwrap();
            // Split writes to exercise the streaming path.
            let half = block.len() / 2;
            writer.write_to_block(&block[..half]).unwrap();
            writer.write_to_block(&block[half..]).unwrap();
            writer.commit_block().unwrap();
        }
        writer.close().unwrap();

        let mut reader =
            InfiniteFileReader::open(dir.path(), "log", ExtentNaming::Numbered).unwrap();
        let mut result = Vec::new();
        let mut buffer = Vec::new();
        loop {
            match reader.move_next(false).unwrap() {
                ReadOutcome::Block { .. } => {
                    reader.read_block(&mut buffer).unwrap();
                    result.push(buffer.clone());
                }
                ReadOutcome::Eof => break,
                ReadOutcome::NotReady => unreachable!("closed store"),
            }
        }
        result
    }

    #[test]
    fn blocks_read_back_in_order() {
        let blocks: Vec<Vec<u8>> = (0u8..10).map(|i| vec![i; 100 + i as usize]).collect();
        let refs: Vec<&[u8]> = blocks.iter().map(|b| b.as_slice()).collect();
        assert_eq!(round_trip(&refs, DEFAULT_EXTENT_SIZE), blocks);
    }

    #[test]
    fn rotation_chains_extents() {
        // Small extents force several rotations.
        let blocks: Vec<Vec<u8>> = (0u8..20).map(|i| vec![i; 1000]).collect();
        let refs: Vec<&[u8]> = blocks.iter().map(|b| b.as_slice()).collect();
        let read = round_trip(&refs, 4096);
        assert_eq!(read, blocks);
    }

    #[test]
    fn closed_extents_are_block_aligned() {
        let dir = TempDir::new().unwrap();
        let mut writer =
            InfiniteFileWriter::create(dir.path(), "log", ExtentNaming::Numbered, 1 << 20)
                .unwrap();
        writer.write_block(&[7u8; 100]).unwrap();
        writer.close().unwrap();
        let length = std::fs::metadata(dir.path().join("log_000000.psi")).unwrap().len();
        assert_eq!(length % BLOCK_ALIGNMENT, 0);
        assert!(length <= BLOCK_ALIGNMENT);
    }

    #[test]
    fn reader_sees_only_committed_blocks() {
        let dir = TempDir::new().unwrap();
        let mut writer =
            InfiniteFileWriter::create(dir.path(), "log", ExtentNaming::Numbered, 1 << 20)
                .unwrap();
        writer.write_block(b"first").unwrap();
        writer.reserve_block(5).unwrap();
        writer.write_to_block(b"parti").unwrap();

        let mut reader =
            InfiniteFileReader::open(dir.path(), "log", ExtentNaming::Numbered).unwrap();
        let mut buffer = Vec::new();
        assert!(matches!(reader.move_next(true).unwrap(), ReadOutcome::Block { .. }));
        reader.read_block(&mut buffer).unwrap();
        assert_eq!(&buffer, b"first");
        // The reserved-but-uncommitted block is invisible.
        assert_eq!(reader.move_next(true).unwrap(), ReadOutcome::NotReady);

        writer.commit_block().unwrap();
        assert!(matches!(reader.move_next(true).unwrap(), ReadOutcome::Block { .. }));
        reader.read_block(&mut buffer).unwrap();
        assert_eq!(&buffer, b"parti");
    }

    #[test]
    fn single_naming_uses_bare_file() {
        let dir = TempDir::new().unwrap();
        let mut writer =
            InfiniteFileWriter::create(dir.path(), "log.Catalog", ExtentNaming::Single, 1 << 20)
                .unwrap();
        writer.write_block(b"entry").unwrap();
        writer.close().unwrap();
        assert!(dir.path().join("log.Catalog.psi").exists());
    }
}

//! Per-stream metadata and the store-level info record.
//!
//! Three metadata layouts exist on disk. Version 0 carried `i32` averages
//! of message size and latency; version 1 added the supplemental metadata
//! block; version 2 replaced the averages with `i64` cumulative sums (and
//! latency in ticks) and added the runtime type list. Readers accept all
//! three; writers always emit the newest.

use tempo_serialization::{BufferReader, BufferWriter};
use tempo_time::{Envelope, Time, TimeSpan, TICKS_PER_MICROSECOND};

use crate::StoreError;

/// Newest metadata layout written by this runtime.
pub const METADATA_VERSION: u32 = 2;

/// Name this runtime records in the store info.
pub const RUNTIME_NAME: &str = "tempo";
/// Version this runtime records in the store info.
pub const RUNTIME_VERSION: u32 = 1;

/// Catalog record tag: store info.
pub const RECORD_STORE_INFO: u8 = 0;
/// Catalog record tag: stream metadata.
pub const RECORD_STREAM_METADATA: u8 = 1;

/// Everything the store knows about one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMetadata {
    /// Stream identity within the store.
    pub id: u32,
    /// Stream name, unique within the store.
    pub name: String,
    /// Fully qualified payload type name.
    pub type_name: String,
    /// When the stream was opened for writing.
    pub opened_time: Time,
    /// When the stream was closed; meaningful only if `is_closed`.
    pub closed_time: Time,
    /// True once no further messages will be appended.
    pub is_closed: bool,
    /// Messages written.
    pub message_count: i64,
    /// Sum of payload sizes in bytes.
    pub message_size_cumulative_sum: i64,
    /// Sum of message latencies in ticks.
    pub latency_cumulative_sum: i64,
    /// Originating time of the first message, `Time::MAX` if none.
    pub first_message_originating_time: Time,
    /// Creation time of the first message, `Time::MAX` if none.
    pub first_message_creation_time: Time,
    /// Originating time of the last message, `Time::MIN` if none.
    pub last_message_originating_time: Time,
    /// Creation time of the last message, `Time::MIN` if none.
    pub last_message_creation_time: Time,
    /// Type name of the supplemental metadata payload, if any.
    pub supplemental_type_name: Option<String>,
    /// Serialized supplemental metadata, empty if none.
    pub supplemental_bytes: Vec<u8>,
    /// Additional runtime type names registered for this stream.
    pub runtime_types: Vec<String>,
}

impl StreamMetadata {
    /// Creates metadata for a newly opened stream.
    pub fn new(id: u32, name: &str, type_name: &str, opened_time: Time) -> StreamMetadata {
        StreamMetadata {
            id,
            name: name.to_string(),
            type_name: type_name.to_string(),
            opened_time,
            closed_time: Time::MIN,
            is_closed: false,
            message_count: 0,
            message_size_cumulative_sum: 0,
            latency_cumulative_sum: 0,
            first_message_originating_time: Time::MAX,
            first_message_creation_time: Time::MAX,
            last_message_originating_time: Time::MIN,
            last_message_creation_time: Time::MIN,
            supplemental_type_name: None,
            supplemental_bytes: Vec::new(),
            runtime_types: Vec::new(),
        }
    }

    /// Folds one written message into the statistics.
    pub fn update(&mut self, envelope: &Envelope, payload_size: usize) {
        if self.message_count == 0 {
            self.first_message_originating_time = envelope.originating_time;
            self.first_message_creation_time = envelope.creation_time;
        }
        self.message_count += 1;
        self.message_size_cumulative_sum += payload_size as i64;
        self.latency_cumulative_sum += envelope.latency().ticks();
        self.last_message_originating_time = envelope.originating_time;
        self.last_message_creation_time = envelope.creation_time;
    }

    /// Mean payload size in bytes, zero for an empty stream.
    pub fn average_message_size(&self) -> i64 {
        if self.message_count == 0 {
            0
        } else {
            self.message_size_cumulative_sum / self.message_count
        }
    }

    /// Mean latency, zero for an empty stream.
    pub fn average_latency(&self) -> TimeSpan {
        if self.message_count == 0 {
            TimeSpan::ZERO
        } else {
            TimeSpan::from_ticks(self.latency_cumulative_sum / self.message_count)
        }
    }

    /// Writes the newest layout.
    pub fn encode(&self, writer: &mut BufferWriter) {
        writer.write_u32(METADATA_VERSION);
        writer.write_u32(self.id);
        writer.write_string(&self.name);
        writer.write_string(&self.type_name);
        writer.write_i64(self.opened_time.ticks());
        writer.write_i64(self.closed_time.ticks());
        writer.write_u8(self.is_closed as u8);
        writer.write_i64(self.message_count);
        writer.write_i64(self.message_size_cumulative_sum);
        writer.write_i64(self.latency_cumulative_sum);
        writer.write_i64(self.first_message_originating_time.ticks());
        writer.write_i64(self.first_message_creation_time.ticks());
        writer.write_i64(self.last_message_originating_time.ticks());
        writer.write_i64(self.last_message_creation_time.ticks());
        match &self.supplemental_type_name {
            Some(name) => {
                writer.write_u8(1);
                writer.write_string(name);
                writer.write_bytes(&self.supplemental_bytes);
            }
            None => writer.write_u8(0),
        }
        writer.write_u32(self.runtime_types.len() as u32);
        for runtime_type in &self.runtime_types {
            writer.write_string(runtime_type);
        }
    }

    /// Reads any supported layout, upgrading to the in-memory (v2) form.
    pub fn decode(reader: &mut BufferReader<'_>) -> Result<StreamMetadata, StoreError> {
        let version = reader.read_u32()?;
        if version > METADATA_VERSION {
            return Err(StoreError::Integrity(format!(
                "stream metadata version {version} is newer than supported ({METADATA_VERSION})"
            )));
        }
        let id = reader.read_u32()?;
        let name = reader.read_string()?;
        let type_name = reader.read_string()?;
        let opened_time = Time::from_ticks(reader.read_i64()?);
        let closed_time = Time::from_ticks(reader.read_i64()?);
        let is_closed = reader.read_u8()? != 0;

        let (message_count, size_sum, latency_sum) = if version >= 2 {
            (reader.read_i64()?, reader.read_i64()?, reader.read_i64()?)
        } else {
            // v0/v1 carried i32 count and i32 averages (latency in
            // microseconds); reconstitute the cumulative sums.
            let count = reader.read_i32()? as i64;
            let average_size = reader.read_i32()? as i64;
            let average_latency_us = reader.read_i32()? as i64;
            (
                count,
                average_size * count,
                average_latency_us * TICKS_PER_MICROSECOND * count,
            )
        };

        let first_message_originating_time = Time::from_ticks(reader.read_i64()?);
        let first_message_creation_time = Time::from_ticks(reader.read_i64()?);
        let last_message_originating_time = Time::from_ticks(reader.read_i64()?);
        let last_message_creation_time = Time::from_ticks(reader.read_i64()?);

        let (supplemental_type_name, supplemental_bytes) = if version >= 1 {
            if reader.read_u8()? != 0 {
                (Some(reader.read_string()?), reader.read_bytes()?)
            } else {
                (None, Vec::new())
            }
        } else {
            (None, Vec::new())
        };

        let runtime_types = if version >= 2 {
            let count = reader.read_u32()? as usize;
            let mut types = Vec::with_capacity(count);
            for _ in 0..count {
                types.push(reader.read_string()?);
            }
            types
        } else {
            Vec::new()
        };

        Ok(StreamMetadata {
            id,
            name,
            type_name,
            opened_time,
            closed_time,
            is_closed,
            message_count,
            message_size_cumulative_sum: size_sum,
            latency_cumulative_sum: latency_sum,
            first_message_originating_time,
            first_message_creation_time,
            last_message_originating_time,
            last_message_creation_time,
            supplemental_type_name,
            supplemental_bytes,
            runtime_types,
        })
    }
}

/// The store-level identity and liveness record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreInfo {
    /// Runtime that wrote the store.
    pub runtime_name: String,
    /// Version of that runtime.
    pub runtime_version: u32,
    /// Serialization system version of the payloads.
    pub serialization_system_version: u32,
    /// True once the writer closed the store cleanly.
    pub closed: bool,
}

impl StoreInfo {
    /// The info record this runtime writes at store creation.
    pub fn current() -> StoreInfo {
        StoreInfo {
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: RUNTIME_VERSION,
            serialization_system_version: tempo_serialization::SERIALIZATION_SYSTEM_VERSION,
            closed: false,
        }
    }

    /// Writes the record.
    pub fn encode(&self, writer: &mut BufferWriter) {
        writer.write_string(&self.runtime_name);
        writer.write_u32(self.runtime_version);
        writer.write_u32(self.serialization_system_version);
        writer.write_u8(self.closed as u8);
    }

    /// Reads the record.
    pub fn decode(reader: &mut BufferReader<'_>) -> Result<StoreInfo, StoreError> {
        Ok(StoreInfo {
            runtime_name: reader.read_string()?,
            runtime_version: reader.read_u32()?,
            serialization_system_version: reader.read_u32()?,
            closed: reader.read_u8()? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StreamMetadata {
        let mut metadata = StreamMetadata::new(3, "audio", "demo::Frame", Time::from_ticks(1_000));
        for i in 0..10i64 {
            let envelope = Envelope::new(
                3,
                i as u64,
                Time::from_ticks(1_000 + i * 100),
                Time::from_ticks(1_050 + i * 100),
            );
            metadata.update(&envelope, 256);
        }
        metadata.supplemental_type_name = Some(String::from("demo::Calibration"));
        metadata.supplemental_bytes = vec![1, 2, 3, 4];
        metadata.runtime_types = vec![String::from("demo::Frame")];
        metadata
    }

    #[test]
    fn current_version_round_trips() {
        let metadata = sample();
        let mut writer = BufferWriter::new();
        metadata.encode(&mut writer);
        let bytes = writer.into_vec();
        let decoded = StreamMetadata::decode(&mut BufferReader::new(&bytes)).unwrap();
        assert_eq!(decoded, metadata);
    }

    fn encode_legacy(metadata: &StreamMetadata, version: u32) -> Vec<u8> {
        let mut writer = BufferWriter::new();
        writer.write_u32(version);
        writer.write_u32(metadata.id);
        writer.write_string(&metadata.name);
        writer.write_string(&metadata.type_name);
        writer.write_i64(metadata.opened_time.ticks());
        writer.write_i64(metadata.closed_time.ticks());
        writer.write_u8(metadata.is_closed as u8);
        writer.write_i32(metadata.message_count as i32);
        writer.write_i32(metadata.average_message_size() as i32);
        writer.write_i32((metadata.average_latency().ticks() / TICKS_PER_MICROSECOND) as i32);
        writer.write_i64(metadata.first_message_originating_time.ticks());
        writer.write_i64(metadata.first_message_creation_time.ticks());
        writer.write_i64(metadata.last_message_originating_time.ticks());
        writer.write_i64(metadata.last_message_creation_time.ticks());
        if version >= 1 {
            match &metadata.supplemental_type_name {
                Some(name) => {
                    writer.write_u8(1);
                    writer.write_string(name);
                    writer.write_bytes(&metadata.supplemental_bytes);
                }
                None => writer.write_u8(0),
            }
        }
        writer.into_vec()
    }

    #[test]
    fn v0_upgrades_to_cumulative_sums() {
        let metadata = sample();
        let bytes = encode_legacy(&metadata, 0);
        let decoded = StreamMetadata::decode(&mut BufferReader::new(&bytes)).unwrap();
        assert_eq!(decoded.message_count, 10);
        assert_eq!(decoded.message_size_cumulative_sum, 256 * 10);
        // Latency survives microsecond quantization: 50 ticks is 5 us.
        assert_eq!(decoded.latency_cumulative_sum, 5 * TICKS_PER_MICROSECOND * 10);
        assert!(decoded.supplemental_type_name.is_none());
        assert!(decoded.runtime_types.is_empty());
    }

    #[test]
    fn v1_carries_supplemental_metadata() {
        let metadata = sample();
        let bytes = encode_legacy(&metadata, 1);
        let decoded = StreamMetadata::decode(&mut BufferReader::new(&bytes)).unwrap();
        assert_eq!(decoded.supplemental_type_name, metadata.supplemental_type_name);
        assert_eq!(decoded.supplemental_bytes, metadata.supplemental_bytes);
    }

    #[test]
    fn newer_version_rejected() {
        let mut writer = BufferWriter::new();
        writer.write_u32(METADATA_VERSION + 1);
        let bytes = writer.into_vec();
        assert!(StreamMetadata::decode(&mut BufferReader::new(&bytes)).is_err());
    }

    #[test]
    fn store_info_round_trips() {
        let mut info = StoreInfo::current();
        info.closed = true;
        let mut writer = BufferWriter::new();
        info.encode(&mut writer);
        let bytes = writer.into_vec();
        let decoded = StoreInfo::decode(&mut BufferReader::new(&bytes)).unwrap();
        assert_eq!(decoded, info);
    }
}

//! Fixed-layout framing of message blocks inside extents.
//!
//! A message block is a 32-byte envelope followed by the payload bytes.

use byteorder::{ByteOrder, LittleEndian};

use tempo_time::{Envelope, Time};

use crate::StoreError;

/// On-disk size of an envelope.
pub const ENVELOPE_SIZE: usize = 32;

/// Encodes an envelope into `out`, which must be [`ENVELOPE_SIZE`] long.
pub fn encode_envelope(envelope: &Envelope, out: &mut [u8]) {
    LittleEndian::write_i64(&mut out[0..8], envelope.originating_time.ticks());
    LittleEndian::write_i64(&mut out[8..16], envelope.creation_time.ticks());
    LittleEndian::write_u32(&mut out[16..20], envelope.source_id);
    LittleEndian::write_u32(&mut out[20..24], 0);
    LittleEndian::write_u64(&mut out[24..32], envelope.sequence_id);
}

/// Decodes an envelope from the head of `input`.
pub fn decode_envelope(input: &[u8]) -> Result<Envelope, StoreError> {
    if input.len() < ENVELOPE_SIZE {
        return Err(StoreError::Integrity(String::from("message block shorter than envelope")));
    }
    Ok(Envelope {
        originating_time: Time::from_ticks(LittleEndian::read_i64(&input[0..8])),
        creation_time: Time::from_ticks(LittleEndian::read_i64(&input[8..16])),
        source_id: LittleEndian::read_u32(&input[16..20]),
        sequence_id: LittleEndian::read_u64(&input[24..32]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let envelope = Envelope::new(9, 1234, Time::from_ticks(55), Time::from_ticks(60));
        let mut bytes = [0u8; ENVELOPE_SIZE];
        encode_envelope(&envelope, &mut bytes);
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }
}

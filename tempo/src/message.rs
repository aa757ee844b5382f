//! The immutable envelope-and-payload unit that moves along edges.

use tempo_time::{Envelope, Time};

/// A timestamped message.
///
/// The payload is immutable once posted; fan-out to several receivers
/// clones it (cheaply, for pooled or reference-counted payloads).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message<T> {
    /// The payload.
    pub data: T,
    /// Routing and timing metadata.
    pub envelope: Envelope,
}

impl<T> Message<T> {
    /// Wraps a payload in an envelope.
    pub fn new(data: T, envelope: Envelope) -> Message<T> {
        Message { data, envelope }
    }

    /// The virtual time of this message at its true origin.
    pub fn originating_time(&self) -> Time {
        self.envelope.originating_time
    }

    /// The virtual time at which the posting emitter created it.
    pub fn creation_time(&self) -> Time {
        self.envelope.creation_time
    }

    /// The posting emitter's identity.
    pub fn source_id(&self) -> u32 {
        self.envelope.source_id
    }

    /// The per-emitter sequence number.
    pub fn sequence_id(&self) -> u64 {
        self.envelope.sequence_id
    }

    /// Maps the payload, keeping the envelope.
    pub fn map<U>(self, transform: impl FnOnce(T) -> U) -> Message<U> {
        Message { data: transform(self.data), envelope: self.envelope }
    }
}
